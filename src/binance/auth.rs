//! API credentials and request signing

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::types::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_ENV: &str = "BINANCE_FUTURES_API_KEY";
pub const API_SECRET_ENV: &str = "BINANCE_FUTURES_API_SECRET";

#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Credentials {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read `BINANCE_FUTURES_API_KEY` / `BINANCE_FUTURES_API_SECRET`
    pub fn from_env() -> Result<Self, ExchangeError> {
        let key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ExchangeError::MissingCredentials(API_KEY_ENV))?;
        let secret = std::env::var(API_SECRET_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ExchangeError::MissingCredentials(API_SECRET_ENV))?;
        Ok(Credentials::new(key, secret))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Hex HMAC-SHA256 of the query string
    pub fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Signing(e.to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
