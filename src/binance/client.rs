//! Binance USDT-M futures REST client
//!
//! Every request passes the circuit breaker and the rate limiter, and is
//! retried with exponential backoff (`retry_delay`, doubled per attempt) when
//! the failure is transient. Order placement is sent once. Signed endpoints
//! append `timestamp` and `recvWindow` and sign the query with HMAC-SHA256.
//!
//! # Example
//! ```no_run
//! use vwap_trader::binance::{BinanceFuturesClient, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = BinanceFuturesClient::new(ClientConfig::default(), None)?;
//!     let klines = client.get_klines("ADAUSDT", "1m", None, None, Some(10)).await?;
//!     println!("Fetched {} klines", klines.len());
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::auth::Credentials;
use super::types::*;
use crate::common::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
use crate::instrument::Instrument;
use crate::types::OrderSide;

pub const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
pub const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Maximum klines per request
pub const MAX_KLINES_PER_REQUEST: u32 = 1000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub recv_window: u64,
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: FUTURES_BASE_URL.to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            recv_window: 5000,
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_testnet(mut self, testnet: bool) -> Self {
        self.base_url = if testnet {
            FUTURES_TESTNET_URL
        } else {
            FUTURES_BASE_URL
        }
        .to_string();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Clone)]
pub struct BinanceFuturesClient {
    http: Client,
    config: ClientConfig,
    credentials: Option<Credentials>,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    rate_limiter: RateLimiter,
}

type Params = Vec<(&'static str, String)>;

fn encode_query(params: &[(&'static str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

impl BinanceFuturesClient {
    /// Public endpoints work without credentials
    pub fn new(config: ClientConfig, credentials: Option<Credentials>) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(BinanceFuturesClient {
            http,
            circuit_breaker: Arc::new(Mutex::new(CircuitBreaker::new(
                config.circuit_breaker.clone(),
            ))),
            rate_limiter: RateLimiter::new(config.rate_limiter.clone()),
            config,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn build_query(&self, params: &Params, signed: bool) -> Result<String, ExchangeError> {
        if !signed {
            return Ok(encode_query(params));
        }
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(ExchangeError::MissingCredentials("api credentials"))?;
        let mut all = params.clone();
        all.push(("recvWindow", self.config.recv_window.to_string()));
        all.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = encode_query(&all);
        let signature = credentials.sign(&query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: &Method,
        path: &str,
        params: &Params,
        signed: bool,
    ) -> Result<T, ExchangeError> {
        let query = self.build_query(params, signed)?;
        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url, path)
        } else {
            format!("{}{}?{}", self.config.base_url, path, query)
        };

        let mut request = self.http.request(method.clone(), &url);
        if let Some(credentials) = &self.credentials {
            request = request.header("X-MBX-APIKEY", credentials.api_key());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let (code, msg) = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|e| (e.code, e.msg))
                .unwrap_or((0, text));
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                code,
                msg,
            });
        }

        serde_json::from_str(&text).map_err(|e| ExchangeError::Parse(format!("{}: {}", path, e)))
    }

    /// Send with circuit breaker, rate limiting and retries
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Params,
        signed: bool,
    ) -> Result<T, ExchangeError> {
        self.request_with_retries(method, path, params, signed, self.config.max_retries)
            .await
    }

    async fn request_with_retries<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Params,
        signed: bool,
        max_retries: u32,
    ) -> Result<T, ExchangeError> {
        if !self.circuit_breaker.lock().await.can_attempt() {
            return Err(ExchangeError::CircuitOpen);
        }

        let mut attempt = 0;
        loop {
            self.rate_limiter.acquire().await;
            match self.send_once(&method, path, &params, signed).await {
                Ok(value) => {
                    self.circuit_breaker.lock().await.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    let delay = self.config.retry_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "{} {} failed (attempt {}/{}): {}; retrying in {:?}",
                        method,
                        path,
                        attempt,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.circuit_breaker.lock().await.record_failure();
                    }
                    return Err(e);
                }
            }
        }
    }

    // ==================== PUBLIC ENDPOINTS ====================

    pub async fn ping(&self) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self.request(Method::GET, "/fapi/v1/ping", vec![], false).await?;
        Ok(())
    }

    pub async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct TimeResponse {
            server_time: i64,
        }
        let resp: TimeResponse = self.request(Method::GET, "/fapi/v1/time", vec![], false).await?;
        DateTime::from_timestamp_millis(resp.server_time)
            .ok_or_else(|| ExchangeError::Parse(format!("invalid server time {}", resp.server_time)))
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<BinanceKline>, ExchangeError> {
        let mut params: Params = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
        ];
        if let Some(start) = start_time {
            params.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_time {
            params.push(("endTime", end.to_string()));
        }
        let limit = limit.unwrap_or(MAX_KLINES_PER_REQUEST).min(MAX_KLINES_PER_REQUEST);
        params.push(("limit", limit.to_string()));

        debug!("Fetching klines: symbol={}, interval={}, limit={}", symbol, interval, limit);

        let raw: Vec<Vec<serde_json::Value>> =
            self.request(Method::GET, "/fapi/v1/klines", params, false).await?;
        Ok(raw.iter().filter_map(|row| BinanceKline::from_raw(row)).collect())
    }

    /// Paginate klines over `[start, end]`, sorted and unique by open time
    pub async fn fetch_history(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BinanceKline>, ExchangeError> {
        let end_ms = end.timestamp_millis();
        let mut cursor = start.timestamp_millis();
        let mut all = Vec::new();

        info!("Fetching {} {} klines from {} to {}", symbol, interval, start, end);

        while cursor < end_ms {
            let batch = self
                .get_klines(symbol, interval, Some(cursor), Some(end_ms), Some(MAX_KLINES_PER_REQUEST))
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.open_time + 1;
            let full_page = batch.len() as u32 == MAX_KLINES_PER_REQUEST;
            all.extend(batch);
            if !full_page {
                break;
            }
        }

        all.sort_by_key(|k| k.open_time);
        all.dedup_by_key(|k| k.open_time);
        info!("Fetched {} klines for {} {}", all.len(), symbol, interval);
        Ok(all)
    }

    pub async fn exchange_info(&self) -> Result<ExchangeInfo, ExchangeError> {
        self.request(Method::GET, "/fapi/v1/exchangeInfo", vec![], false).await
    }

    /// All perpetual contracts as instruments
    pub async fn instruments(&self) -> Result<Vec<Instrument>, ExchangeError> {
        let info = self.exchange_info().await?;
        Ok(info
            .symbols
            .iter()
            .filter(|s| s.status == "TRADING")
            .filter_map(SymbolInfo::to_instrument)
            .collect())
    }

    // ==================== SIGNED ENDPOINTS ====================

    pub async fn balances(&self) -> Result<Vec<FuturesBalance>, ExchangeError> {
        self.request(Method::GET, "/fapi/v2/balance", vec![], true).await
    }

    pub async fn position_risk(&self, symbol: &str) -> Result<Vec<PositionRisk>, ExchangeError> {
        self.request(
            Method::GET,
            "/fapi/v2/positionRisk",
            vec![("symbol", symbol.to_string())],
            true,
        )
        .await
    }

    pub async fn user_trades(
        &self,
        symbol: &str,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<UserTrade>, ExchangeError> {
        let mut params: Params = vec![("symbol", symbol.to_string())];
        if let Some(start) = start_time {
            params.push(("startTime", start.timestamp_millis().to_string()));
        }
        self.request(Method::GET, "/fapi/v1/userTrades", params, true).await
    }

    /// Market order; the response carries the fill (`newOrderRespType=RESULT`).
    ///
    /// Sent once: a lost response may hide an executed order, see [`Self::query_order`].
    pub async fn new_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: &str,
        reduce_only: bool,
    ) -> Result<OrderResponse, ExchangeError> {
        let mut params: Params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newClientOrderId", client_order_id.to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        self.request_with_retries(Method::POST, "/fapi/v1/order", params, true, 0)
            .await
    }

    /// Order status by client order id
    pub async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<OrderResponse, ExchangeError> {
        self.request(
            Method::GET,
            "/fapi/v1/order",
            vec![
                ("symbol", symbol.to_string()),
                ("origClientOrderId", client_order_id.to_string()),
            ],
            true,
        )
        .await
    }

    pub async fn change_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
                true,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testnet_switches_base_url() {
        let client = BinanceFuturesClient::new(ClientConfig::default().with_testnet(true), None).unwrap();
        assert_eq!(client.base_url(), FUTURES_TESTNET_URL);
    }

    #[test]
    fn test_signed_query_requires_credentials() {
        let client = BinanceFuturesClient::new(ClientConfig::default(), None).unwrap();
        let params: Params = vec![("symbol", "ADAUSDT".to_string())];
        assert_eq!(client.build_query(&params, false).unwrap(), "symbol=ADAUSDT");
        assert!(matches!(
            client.build_query(&params, true),
            Err(ExchangeError::MissingCredentials(_))
        ));
    }

    #[test]
    fn test_signed_query_layout() {
        let client = BinanceFuturesClient::new(
            ClientConfig::default(),
            Some(Credentials::new("key", "secret")),
        )
        .unwrap();
        let params: Params = vec![("symbol", "ADAUSDT".to_string())];
        let query = client.build_query(&params, true).unwrap();
        assert!(query.starts_with("symbol=ADAUSDT&recvWindow=5000&timestamp="));
        let signature = query.rsplit_once("&signature=").unwrap().1;
        assert_eq!(signature.len(), 64);
    }
}
