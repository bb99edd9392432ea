//! Instrument lookup for the live node

use std::collections::HashMap;

use tracing::info;

use super::client::BinanceFuturesClient;
use super::types::ExchangeError;
use crate::identifiers::InstrumentId;
use crate::instrument::Instrument;

pub trait InstrumentProvider {
    fn find(&self, id: &InstrumentId) -> Option<Instrument>;

    fn list_all(&self) -> Vec<Instrument>;
}

/// Instruments loaded once from `/fapi/v1/exchangeInfo`
#[derive(Debug, Default, Clone)]
pub struct BinanceFuturesInstrumentProvider {
    instruments: HashMap<InstrumentId, Instrument>,
}

impl BinanceFuturesInstrumentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load_all(&mut self, client: &BinanceFuturesClient) -> Result<usize, ExchangeError> {
        let instruments = client.instruments().await?;
        self.instruments = instruments.into_iter().map(|i| (i.id.clone(), i)).collect();
        info!("Loaded {} instruments from Binance futures", self.instruments.len());
        Ok(self.instruments.len())
    }
}

impl InstrumentProvider for BinanceFuturesInstrumentProvider {
    fn find(&self, id: &InstrumentId) -> Option<Instrument> {
        self.instruments.get(id).cloned()
    }

    fn list_all(&self) -> Vec<Instrument> {
        let mut all: Vec<_> = self.instruments.values().cloned().collect();
        all.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));
        all
    }
}

/// Fixed set of instruments, used by backtests and tests
#[derive(Debug, Default, Clone)]
pub struct StaticInstrumentProvider {
    instruments: HashMap<InstrumentId, Instrument>,
}

impl StaticInstrumentProvider {
    pub fn new(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        StaticInstrumentProvider {
            instruments: instruments.into_iter().map(|i| (i.id.clone(), i)).collect(),
        }
    }
}

impl InstrumentProvider for StaticInstrumentProvider {
    fn find(&self, id: &InstrumentId) -> Option<Instrument> {
        self.instruments.get(id).cloned()
    }

    fn list_all(&self) -> Vec<Instrument> {
        let mut all: Vec<_> = self.instruments.values().cloned().collect();
        all.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));
        all
    }
}
