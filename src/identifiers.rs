//! Identifiers for instruments, bar types, positions and orders
//!
//! Bar types use the `{instrument_id}-{step}-{aggregation}-{price_type}-{source}`
//! form, e.g. `ADAUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL`. An internal bar
//! type may carry an `@{step}-{aggregation}-{source}` suffix naming the lower
//! bar type it is aggregated from.

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing identifiers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("invalid instrument id '{0}', expected SYMBOL.VENUE")]
    InvalidInstrumentId(String),

    #[error("invalid bar type '{value}': {reason}")]
    InvalidBarType { value: String, reason: String },
}

fn bar_type_error(value: &str, reason: impl Into<String>) -> IdentifierError {
    IdentifierError::InvalidBarType {
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Serialize/deserialize an identifier through its string form
macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                value.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

// =============================================================================
// InstrumentId
// =============================================================================

/// Instrument identifier, `{symbol}.{venue}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentId {
    symbol: String,
    venue: String,
}

impl InstrumentId {
    pub fn new(symbol: impl Into<String>, venue: impl Into<String>) -> Self {
        InstrumentId {
            symbol: symbol.into(),
            venue: venue.into(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }
}

impl FromStr for InstrumentId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((symbol, venue)) if !symbol.is_empty() && !venue.is_empty() => {
                Ok(InstrumentId::new(symbol, venue))
            }
            _ => Err(IdentifierError::InvalidInstrumentId(s.to_string())),
        }
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.symbol, self.venue)
    }
}

string_serde!(InstrumentId);

// =============================================================================
// Bar specification parts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarAggregation {
    Second,
    Minute,
    Hour,
    Day,
}

impl BarAggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarAggregation::Second => "SECOND",
            BarAggregation::Minute => "MINUTE",
            BarAggregation::Hour => "HOUR",
            BarAggregation::Day => "DAY",
        }
    }

    /// Length of one aggregation unit
    pub fn unit(&self) -> Duration {
        match self {
            BarAggregation::Second => Duration::seconds(1),
            BarAggregation::Minute => Duration::minutes(1),
            BarAggregation::Hour => Duration::hours(1),
            BarAggregation::Day => Duration::days(1),
        }
    }
}

impl FromStr for BarAggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SECOND" => Ok(BarAggregation::Second),
            "MINUTE" => Ok(BarAggregation::Minute),
            "HOUR" => Ok(BarAggregation::Hour),
            "DAY" => Ok(BarAggregation::Day),
            other => Err(format!("unsupported aggregation '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceType {
    Bid,
    Ask,
    Mid,
    Last,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceType::Bid => "BID",
            PriceType::Ask => "ASK",
            PriceType::Mid => "MID",
            PriceType::Last => "LAST",
        }
    }
}

impl FromStr for PriceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BID" => Ok(PriceType::Bid),
            "ASK" => Ok(PriceType::Ask),
            "MID" => Ok(PriceType::Mid),
            "LAST" => Ok(PriceType::Last),
            other => Err(format!("unsupported price type '{}'", other)),
        }
    }
}

/// Where bars of a bar type come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationSource {
    /// Delivered by the venue or the catalog
    External,
    /// Built locally by aggregating a lower bar type
    Internal,
}

impl AggregationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationSource::External => "EXTERNAL",
            AggregationSource::Internal => "INTERNAL",
        }
    }
}

impl FromStr for AggregationSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXTERNAL" => Ok(AggregationSource::External),
            "INTERNAL" => Ok(AggregationSource::Internal),
            other => Err(format!("unsupported aggregation source '{}'", other)),
        }
    }
}

/// `{step}-{aggregation}-{price_type}`, e.g. `15-MINUTE-LAST`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarSpecification {
    pub step: u32,
    pub aggregation: BarAggregation,
    pub price_type: PriceType,
}

impl BarSpecification {
    pub fn new(step: u32, aggregation: BarAggregation, price_type: PriceType) -> Self {
        BarSpecification {
            step,
            aggregation,
            price_type,
        }
    }

    /// Time covered by one bar
    pub fn interval(&self) -> Duration {
        self.aggregation.unit() * self.step as i32
    }
}

impl fmt::Display for BarSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.step,
            self.aggregation.as_str(),
            self.price_type.as_str()
        )
    }
}

impl FromStr for BarSpecification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 3 {
            return Err(format!("expected STEP-AGGREGATION-PRICE_TYPE, got '{}'", s));
        }
        let step = parse_step(parts[0])?;
        Ok(BarSpecification::new(step, parts[1].parse()?, parts[2].parse()?))
    }
}

fn parse_step(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(step) if step > 0 => Ok(step),
        _ => Err(format!("step must be a positive integer, got '{}'", value)),
    }
}

// =============================================================================
// BarType
// =============================================================================

/// Lower bar type an internal bar type is aggregated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CompositeSpec {
    step: u32,
    aggregation: BarAggregation,
    source: AggregationSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarType {
    instrument_id: InstrumentId,
    spec: BarSpecification,
    source: AggregationSource,
    composite: Option<CompositeSpec>,
}

impl BarType {
    pub fn new(
        instrument_id: InstrumentId,
        spec: BarSpecification,
        source: AggregationSource,
    ) -> Self {
        BarType {
            instrument_id,
            spec,
            source,
            composite: None,
        }
    }

    /// Attach the lower bar type this one is aggregated from
    pub fn aggregated_from(
        mut self,
        step: u32,
        aggregation: BarAggregation,
        source: AggregationSource,
    ) -> Self {
        self.composite = Some(CompositeSpec {
            step,
            aggregation,
            source,
        });
        self
    }

    pub fn instrument_id(&self) -> &InstrumentId {
        &self.instrument_id
    }

    pub fn spec(&self) -> BarSpecification {
        self.spec
    }

    pub fn source(&self) -> AggregationSource {
        self.source
    }

    pub fn is_composite(&self) -> bool {
        self.composite.is_some()
    }

    /// The bar type without its composite suffix
    pub fn standard(&self) -> BarType {
        BarType {
            composite: None,
            ..self.clone()
        }
    }

    /// The lower bar type this one is built from, if any
    pub fn composite_source(&self) -> Option<BarType> {
        self.composite.map(|c| {
            BarType::new(
                self.instrument_id.clone(),
                BarSpecification::new(c.step, c.aggregation, self.spec.price_type),
                c.source,
            )
        })
    }
}

impl FromStr for BarType {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (main, composite) = match s.split_once('@') {
            Some((main, rest)) => (main, Some(rest)),
            None => (s, None),
        };

        // Parse from the right so symbols containing '-' survive
        let mut parts = main.rsplitn(5, '-');
        let source = parts.next().unwrap_or_default();
        let price_type = parts.next();
        let aggregation = parts.next();
        let step = parts.next();
        let instrument = parts.next();

        let (Some(price_type), Some(aggregation), Some(step), Some(instrument)) =
            (price_type, aggregation, step, instrument)
        else {
            return Err(bar_type_error(
                s,
                "expected INSTRUMENT-STEP-AGGREGATION-PRICE_TYPE-SOURCE",
            ));
        };

        let instrument_id: InstrumentId = instrument
            .parse()
            .map_err(|_| bar_type_error(s, format!("bad instrument id '{}'", instrument)))?;
        let step = parse_step(step).map_err(|e| bar_type_error(s, e))?;
        let spec = BarSpecification::new(
            step,
            aggregation.parse().map_err(|e: String| bar_type_error(s, e))?,
            price_type.parse().map_err(|e: String| bar_type_error(s, e))?,
        );
        let source = source.parse().map_err(|e: String| bar_type_error(s, e))?;

        let mut bar_type = BarType::new(instrument_id, spec, source);

        if let Some(composite) = composite {
            let parts: Vec<&str> = composite.split('-').collect();
            if parts.len() != 3 {
                return Err(bar_type_error(
                    s,
                    "composite part must be STEP-AGGREGATION-SOURCE",
                ));
            }
            let step = parse_step(parts[0]).map_err(|e| bar_type_error(s, e))?;
            let aggregation = parts[1].parse().map_err(|e: String| bar_type_error(s, e))?;
            let source = parts[2].parse().map_err(|e: String| bar_type_error(s, e))?;
            bar_type = bar_type.aggregated_from(step, aggregation, source);
        }

        Ok(bar_type)
    }
}

impl fmt::Display for BarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.instrument_id,
            self.spec,
            self.source.as_str()
        )?;
        if let Some(c) = &self.composite {
            write!(
                f,
                "@{}-{}-{}",
                c.step,
                c.aggregation.as_str(),
                c.source.as_str()
            )?;
        }
        Ok(())
    }
}

string_serde!(BarType);

// =============================================================================
// Trader, strategy, position and order ids
// =============================================================================

macro_rules! tagged_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

tagged_id!(
    /// Trader identifier, e.g. `VWAP-TRADER-001`
    TraderId
);
tagged_id!(
    /// Strategy identifier, `{name}-{order_id_tag}`
    StrategyId
);
tagged_id!(
    /// Position identifier; one per instrument and strategy under netting
    PositionId
);
tagged_id!(ClientOrderId);
tagged_id!(VenueOrderId);
tagged_id!(TradeId);

impl TraderId {
    /// Trailing tag used inside client order ids (`001` for `VWAP-TRADER-001`)
    pub fn tag(&self) -> &str {
        self.0.rsplit('-').next().unwrap_or(&self.0)
    }
}

impl StrategyId {
    pub fn tag(&self) -> &str {
        self.0.rsplit('-').next().unwrap_or(&self.0)
    }
}

impl PositionId {
    /// Netting position id for an instrument and strategy
    pub fn netting(instrument_id: &InstrumentId, strategy_id: &StrategyId) -> Self {
        PositionId(format!("{}-{}", instrument_id, strategy_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_id_parsing() {
        let id: InstrumentId = "ADAUSDT-PERP.BINANCE".parse().unwrap();
        assert_eq!(id.symbol(), "ADAUSDT-PERP");
        assert_eq!(id.venue(), "BINANCE");
        assert_eq!(id.to_string(), "ADAUSDT-PERP.BINANCE");

        assert!("ADAUSDT".parse::<InstrumentId>().is_err());
        assert!(".BINANCE".parse::<InstrumentId>().is_err());
        assert!("ADAUSDT.".parse::<InstrumentId>().is_err());
    }

    #[test]
    fn test_bar_type_with_dashed_symbol() {
        let bt: BarType = "ADAUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL".parse().unwrap();
        assert_eq!(bt.instrument_id().symbol(), "ADAUSDT-PERP");
        assert_eq!(bt.spec().step, 1);
        assert_eq!(bt.spec().aggregation, BarAggregation::Minute);
        assert_eq!(bt.spec().price_type, PriceType::Last);
        assert_eq!(bt.source(), AggregationSource::External);
        assert_eq!(bt.to_string(), "ADAUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL");
    }

    #[test]
    fn test_composite_bar_type() {
        let raw = "ADAUSDT-PERP.BINANCE-15-MINUTE-LAST-INTERNAL@1-MINUTE-EXTERNAL";
        let bt: BarType = raw.parse().unwrap();
        assert!(bt.is_composite());
        assert_eq!(bt.to_string(), raw);
        assert_eq!(
            bt.standard().to_string(),
            "ADAUSDT-PERP.BINANCE-15-MINUTE-LAST-INTERNAL"
        );
        assert_eq!(
            bt.composite_source().unwrap().to_string(),
            "ADAUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL"
        );
    }

    #[test]
    fn test_invalid_bar_types() {
        assert!("ADAUSDT-PERP.BINANCE-0-MINUTE-LAST-EXTERNAL"
            .parse::<BarType>()
            .is_err());
        assert!("ADAUSDT-PERP.BINANCE-1-WEEK-LAST-EXTERNAL"
            .parse::<BarType>()
            .is_err());
        assert!("1-MINUTE-LAST-EXTERNAL".parse::<BarType>().is_err());
        assert!("ADAUSDT-PERP.BINANCE-15-MINUTE-LAST-INTERNAL@1-MINUTE"
            .parse::<BarType>()
            .is_err());
    }

    #[test]
    fn test_bar_interval() {
        let spec: BarSpecification = "4-HOUR-LAST".parse().unwrap();
        assert_eq!(spec.interval(), Duration::hours(4));
        let spec: BarSpecification = "15-MINUTE-LAST".parse().unwrap();
        assert_eq!(spec.interval(), Duration::minutes(15));
    }

    #[test]
    fn test_position_and_tags() {
        let instrument: InstrumentId = "LTCUSDT-PERP.BINANCE".parse().unwrap();
        let strategy = StrategyId::new("VWAPMultiTimeframe-000");
        assert_eq!(
            PositionId::netting(&instrument, &strategy).as_str(),
            "LTCUSDT-PERP.BINANCE-VWAPMultiTimeframe-000"
        );
        assert_eq!(TraderId::new("VWAP-TRADER-001").tag(), "001");
        assert_eq!(strategy.tag(), "000");
    }

    #[test]
    fn test_serde_as_string() {
        let bt: BarType = "SUIUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL".parse().unwrap();
        let json = serde_json::to_string(&bt).unwrap();
        assert_eq!(json, "\"SUIUSDT-PERP.BINANCE-1-MINUTE-LAST-EXTERNAL\"");
        let back: BarType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bt);
    }
}
