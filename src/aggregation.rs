//! Bar aggregation and subscription routing
//!
//! Internal bar types (e.g. 15-minute, 4-hour) are built from the external
//! 1-minute stream. Buckets are aligned to the UNIX epoch, so 4-hour bars
//! close at 00:00, 04:00, ... UTC.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::identifiers::{AggregationSource, BarType};
use crate::types::Bar;

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("bar type {0} is internal but names no source to aggregate from")]
    MissingSource(String),

    #[error("cannot build {target} from {from}: interval is not a whole multiple")]
    IncompatibleIntervals { target: String, from: String },
}

#[derive(Debug, Clone)]
struct PartialBar {
    bucket_start: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl PartialBar {
    fn start(bucket_start: DateTime<Utc>, bar: &Bar) -> Self {
        PartialBar {
            bucket_start,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }

    fn update(&mut self, bar: &Bar) {
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.close = bar.close;
        self.volume += bar.volume;
    }
}

/// Builds one internal bar type out of a lower external bar type
#[derive(Debug, Clone)]
pub struct TimeBarAggregator {
    bar_type: BarType,
    source: BarType,
    interval: Duration,
    partial: Option<PartialBar>,
}

impl TimeBarAggregator {
    /// `bar_type` must be a composite such as `...-15-MINUTE-LAST-INTERNAL@1-MINUTE-EXTERNAL`
    pub fn new(bar_type: &BarType) -> Result<Self, AggregationError> {
        let source = bar_type
            .composite_source()
            .ok_or_else(|| AggregationError::MissingSource(bar_type.to_string()))?;

        let interval = bar_type.spec().interval();
        let source_interval = source.spec().interval();
        let interval_ms = interval.num_milliseconds();
        let source_ms = source_interval.num_milliseconds();
        if source_ms <= 0 || interval_ms < source_ms || interval_ms % source_ms != 0 {
            return Err(AggregationError::IncompatibleIntervals {
                target: bar_type.standard().to_string(),
                from: source.to_string(),
            });
        }

        Ok(TimeBarAggregator {
            bar_type: bar_type.standard(),
            source,
            interval,
            partial: None,
        })
    }

    pub fn bar_type(&self) -> &BarType {
        &self.bar_type
    }

    pub fn source(&self) -> &BarType {
        &self.source
    }

    fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.interval.num_milliseconds();
        let ms = ts.timestamp_millis();
        let start = ms - ms.rem_euclid(step);
        DateTime::from_timestamp_millis(start).unwrap_or(ts)
    }

    /// Feed one source bar; returns the bars completed by it (at most two)
    pub fn handle_bar(&mut self, bar: &Bar) -> Vec<Bar> {
        let mut completed = Vec::new();
        let bucket = self.bucket_start(bar.ts_open());

        match self.partial.as_ref().map(|p| p.bucket_start) {
            Some(start) if start == bucket => {
                if let Some(partial) = self.partial.as_mut() {
                    partial.update(bar);
                }
            }
            Some(start) if start > bucket => {
                warn!(
                    "Dropping out-of-order bar {} at {} for {}",
                    bar.bar_type, bar.ts_event, self.bar_type
                );
                return completed;
            }
            _ => {
                // A later bucket started while the previous one was incomplete
                if let Some(stale) = self.partial.take() {
                    debug!("Flushing incomplete {} bucket at {}", self.bar_type, stale.bucket_start);
                    completed.push(self.build(stale));
                }
                self.partial = Some(PartialBar::start(bucket, bar));
            }
        }

        if bar.ts_event >= bucket + self.interval {
            if let Some(partial) = self.partial.take() {
                completed.push(self.build(partial));
            }
        }

        completed
    }

    fn build(&self, partial: PartialBar) -> Bar {
        Bar {
            bar_type: self.bar_type.clone(),
            open: partial.open,
            high: partial.high,
            low: partial.low,
            close: partial.close,
            volume: partial.volume,
            ts_event: partial.bucket_start + self.interval,
        }
    }
}

/// Routes incoming external bars to subscribers and aggregators
#[derive(Debug, Clone, Default)]
pub struct DataEngine {
    external: Vec<BarType>,
    aggregators: Vec<TimeBarAggregator>,
}

impl DataEngine {
    pub fn new(subscriptions: &[BarType]) -> Result<Self, AggregationError> {
        let mut engine = DataEngine::default();
        for bar_type in subscriptions {
            engine.subscribe(bar_type)?;
        }
        Ok(engine)
    }

    pub fn subscribe(&mut self, bar_type: &BarType) -> Result<(), AggregationError> {
        if bar_type.is_composite() {
            let aggregator = TimeBarAggregator::new(bar_type)?;
            if !self
                .aggregators
                .iter()
                .any(|a| a.bar_type() == aggregator.bar_type())
            {
                self.aggregators.push(aggregator);
            }
        } else if bar_type.source() == AggregationSource::Internal {
            return Err(AggregationError::MissingSource(bar_type.to_string()));
        } else if !self.external.contains(bar_type) {
            self.external.push(bar_type.clone());
        }
        Ok(())
    }

    /// External bar types that must be fed in, including aggregation sources
    pub fn source_bar_types(&self) -> Vec<BarType> {
        let mut sources = self.external.clone();
        for aggregator in &self.aggregators {
            if !sources.contains(aggregator.source()) {
                sources.push(aggregator.source().clone());
            }
        }
        sources
    }

    /// Process one external bar.
    ///
    /// Returns the bar itself when subscribed, followed by any internal bars
    /// it completed in subscription order.
    pub fn process(&mut self, bar: &Bar) -> Vec<Bar> {
        let mut out = Vec::new();
        if self.external.contains(&bar.bar_type) {
            out.push(bar.clone());
        }
        for aggregator in self.aggregators.iter_mut() {
            if aggregator.source() == &bar.bar_type {
                out.extend(aggregator.handle_bar(bar));
            }
        }
        out
    }
}
