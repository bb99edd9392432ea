//! Streaming indicators
//!
//! - `VolumeWeightedAveragePrice`: session VWAP anchored to the UTC day
//! - `VolumeAverage`: rolling mean of bar volumes backed by the `ta` SMA
//! - `population_std_dev`: ddof = 0 standard deviation via `statrs`

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use statrs::statistics::Statistics;
use ta::indicators::SimpleMovingAverage;
use ta::{Next, Reset};

use crate::types::Bar;

// =============================================================================
// VWAP
// =============================================================================

/// Day-anchored volume weighted average price.
///
/// Each bar contributes its typical price weighted by its volume. The
/// accumulators reset whenever a bar closes on a different UTC day than the
/// previous one. With zero cumulative volume the value is the last price.
#[derive(Debug, Clone, Default)]
pub struct VolumeWeightedAveragePrice {
    day: Option<NaiveDate>,
    price_volume: f64,
    volume_total: f64,
    value: f64,
    count: usize,
    initialized: bool,
}

impl VolumeWeightedAveragePrice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_bar(&mut self, bar: &Bar) {
        self.update_raw(bar.typical_price(), bar.volume, bar.ts_event);
    }

    pub fn update_raw(&mut self, price: f64, volume: f64, timestamp: DateTime<Utc>) {
        let day = timestamp.date_naive();
        if self.day != Some(day) {
            self.reset();
            self.day = Some(day);
        }

        self.price_volume += price * volume;
        self.volume_total += volume;
        self.count += 1;

        self.value = if self.volume_total == 0.0 {
            price
        } else {
            self.price_volume / self.volume_total
        };
        self.initialized = true;
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Inputs since the last day reset
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// =============================================================================
// Volume average
// =============================================================================

/// Mean of the last `period` volumes; averages fewer values while warming up
#[derive(Debug, Clone)]
pub struct VolumeAverage {
    sma: SimpleMovingAverage,
    period: usize,
    count: usize,
    value: f64,
}

impl VolumeAverage {
    pub fn new(period: usize) -> Result<Self> {
        let sma = SimpleMovingAverage::new(period)
            .map_err(|e| anyhow!("Invalid volume average period {}: {:?}", period, e))?;
        Ok(VolumeAverage {
            sma,
            period,
            count: 0,
            value: 0.0,
        })
    }

    pub fn update(&mut self, volume: f64) -> f64 {
        self.value = self.sma.next(volume);
        self.count = (self.count + 1).min(self.period);
        self.value
    }

    /// Current mean, zero before any input
    pub fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.value
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn reset(&mut self) {
        self.sma.reset();
        self.count = 0;
        self.value = 0.0;
    }
}

// =============================================================================
// Dispersion
// =============================================================================

/// Population standard deviation (divides by N). Zero for empty input.
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().population_std_dev()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_vwap_accumulates_within_day() {
        let mut vwap = VolumeWeightedAveragePrice::new();
        assert!(!vwap.initialized());

        vwap.update_raw(10.0, 100.0, t(1, 0));
        assert!(vwap.initialized());
        assert_relative_eq!(vwap.value(), 10.0);

        vwap.update_raw(20.0, 300.0, t(2, 0));
        // (10*100 + 20*300) / 400
        assert_relative_eq!(vwap.value(), 17.5);
        assert_eq!(vwap.count(), 2);
    }

    #[test]
    fn test_vwap_resets_on_new_day() {
        let mut vwap = VolumeWeightedAveragePrice::new();
        vwap.update_raw(10.0, 100.0, t(23, 45));
        vwap.update_raw(30.0, 100.0, t(23, 45) + Duration::minutes(15));
        assert_relative_eq!(vwap.value(), 30.0);
        assert_eq!(vwap.count(), 1);
        assert!(vwap.initialized());
    }

    #[test]
    fn test_vwap_zero_volume_uses_price() {
        let mut vwap = VolumeWeightedAveragePrice::new();
        vwap.update_raw(12.5, 0.0, t(0, 15));
        assert_relative_eq!(vwap.value(), 12.5);
        vwap.update_raw(13.5, 0.0, t(0, 30));
        assert_relative_eq!(vwap.value(), 13.5);
    }

    #[test]
    fn test_volume_average_warmup_and_window() {
        let mut avg = VolumeAverage::new(3).unwrap();
        assert_eq!(avg.value(), 0.0);
        assert!(avg.is_empty());

        avg.update(10.0);
        assert_relative_eq!(avg.value(), 10.0);
        avg.update(20.0);
        assert_relative_eq!(avg.value(), 15.0);
        avg.update(30.0);
        assert_relative_eq!(avg.value(), 20.0);
        avg.update(40.0);
        assert_relative_eq!(avg.value(), 30.0);
        assert_eq!(avg.len(), 3);

        assert!(VolumeAverage::new(0).is_err());
    }

    #[test]
    fn test_population_std_dev() {
        assert_eq!(population_std_dev(&[]), 0.0);
        assert_relative_eq!(
            population_std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]),
            2.0
        );
    }
}
