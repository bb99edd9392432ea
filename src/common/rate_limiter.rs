//! Token bucket rate limiter for REST requests
//!
//! The bucket holds `capacity` tokens and is topped up to capacity once per
//! `refill_interval`. Each request consumes one token.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub capacity: usize,
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            capacity: 10,
            refill_interval: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_rate(mut self, requests_per_interval: usize) -> Self {
        self.capacity = requests_per_interval;
        self
    }

    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }
}

/// Cheap to clone; clones share one bucket
#[derive(Debug, Clone)]
pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    capacity: usize,
    last_refill: Arc<Mutex<Instant>>,
    refill_interval: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        RateLimiter {
            tokens: Arc::new(Semaphore::new(config.capacity)),
            capacity: config.capacity,
            last_refill: Arc::new(Mutex::new(Instant::now())),
            refill_interval: config.refill_interval,
        }
    }

    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    async fn refill(&self) {
        let mut last = self.last_refill.lock().await;
        if last.elapsed() >= self.refill_interval {
            let missing = self.capacity.saturating_sub(self.tokens.available_permits());
            if missing > 0 {
                self.tokens.add_permits(missing);
            }
            *last = Instant::now();
        }
    }

    /// Wait for a token and consume it
    pub async fn acquire(&self) {
        loop {
            self.refill().await;
            if let Ok(permit) = self.tokens.try_acquire() {
                permit.forget();
                return;
            }
            tokio::time::sleep(self.refill_interval / 10).await;
        }
    }

    /// Consume a token if one is available right now
    pub async fn try_acquire(&self) -> bool {
        self.refill().await;
        match self.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_exhausts() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::default()
                .with_rate(2)
                .with_refill_interval(Duration::from_secs(60)),
        );
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.available(), 0);
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_refill_and_shared_bucket() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::default()
                .with_rate(1)
                .with_refill_interval(Duration::from_millis(20)),
        );
        let clone = limiter.clone();
        assert!(clone.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.try_acquire().await);
    }
}
