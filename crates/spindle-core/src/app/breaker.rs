//! CircuitBreaker - エラー率による自動停止
//!
//! Stateless over the counters: the scheduler owns `total_processed` and
//! `total_errors` and asks after every settlement whether to halt.

use std::fmt;

use super::config::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreaker {
    threshold: f64,
    min_processed: u64,
}

/// A tripped breaker: the numbers that caused it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trip {
    pub rate: f64,
    pub processed: u64,
    pub errors: u64,
    pub threshold: f64,
}

impl fmt::Display for Trip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error rate {:.2} over {} tasks (threshold {})",
            self.rate, self.processed, self.threshold
        )
    }
}

impl CircuitBreaker {
    pub fn new(threshold: f64, min_processed: u64) -> Self {
        Self {
            threshold,
            min_processed,
        }
    }

    /// The breaker only exists when both a threshold and a minimum sample
    /// size are configured (and non-zero).
    pub fn from_config(config: &SchedulerConfig) -> Option<Self> {
        match (config.error_rate_threshold, config.min_processed_before_stop) {
            (Some(threshold), Some(min_processed)) if threshold > 0.0 && min_processed > 0 => {
                Some(Self::new(threshold, min_processed))
            }
            _ => None,
        }
    }

    pub fn evaluate(&self, processed: u64, errors: u64) -> Option<Trip> {
        if processed == 0 || processed < self.min_processed {
            return None;
        }
        let rate = errors as f64 / processed as f64;
        (rate >= self.threshold).then_some(Trip {
            rate,
            processed,
            errors,
            threshold: self.threshold,
        })
    }
}
