//! Scheduler configuration.
//!
//! `SchedulerConfig` is the full, validated configuration. `SchedulerOptions`
//! is a partial update merged into a running scheduler by `configure`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_PARALLEL: usize = 5;

/// What the scheduler does with a claimed task whose type has no executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingExecutorPolicy {
    /// Mark the task failed. Counts as a processed error.
    #[default]
    Fail,
    /// Put the task back to pending and end the current tick.
    Release,
    /// Leave it in_progress for manual intervention.
    Leave,
}

impl fmt::Display for MissingExecutorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MissingExecutorPolicy::Fail => "fail",
            MissingExecutorPolicy::Release => "release",
            MissingExecutorPolicy::Leave => "leave",
        })
    }
}

impl FromStr for MissingExecutorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(MissingExecutorPolicy::Fail),
            "release" => Ok(MissingExecutorPolicy::Release),
            "leave" => Ok(MissingExecutorPolicy::Leave),
            other => Err(format!("expected fail, release or leave, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub max_parallel: usize,

    /// Error rate (0..=1) at which the circuit breaker trips.
    pub error_rate_threshold: Option<f64>,

    /// Settled tasks required before the breaker is evaluated at all.
    pub min_processed_before_stop: Option<u64>,

    /// Fail a dispatched task whose completion has not arrived in time.
    /// `None` waits forever.
    pub completion_timeout_ms: Option<u64>,

    pub missing_executor: MissingExecutorPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_parallel: DEFAULT_MAX_PARALLEL,
            error_rate_threshold: None,
            min_processed_before_stop: None,
            completion_timeout_ms: None,
            missing_executor: MissingExecutorPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", self.poll_interval_ms, "must be greater than 0"));
        }
        if self.max_parallel == 0 {
            return Err(invalid("max_parallel", self.max_parallel, "must be greater than 0"));
        }
        if let Some(threshold) = self.error_rate_threshold
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(invalid("error_rate_threshold", threshold, "must be within 0..=1"));
        }
        if self.completion_timeout_ms == Some(0) {
            return Err(invalid("completion_timeout_ms", 0, "must be greater than 0"));
        }
        Ok(())
    }

    /// Merge a partial update. Fields left `None` in `options` keep their
    /// current value.
    pub fn merge(&mut self, options: &SchedulerOptions) {
        if let Some(v) = options.poll_interval_ms {
            self.poll_interval_ms = v;
        }
        if let Some(v) = options.max_parallel {
            self.max_parallel = v;
        }
        if let Some(v) = options.error_rate_threshold {
            self.error_rate_threshold = Some(v);
        }
        if let Some(v) = options.min_processed_before_stop {
            self.min_processed_before_stop = Some(v);
        }
        if let Some(v) = options.completion_timeout_ms {
            self.completion_timeout_ms = Some(v);
        }
        if let Some(v) = options.missing_executor {
            self.missing_executor = v;
        }
    }

    /// Defaults overridden by `SPINDLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let options = SchedulerOptions {
            poll_interval_ms: parse_var(&lookup, "SPINDLE_POLL_INTERVAL_MS")?,
            max_parallel: parse_var(&lookup, "SPINDLE_MAX_PARALLEL")?,
            error_rate_threshold: parse_var(&lookup, "SPINDLE_ERROR_RATE_THRESHOLD")?,
            min_processed_before_stop: parse_var(&lookup, "SPINDLE_MIN_PROCESSED_BEFORE_STOP")?,
            completion_timeout_ms: parse_var(&lookup, "SPINDLE_COMPLETION_TIMEOUT_MS")?,
            missing_executor: parse_var(&lookup, "SPINDLE_MISSING_EXECUTOR")?,
        };

        let mut config = Self::default();
        config.merge(&options);
        config.validate()?;
        Ok(config)
    }
}

/// Partial configuration update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    pub poll_interval_ms: Option<u64>,
    pub max_parallel: Option<usize>,
    pub error_rate_threshold: Option<f64>,
    pub min_processed_before_stop: Option<u64>,
    pub completion_timeout_ms: Option<u64>,
    pub missing_executor: Option<MissingExecutorPolicy>,
}

impl SchedulerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval_ms(mut self, v: u64) -> Self {
        self.poll_interval_ms = Some(v);
        self
    }

    pub fn max_parallel(mut self, v: usize) -> Self {
        self.max_parallel = Some(v);
        self
    }

    pub fn error_rate_threshold(mut self, v: f64) -> Self {
        self.error_rate_threshold = Some(v);
        self
    }

    pub fn min_processed_before_stop(mut self, v: u64) -> Self {
        self.min_processed_before_stop = Some(v);
        self
    }

    pub fn completion_timeout_ms(mut self, v: u64) -> Self {
        self.completion_timeout_ms = Some(v);
        self
    }

    pub fn missing_executor(mut self, v: MissingExecutorPolicy) -> Self {
        self.missing_executor = Some(v);
        self
    }
}

fn invalid(key: &'static str, value: impl fmt::Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| invalid(key, &raw, &e.to_string()))
}
