//! Exponential backoff for transient log-source failures, and the adaptive
//! batch sizer that shrinks `eth_getLogs` ranges while the source struggles.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap on the delay between retries, in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the delay on each consecutive failure.
    pub multiplier: f64,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Halve the batch size after every N consecutive failures.
    pub shrink_after: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            max_retries: None,
            shrink_after: 2,
        }
    }
}

/// Stateless backoff policy. Computes the delay for a given attempt.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based), or `None`
    /// once `max_retries` is exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base_ms = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Returns `true` if a retry is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.config.max_retries.map_or(true, |max| attempt <= max)
    }

    /// Returns `true` if the batch should shrink after `attempt` failures.
    pub fn should_shrink(&self, attempt: u32) -> bool {
        self.config.shrink_after > 0 && attempt % self.config.shrink_after == 0
    }
}

/// Tracks the current block-range size for log queries.
#[derive(Debug, Clone)]
pub struct BatchSizer {
    current: u64,
    min: u64,
    max: u64,
}

impl BatchSizer {
    pub fn new(max: u64, min: u64) -> Self {
        let max = max.max(1);
        let min = min.clamp(1, max);
        Self { current: max, min, max }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Halve the range (floor `min`). Returns the new size.
    pub fn shrink(&mut self) -> u64 {
        self.current = (self.current / 2).max(self.min);
        self.current
    }

    /// Double the range back toward `max` after a successful fetch.
    pub fn grow(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }
}
