// SPDX-License-Identifier: MIT
//! Jittered exponential backoff for provider retries.
//!
//! Formula: `min(initial · multiplier^(attempt-1), max_delay)` with a
//! uniform jitter of `±jitter_factor` applied to the capped value.

use rand::Rng as _;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Attempts per provider, including the first try.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay (before jitter).
    pub max_delay: Duration,
    /// Exponential growth per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay, in [0, 1].
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.25,
        }
    }
}

impl BackoffConfig {
    /// Config suitable for unit tests — no real waiting.
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }
}

/// Delay before retrying after failed `attempt` (1-based).
pub fn delay_for_attempt(attempt: u32, config: &BackoffConfig) -> Duration {
    let base = config.initial_delay.as_millis() as f64;
    let raw = base * config.multiplier.powi(attempt.saturating_sub(1) as i32);
    let capped = raw.min(config.max_delay.as_millis() as f64);

    let jittered = if config.jitter_factor > 0.0 {
        let spread = capped * config.jitter_factor;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        (capped + offset).max(0.0)
    } else {
        capped
    };
    Duration::from_millis(jittered as u64)
}

/// Sleep for the computed backoff.
pub async fn backoff_sleep(attempt: u32, config: &BackoffConfig) {
    tokio::time::sleep(delay_for_attempt(attempt, config)).await;
}
