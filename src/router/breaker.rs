// SPDX-License-Identifier: MIT
//! Circuit breaker guarding each registered provider.
//!
//! # State machine
//!
//! ```text
//! Closed ──(failure_threshold consecutive failures)──► Open
//!   ▲                                                    │
//!   └──(probe succeeds)──── HalfOpen ◄──(reset_timeout elapsed)──┘
//!                               │
//!                               └──(probe fails)──► Open (timer restarts)
//! ```
//!
//! - **Closed**: calls are allowed; consecutive failures are counted.
//! - **Open**: calls fail fast. After `reset_timeout` the breaker moves to
//!   HalfOpen for probing.
//! - **HalfOpen**: at most `half_open_max_attempts` probes pass through.
//!   One success closes the circuit; one failure re-opens it for another
//!   `reset_timeout`.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays Open before a HalfOpen probe window.
    pub reset_timeout: Duration,
    /// Probes allowed through per HalfOpen window.
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_attempts: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    half_open_probes: u32,
    last_failure: Option<Instant>,
}

/// Thread-safe breaker; clones share state through an `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    config: Arc<BreakerConfig>,
    name: Arc<str>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                half_open_probes: 0,
                last_failure: None,
            })),
            config: Arc::new(config),
            name: Arc::from(name.into().as_str()),
        }
    }

    /// Whether a call should be attempted right now.
    ///
    /// In HalfOpen this consumes one probe slot, so callers must follow up
    /// with `record_success` or `record_failure`.
    pub async fn is_allowed(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                BreakerState::Closed => return true,
                BreakerState::HalfOpen | BreakerState::Open => {}
            }
        }

        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if inner.half_open_probes < self.config.half_open_max_attempts {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(breaker = %self.name, "circuit breaker → HalfOpen (probe window)");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probes = 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// A call succeeded. A HalfOpen probe success closes the circuit; in
    /// Closed the consecutive-failure counter resets.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::HalfOpen => {
                info!(breaker = %self.name, "circuit breaker → Closed (probe succeeded)");
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.half_open_probes = 0;
                inner.last_failure = None;
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    /// A call failed. Opens the circuit at the threshold; a HalfOpen probe
    /// failure re-opens it and restarts the reset timer.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit breaker → Open (threshold reached)"
                    );
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "circuit breaker → Open (probe failed)");
                inner.state = BreakerState::Open;
                inner.half_open_probes = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("name", &self.name).finish()
    }
}
