// SPDX-License-Identifier: MIT
//! Provider-agnostic model router.
//!
//! Registers providers that answer their availability probe, resolves models
//! to owners (exact id first, then model family), and wraps every dispatch
//! in a per-provider circuit breaker, a hard per-attempt timeout, jittered
//! exponential retry, and at most one failover hop to a healthy sibling
//! serving the same model family.

pub mod breaker;
pub mod provider;
pub mod retry;
pub mod stream;

use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{ErrorKind, GatewayError, Result};
use crate::events::{channels, EventBus};
use crate::metrics::GatewayMetrics;
use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use provider::{model_family, ChatRequest, ChatResponse, ModelProvider, ProviderError};
use retry::{backoff_sleep, BackoffConfig};
use stream::StreamController;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub backoff: BackoffConfig,
    pub breaker: BreakerConfig,
    /// Hard wall-clock budget per provider attempt.
    pub attempt_timeout: Duration,
    /// Watchdog budget between stream chunks.
    pub stream_chunk_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            breaker: BreakerConfig::default(),
            attempt_timeout: Duration::from_secs(120),
            stream_chunk_timeout: Duration::from_secs(30),
        }
    }
}

/// Rolling per-provider accounting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub requests: u64,
    pub failures: u64,
    /// Latency of the most recent attempt, success or failure.
    pub last_latency_ms: Option<u64>,
    pub total_latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Snapshot exposed on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub id: String,
    pub name: String,
    pub models: Vec<String>,
    pub breaker_state: String,
    pub failure_count: u32,
    pub stats: ProviderStats,
}

struct Registered {
    provider: Arc<dyn ModelProvider>,
    breaker: CircuitBreaker,
    models: Vec<String>,
    stats: StdMutex<ProviderStats>,
}

impl Registered {
    fn record_latency(&self, latency: Duration) {
        let mut stats = self.stats.lock().expect("stats lock");
        let ms = latency.as_millis() as u64;
        stats.last_latency_ms = Some(ms);
        stats.total_latency_ms += ms;
    }
}

/// What an exhausted provider attempt means for the caller.
struct AttemptFailure {
    error: GatewayError,
    /// Retryable exhaustion — the one condition that justifies a failover hop.
    failover_eligible: bool,
}

pub struct ModelRouter {
    providers: RwLock<Vec<Arc<Registered>>>,
    config: RouterConfig,
    bus: Arc<EventBus>,
    metrics: Arc<GatewayMetrics>,
}

impl ModelRouter {
    pub fn new(config: RouterConfig, bus: Arc<EventBus>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            config,
            bus,
            metrics,
        }
    }

    /// Probe and register a provider. Unavailable providers are skipped.
    pub async fn register(&self, provider: Arc<dyn ModelProvider>) -> bool {
        if !provider.is_available().await {
            warn!(provider = provider.id(), "provider unavailable at startup — skipped");
            return false;
        }
        let models = provider.models();
        info!(provider = provider.id(), models = ?models, "provider registered");
        self.bus.publish(
            channels::PROVIDERS,
            "registered",
            serde_json::json!({"providerId": provider.id(), "models": models}),
        );
        self.providers.write().await.push(Arc::new(Registered {
            breaker: CircuitBreaker::new(provider.id(), self.config.breaker.clone()),
            models,
            stats: StdMutex::new(ProviderStats::default()),
            provider,
        }));
        true
    }

    pub async fn provider_count(&self) -> usize {
        self.providers.read().await.len()
    }

    /// Providers whose breaker is not Open.
    pub async fn healthy_count(&self) -> usize {
        let providers = self.providers.read().await;
        let mut healthy = 0;
        for p in providers.iter() {
            if p.breaker.state().await != BreakerState::Open {
                healthy += 1;
            }
        }
        healthy
    }

    /// Owning provider for a model: exact id match first, then any provider
    /// listing the model's family.
    async fn resolve(&self, model: &str) -> Option<Arc<Registered>> {
        let providers = self.providers.read().await;
        if let Some(exact) = providers
            .iter()
            .find(|p| p.models.iter().any(|m| m == model))
        {
            return Some(exact.clone());
        }
        let family = model_family(model);
        providers
            .iter()
            .find(|p| p.models.iter().any(|m| model_family(m) == family))
            .cloned()
    }

    /// Healthy sibling of `primary` serving the same model family.
    async fn failover_sibling(
        &self,
        primary: &Registered,
        model: &str,
    ) -> Option<Arc<Registered>> {
        let family = model_family(model);
        let providers = self.providers.read().await;
        for p in providers.iter() {
            if p.provider.id() == primary.provider.id() {
                continue;
            }
            let serves = p
                .models
                .iter()
                .any(|m| m == model || model_family(m) == family);
            if serves && p.breaker.state().await != BreakerState::Open {
                return Some(p.clone());
            }
        }
        None
    }

    // ─── Chat ───────────────────────────────────────────────────────────────

    /// Route a chat request: breaker gate, retry with backoff, then at most
    /// one failover hop on retryable exhaustion.
    pub async fn route(&self, req: &ChatRequest) -> Result<ChatResponse> {
        GatewayMetrics::inc(&self.metrics.provider_requests_total);
        let primary = self.resolve(&req.model).await.ok_or_else(|| {
            GatewayError::new(
                ErrorKind::ProviderUnavailable,
                format!("no provider serves model {:?}", req.model),
            )
        })?;

        let failure = match self.attempt(&primary, req).await {
            Ok(resp) => return Ok(resp),
            Err(f) => f,
        };

        if failure.failover_eligible {
            if let Some(sibling) = self.failover_sibling(&primary, &req.model).await {
                GatewayMetrics::inc(&self.metrics.provider_failovers_total);
                info!(
                    from = primary.provider.id(),
                    to = sibling.provider.id(),
                    model = %req.model,
                    "failing over"
                );
                self.bus.publish(
                    channels::PROVIDERS,
                    "failover",
                    serde_json::json!({
                        "from": primary.provider.id(),
                        "to": sibling.provider.id(),
                        "model": req.model,
                    }),
                );
                match self.attempt(&sibling, req).await {
                    Ok(resp) => return Ok(resp),
                    Err(f) => {
                        GatewayMetrics::inc(&self.metrics.provider_failures_total);
                        return Err(f.error);
                    }
                }
            }
        }

        GatewayMetrics::inc(&self.metrics.provider_failures_total);
        Err(failure.error)
    }

    /// Run the retry loop against a single provider. Every failed attempt
    /// marks one breaker failure and one stats failure; every attempt leaves
    /// a latency sample.
    async fn attempt(
        &self,
        registered: &Arc<Registered>,
        req: &ChatRequest,
    ) -> std::result::Result<ChatResponse, AttemptFailure> {
        if !registered.breaker.is_allowed().await {
            return Err(AttemptFailure {
                error: GatewayError::new(
                    ErrorKind::CircuitOpen,
                    format!("provider {} circuit is open", registered.provider.id()),
                ),
                failover_eligible: false,
            });
        }

        registered.stats.lock().expect("stats lock").requests += 1;
        let max_attempts = self.config.backoff.max_attempts.max(1);

        let mut attempt = 1u32;
        loop {
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                self.config.attempt_timeout,
                registered.provider.chat(req),
            )
            .await;
            let latency = started.elapsed();
            registered.record_latency(latency);

            let err = match outcome {
                Ok(Ok(mut resp)) => {
                    registered.breaker.record_success().await;
                    {
                        let mut stats = registered.stats.lock().expect("stats lock");
                        stats.input_tokens += resp.usage.input_tokens;
                        stats.output_tokens += resp.usage.output_tokens;
                    }
                    self.metrics.provider_latency.observe_ms(latency.as_millis() as u64);
                    resp.provider_id = Some(registered.provider.id().to_string());
                    return Ok(resp);
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::timeout(format!(
                    "attempt exceeded {}ms",
                    self.config.attempt_timeout.as_millis()
                )),
            };

            registered.breaker.record_failure().await;
            registered.stats.lock().expect("stats lock").failures += 1;
            warn!(
                provider = registered.provider.id(),
                attempt,
                max_attempts,
                err = %err,
                "provider attempt failed"
            );

            if err.is_retryable() && attempt < max_attempts {
                backoff_sleep(attempt, &self.config.backoff).await;
                attempt += 1;
                continue;
            }

            return Err(AttemptFailure {
                failover_eligible: err.is_retryable(),
                error: err.into(),
            });
        }
    }

    // ─── Streaming ──────────────────────────────────────────────────────────

    /// Open a uniform stream for `req`. Setup errors may fail over once;
    /// mid-stream failures surface through the controller's outcome.
    pub async fn stream(&self, req: &ChatRequest) -> Result<Arc<StreamController>> {
        GatewayMetrics::inc(&self.metrics.provider_requests_total);
        let primary = self.resolve(&req.model).await.ok_or_else(|| {
            GatewayError::new(
                ErrorKind::ProviderUnavailable,
                format!("no provider serves model {:?}", req.model),
            )
        })?;

        match self.open_stream(&primary, req).await {
            Ok(ctl) => Ok(ctl),
            Err(failure) if failure.failover_eligible => {
                let Some(sibling) = self.failover_sibling(&primary, &req.model).await else {
                    return Err(failure.error);
                };
                GatewayMetrics::inc(&self.metrics.provider_failovers_total);
                self.open_stream(&sibling, req).await.map_err(|f| f.error)
            }
            Err(failure) => Err(failure.error),
        }
    }

    async fn open_stream(
        &self,
        registered: &Arc<Registered>,
        req: &ChatRequest,
    ) -> std::result::Result<Arc<StreamController>, AttemptFailure> {
        if !registered.breaker.is_allowed().await {
            return Err(AttemptFailure {
                error: GatewayError::new(
                    ErrorKind::CircuitOpen,
                    format!("provider {} circuit is open", registered.provider.id()),
                ),
                failover_eligible: false,
            });
        }
        registered.stats.lock().expect("stats lock").requests += 1;

        let started = Instant::now();
        match registered.provider.chat_stream(req).await {
            Ok(stream) => {
                registered.breaker.record_success().await;
                registered.record_latency(started.elapsed());
                Ok(StreamController::spawn(stream, self.config.stream_chunk_timeout))
            }
            Err(e) => {
                registered.breaker.record_failure().await;
                registered.record_latency(started.elapsed());
                registered.stats.lock().expect("stats lock").failures += 1;
                Err(AttemptFailure {
                    failover_eligible: e.is_retryable(),
                    error: e.into(),
                })
            }
        }
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    pub async fn health(&self) -> Vec<ProviderHealth> {
        let providers = self.providers.read().await;
        let mut out = Vec::with_capacity(providers.len());
        for p in providers.iter() {
            out.push(ProviderHealth {
                id: p.provider.id().to_string(),
                name: p.provider.name().to_string(),
                models: p.models.clone(),
                breaker_state: p.breaker.state().await.to_string(),
                failure_count: p.breaker.failure_count().await,
                stats: p.stats.lock().expect("stats lock").clone(),
            });
        }
        out
    }

    /// Breaker failure counter for one provider (tests and diagnostics).
    pub async fn breaker_failures(&self, provider_id: &str) -> Option<u32> {
        let providers = self.providers.read().await;
        for p in providers.iter() {
            if p.provider.id() == provider_id {
                return Some(p.breaker.failure_count().await);
            }
        }
        None
    }
}
