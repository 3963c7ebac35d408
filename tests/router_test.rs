// SPDX-License-Identifier: MIT
//! Model router integration tests: retry, failover, breaker accounting,
//! and uniform streaming.

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentd::error::ErrorKind;
use agentd::events::EventBus;
use agentd::metrics::GatewayMetrics;
use agentd::router::breaker::BreakerConfig;
use agentd::router::provider::{
    ChatMessage, ChatRequest, ChatResponse, EchoProvider, ModelProvider, ProviderError,
    ProviderErrorKind, TokenUsage,
};
use agentd::router::retry::BackoffConfig;
use agentd::router::{ModelRouter, RouterConfig};

/// Provider that fails every call with a configurable classification.
struct FailingProvider {
    id: String,
    models: Vec<String>,
    kind: ProviderErrorKind,
    calls: AtomicU32,
}

impl FailingProvider {
    fn new(id: &str, models: &[&str], kind: ProviderErrorKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            models: models.iter().map(|m| m.to_string()).collect(),
            kind,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ModelProvider for FailingProvider {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        "Failing (test)"
    }
    fn models(&self) -> Vec<String> {
        self.models.clone()
    }
    async fn is_available(&self) -> bool {
        true
    }
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::new(self.kind, "induced failure"))
    }
}

/// Provider that is never available — must not register.
struct OfflineProvider;

#[async_trait]
impl ModelProvider for OfflineProvider {
    fn id(&self) -> &str {
        "offline"
    }
    fn name(&self) -> &str {
        "Offline (test)"
    }
    fn models(&self) -> Vec<String> {
        vec!["m1".into()]
    }
    async fn is_available(&self) -> bool {
        false
    }
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            model: "m1".into(),
            content: "unreachable".into(),
            usage: TokenUsage::default(),
            provider_id: None,
        })
    }
}

fn request(model: &str) -> ChatRequest {
    ChatRequest {
        model: model.into(),
        messages: vec![ChatMessage {
            role: "user".into(),
            content: "hi".into(),
        }],
        max_tokens: None,
        temperature: None,
        metadata: serde_json::Map::new(),
    }
}

fn router(max_attempts: u32, failure_threshold: u32) -> ModelRouter {
    ModelRouter::new(
        RouterConfig {
            backoff: BackoffConfig {
                max_attempts,
                ..BackoffConfig::instant()
            },
            breaker: BreakerConfig {
                failure_threshold,
                reset_timeout: Duration::from_millis(50),
                half_open_max_attempts: 1,
            },
            attempt_timeout: Duration::from_secs(2),
            stream_chunk_timeout: Duration::from_secs(2),
        },
        Arc::new(EventBus::new()),
        Arc::new(GatewayMetrics::new()),
    )
}

#[tokio::test]
async fn unavailable_providers_are_skipped_at_registration() {
    let r = router(1, 5);
    assert!(!r.register(Arc::new(OfflineProvider)).await);
    assert_eq!(r.provider_count().await, 0);

    let err = r.route(&request("m1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
}

#[tokio::test]
async fn rate_limited_primary_fails_over_to_sibling() {
    // Scenario: P1 (primary for m1) 429s three times; P2 also serves m1.
    let r = router(3, 5);
    let p1 = FailingProvider::new("p1", &["m1"], ProviderErrorKind::RateLimited);
    r.register(p1.clone()).await;
    r.register(Arc::new(EchoProvider::new("p2", &["m1"]))).await;

    let resp = r.route(&request("m1")).await.unwrap();
    assert_eq!(resp.model, "m1");
    assert!(!resp.content.is_empty());
    assert_eq!(resp.provider_id.as_deref(), Some("p2"));

    // Three attempts against P1, each marking one breaker failure.
    assert_eq!(p1.calls.load(Ordering::SeqCst), 3);
    assert_eq!(r.breaker_failures("p1").await, Some(3));
    assert_eq!(r.breaker_failures("p2").await, Some(0));

    // Both providers carry a latency sample.
    for health in r.health().await {
        assert!(
            health.stats.last_latency_ms.is_some(),
            "no latency sample for {}",
            health.id
        );
    }
}

#[tokio::test]
async fn zero_retry_budget_returns_rate_limited_and_marks_one_failure() {
    let r = router(1, 5);
    r.register(FailingProvider::new(
        "p1",
        &["m1"],
        ProviderErrorKind::RateLimited,
    ))
    .await;

    let err = r.route(&request("m1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RateLimited);
    assert_eq!(r.breaker_failures("p1").await, Some(1));
}

#[tokio::test]
async fn non_retryable_errors_do_not_fail_over() {
    let r = router(3, 5);
    let p1 = FailingProvider::new("p1", &["m1"], ProviderErrorKind::Validation);
    r.register(p1.clone()).await;
    r.register(Arc::new(EchoProvider::new("p2", &["m1"]))).await;

    let err = r.route(&request("m1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    // One attempt, no retries, no failover.
    assert_eq!(p1.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn open_circuit_fails_fast() {
    let r = router(1, 1);
    let p1 = FailingProvider::new("p1", &["m1"], ProviderErrorKind::Server);
    r.register(p1.clone()).await;

    // First call trips the breaker (threshold 1).
    let _ = r.route(&request("m1")).await.unwrap_err();
    // Second call is rejected without touching the provider.
    let err = r.route(&request("m1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::CircuitOpen);
    assert_eq!(p1.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn half_open_probe_success_recloses_the_circuit() {
    let r = router(1, 1);

    // A provider that fails once, then succeeds.
    struct FlakyOnce {
        calls: AtomicU32,
    }
    #[async_trait]
    impl ModelProvider for FlakyOnce {
        fn id(&self) -> &str {
            "flaky"
        }
        fn name(&self) -> &str {
            "Flaky (test)"
        }
        fn models(&self) -> Vec<String> {
            vec!["m1".into()]
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProviderError::new(ProviderErrorKind::Server, "boom"))
            } else {
                Ok(ChatResponse {
                    model: req.model.clone(),
                    content: "recovered".into(),
                    usage: TokenUsage::default(),
                    provider_id: None,
                })
            }
        }
    }
    r.register(Arc::new(FlakyOnce {
        calls: AtomicU32::new(0),
    }))
    .await;

    let _ = r.route(&request("m1")).await.unwrap_err();
    // Wait out the reset timeout, then the half-open probe succeeds.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let resp = r.route(&request("m1")).await.unwrap();
    assert_eq!(resp.content, "recovered");
    assert_eq!(r.breaker_failures("flaky").await, Some(0));
}

#[tokio::test]
async fn family_match_routes_when_no_exact_model() {
    let r = router(1, 5);
    r.register(Arc::new(EchoProvider::new("p1", &["m1-mini"]))).await;

    // "m1-large" shares the family "m1".
    let resp = r.route(&request("m1-large")).await.unwrap();
    assert_eq!(resp.provider_id.as_deref(), Some("p1"));
}

#[tokio::test]
async fn stream_accumulates_through_the_controller() {
    let r = router(1, 5);
    r.register(Arc::new(EchoProvider::new("p1", &["m1"]))).await;

    let controller = r.stream(&request("m1")).await.unwrap();
    let outcome = controller.wait().await.unwrap();
    assert_eq!(outcome.content, "echo: hi");
    assert!(!outcome.aborted);
    assert!(outcome.chunk_count >= 2);
    assert!(outcome.first_chunk_latency.is_some());
}
