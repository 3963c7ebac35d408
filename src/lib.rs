// SPDX-License-Identifier: MIT
//! agentd — multi-tenant runtime daemon for sandboxed AI agents.
//!
//! The library exposes every component the daemon wires together: the
//! gateway control plane, agent lifecycle engine, model router, persistent
//! memory store, cluster coordinator, event bus, and the capability /
//! policy / audit layer. `GatewayContext::bootstrap` builds the whole
//! assembly; the binary in `main.rs` is a thin CLI over it.

pub mod audit;
pub mod capability;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod policy;
pub mod proto;
pub mod router;
pub mod storage;

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::warn;

use audit::{AuditLogger, FileSink, StdoutSink};
use capability::tokens::TokenManager;
use cluster::{ClusterConfig, ClusterCoordinator};
use config::{GatewayConfig, MIN_PERMISSION_SECRET_LEN};
use events::EventBus;
use lifecycle::agent::ResourceLimits;
use lifecycle::{EngineConfig, LifecycleEngine};
use memory::crypto::MemoryCipher;
use memory::retention::{JobGate, RetentionSweeper};
use memory::vector::{InMemoryVectorIndex, VectorIndex};
use memory::MemoryStore;
use metrics::GatewayMetrics;
use policy::{PolicyEngine, PolicyRule, ResourceClass, RuleDecision};
use router::provider::ModelProvider;
use router::{ModelRouter, RouterConfig};
use storage::Storage;

/// Shared application state passed to every handler and background task.
pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub storage: Arc<Storage>,
    pub bus: Arc<EventBus>,
    pub audit: Arc<AuditLogger>,
    pub metrics: Arc<GatewayMetrics>,
    pub tokens: Arc<TokenManager>,
    pub policy: Arc<PolicyEngine>,
    pub memory: Arc<MemoryStore>,
    pub router: Arc<ModelRouter>,
    pub engine: Arc<LifecycleEngine>,
    pub cluster: Option<Arc<ClusterCoordinator>>,
    /// Set on shutdown signal; new connections are refused while draining.
    pub draining: Arc<AtomicBool>,
}

impl GatewayContext {
    /// Wire every component together. Providers are probed and registered;
    /// background tasks (heartbeats, retention, audit flush, event log)
    /// start here.
    pub async fn bootstrap(
        config: GatewayConfig,
        providers: Vec<Arc<dyn ModelProvider>>,
    ) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        let storage = Arc::new(Storage::new(&config.data_dir).await?);
        let bus = Arc::new(EventBus::new());
        let metrics = Arc::new(GatewayMetrics::new());

        let audit = Arc::new(AuditLogger::new(vec![
            Box::new(StdoutSink),
            Box::new(FileSink::new(config.data_dir.join("audit.jsonl"))),
        ]));
        audit.attach_store(storage.spawn_audit_writer());
        audit.spawn_flush_task(std::time::Duration::from_secs(5));

        // Capability tokens need a strong secret. Hardening makes a weak one
        // fatal before we get here; in dev we fall back to an ephemeral one.
        let secret = if config.permission_secret.len() >= MIN_PERMISSION_SECRET_LEN {
            config.permission_secret.clone()
        } else {
            warn!("permission_secret missing or short — using an ephemeral dev secret");
            uuid::Uuid::new_v4().simple().to_string()
        };
        let tokens = Arc::new(TokenManager::new(&secret)?);
        tokens.load_revocations(storage.load_revoked_tokens().await.unwrap_or_default());

        let cipher = if config.memory.encryption_enabled {
            let key = config.memory.master_key.as_deref().unwrap_or("");
            Some(Arc::new(MemoryCipher::new(key)?))
        } else {
            None
        };
        let vector: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
        let memory = Arc::new(MemoryStore::new(
            storage.pool(),
            Some(vector.clone()),
            cipher,
            bus.clone(),
        ));

        let router = Arc::new(ModelRouter::new(
            RouterConfig::default(),
            bus.clone(),
            metrics.clone(),
        ));
        for provider in providers {
            router.register(provider).await;
        }

        let node_id = node_identity(&config.data_dir)?;
        let engine = LifecycleEngine::new(
            EngineConfig {
                node_id: node_id.clone(),
                max_agents: config.runtime.max_agents,
                default_limits: ResourceLimits {
                    max_memory_bytes: config.runtime.default_memory_limit,
                    ..ResourceLimits::default()
                },
                heartbeat_timeout: std::time::Duration::from_millis(
                    config.runtime.heartbeat_timeout_ms,
                ),
                checkpoint_interval: std::time::Duration::from_millis(
                    config.runtime.checkpoint_interval_ms,
                ),
                shutdown_timeout: std::time::Duration::from_millis(
                    config.runtime.shutdown_timeout_ms,
                ),
                drain_delay: std::time::Duration::from_secs(1),
            },
            Some(storage.clone()),
            bus.clone(),
            audit.clone(),
            metrics.clone(),
        );
        engine.spawn_heartbeat_monitor();

        let policy = Arc::new(PolicyEngine::new(
            default_policy_rules(&config),
            RuleDecision::Allow,
        ));

        let cluster = if config.cluster.enabled {
            let coordinator = ClusterCoordinator::new(
                ClusterConfig {
                    node_id: node_id.clone(),
                    node_ws_url: config.cluster.node_ws_url.clone(),
                    auth_token: config.gateway.auth_token.clone(),
                    distributed_scheduler: config.cluster.distributed_scheduler,
                    ..ClusterConfig::default()
                },
                storage.clone(),
                bus.clone(),
            );
            coordinator.register().await?;
            coordinator.spawn_heartbeat();
            Some(coordinator)
        } else {
            None
        };

        let sweeper = Arc::new(RetentionSweeper::new(
            (*storage).clone(),
            Some(vector),
            config.retention.clone(),
        ));
        let gate: Option<Arc<dyn JobGate>> = cluster
            .as_ref()
            .map(|c| c.clone() as Arc<dyn JobGate>);
        sweeper.spawn_daily(gate);

        // Mirror bus traffic into the event log, fire-and-forget.
        {
            let mut events = bus.subscribe_all();
            let storage = storage.clone();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    let _ = storage
                        .insert_event_log(
                            &event.channel,
                            &event.event_type,
                            &event.data.to_string(),
                        )
                        .await;
                }
            });
        }

        Ok(Arc::new(Self {
            config,
            storage,
            bus,
            audit,
            metrics,
            tokens,
            policy,
            memory,
            router,
            engine,
            cluster,
            draining: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Baseline sandbox policy: secrets are gated behind approval, and with
/// `enforce_egress_proxy` set all network traffic must target the proxy.
/// Everything else defaults open and is narrowed per deployment.
fn default_policy_rules(config: &GatewayConfig) -> Vec<PolicyRule> {
    let mut rules = vec![PolicyRule {
        id: "gate-secret-reads".into(),
        class: ResourceClass::Secret,
        priority: 100,
        enabled: true,
        decision: RuleDecision::Approve,
        patterns: vec!["*".into()],
        operations: vec![],
    }];

    if config.enforce_egress_proxy {
        let proxy_host = config
            .egress_proxy_url
            .as_deref()
            .unwrap_or("")
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .split([':', '/'])
            .next()
            .unwrap_or("")
            .to_string();
        rules.push(PolicyRule {
            id: "allow-egress-proxy".into(),
            class: ResourceClass::Network,
            priority: 90,
            enabled: true,
            decision: RuleDecision::Allow,
            patterns: vec![proxy_host],
            operations: vec![],
        });
        rules.push(PolicyRule {
            id: "block-direct-egress".into(),
            class: ResourceClass::Network,
            priority: 80,
            enabled: true,
            decision: RuleDecision::Block,
            patterns: vec!["*".into()],
            operations: vec![],
        });
    }
    rules
}

/// Stable per-node identity, persisted at `{data_dir}/node_id`.
///
/// Generated once and reused across restarts so agents keep their home node
/// after a daemon restart.
fn node_identity(data_dir: &Path) -> anyhow::Result<String> {
    let path = data_dir.join("node_id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let id = format!(
        "node-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..12]
    );
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, &id)?;
    Ok(id)
}
