// SPDX-License-Identifier: MIT
//! Agent lifecycle engine.
//!
//! Owns every live agent on this node: the state machine, capability
//! sandbox, resource accounting, heartbeat liveness, auto-checkpointing,
//! and graceful drain. All mutations funnel through the engine's lock, so
//! per-agent transitions are totally ordered and usage updates are
//! linearizable with them.

pub mod agent;
pub mod checkpoint;
pub mod sandbox;
pub mod state;

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditLogger, AuditOutcome};
use crate::capability::{normalize, CapabilityGrant, DEFAULT_CAPABILITIES};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::events::{channels, EventBus};
use crate::metrics::GatewayMetrics;
use crate::storage::{GrantRow, Storage};
use agent::{Agent, AgentInfo, AgentManifest, PriceTable, ResourceLimits};
use checkpoint::AgentCheckpoint;
use sandbox::{CapabilityCheck, Sandbox};
use state::{next_state, AgentState, LifecycleEvent, TransitionRecord};

/// Signal sent to an attached worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Terminate,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_id: String,
    pub max_agents: usize,
    pub default_limits: ResourceLimits,
    pub heartbeat_timeout: Duration,
    /// Zero disables per-agent auto-checkpoint tasks.
    pub checkpoint_interval: Duration,
    pub shutdown_timeout: Duration,
    /// How long a terminated agent stays visible before removal.
    pub drain_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "node-local".into(),
            max_agents: 64,
            default_limits: ResourceLimits::default(),
            heartbeat_timeout: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(15),
            drain_delay: Duration::from_secs(1),
        }
    }
}

pub struct LifecycleEngine {
    config: EngineConfig,
    agents: RwLock<HashMap<String, Agent>>,
    workers: StdMutex<HashMap<String, mpsc::UnboundedSender<WorkerSignal>>>,
    checkpoint_tasks: StdMutex<HashMap<String, JoinHandle<()>>>,
    storage: Option<Arc<Storage>>,
    bus: Arc<EventBus>,
    audit: Arc<AuditLogger>,
    metrics: Arc<GatewayMetrics>,
    prices: PriceTable,
    shutting_down: AtomicBool,
}

impl LifecycleEngine {
    pub fn new(
        config: EngineConfig,
        storage: Option<Arc<Storage>>,
        bus: Arc<EventBus>,
        audit: Arc<AuditLogger>,
        metrics: Arc<GatewayMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            agents: RwLock::new(HashMap::new()),
            workers: StdMutex::new(HashMap::new()),
            checkpoint_tasks: StdMutex::new(HashMap::new()),
            storage,
            bus,
            audit,
            metrics,
            prices: PriceTable::default(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    // ─── Spawn ──────────────────────────────────────────────────────────────

    /// Allocate an id, build the sandbox (defaults + requested, gated by
    /// parent authority), persist the shell row, and emit `spawn`.
    pub async fn spawn(
        self: &Arc<Self>,
        manifest: AgentManifest,
        parent_id: Option<String>,
    ) -> Result<AgentInfo> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::new(
                ErrorKind::ShutdownInProgress,
                "engine is shutting down",
            ));
        }
        manifest.validate()?;

        let mut agents = self.agents.write().await;
        if agents.len() >= self.config.max_agents {
            return Err(GatewayError::new(
                ErrorKind::CapacityExceeded,
                format!("agent limit of {} reached", self.config.max_agents),
            ));
        }

        let mut sandbox = Sandbox::new();
        for cap in DEFAULT_CAPABILITIES {
            sandbox.grant(CapabilityGrant::new(cap, "system"));
        }
        for cap in &manifest.capabilities {
            let grantor = match &parent_id {
                Some(parent) => {
                    let parent_agent = agents.get(parent).ok_or_else(|| {
                        GatewayError::not_found(format!("parent agent {parent}"))
                    })?;
                    // A parent can only delegate capabilities it holds itself.
                    if !parent_agent.sandbox.holds(cap) {
                        return Err(GatewayError::new(
                            ErrorKind::CapabilityDenied,
                            format!("parent {parent} does not hold {cap:?}"),
                        ));
                    }
                    parent.clone()
                }
                None => "system".to_string(),
            };
            sandbox.grant(CapabilityGrant::new(cap, &grantor));
        }

        let agent_id = uuid::Uuid::new_v4().to_string();
        let limits = ResourceLimits::merged(&self.config.default_limits, &manifest.limits);
        let agent = Agent::new(
            agent_id.clone(),
            manifest,
            parent_id,
            self.config.node_id.clone(),
            limits,
            sandbox,
        );
        let info = agent.info();
        let grants = agent.sandbox.grants().to_vec();
        let manifest_json = serde_json::to_string(&agent.manifest)?;
        agents.insert(agent_id.clone(), agent);
        drop(agents);

        self.persist_shell(&agent_id, &manifest_json, AgentState::Created, &grants)
            .await;
        GatewayMetrics::inc(&self.metrics.agents_spawned_total);
        self.metrics.agents_live.fetch_add(1, Ordering::Relaxed);

        self.audit.record(
            "engine",
            "spawn",
            "agent",
            &agent_id,
            AuditOutcome::Success,
            serde_json::json!({"manifestId": info.manifest_id, "parentId": info.parent_id}),
        );
        self.bus.publish(
            channels::AGENTS,
            "spawn",
            serde_json::json!({"agentId": agent_id, "manifestId": info.manifest_id}),
        );

        self.start_auto_checkpoint(agent_id);
        Ok(info)
    }

    async fn persist_shell(
        &self,
        agent_id: &str,
        manifest_json: &str,
        state: AgentState,
        grants: &[CapabilityGrant],
    ) {
        let Some(storage) = &self.storage else { return };
        if let Err(e) = storage
            .upsert_agent(agent_id, manifest_json, state.as_str(), &self.config.node_id)
            .await
        {
            warn!(agent = agent_id, err = %e, "agent shell row write failed");
        }
        let rows: Vec<GrantRow> = grants
            .iter()
            .map(|g| GrantRow {
                agent_id: agent_id.to_string(),
                capability: g.capability.clone(),
                granted_by: g.granted_by.clone(),
                granted_at: g.granted_at.to_rfc3339(),
                expires_at: g.expires_at.map(|t| t.to_rfc3339()),
                constraints: Value::Object(g.constraints.clone()).to_string(),
            })
            .collect();
        if let Err(e) = storage.replace_grants(agent_id, &rows).await {
            warn!(agent = agent_id, err = %e, "grant rows write failed");
        }
    }

    // ─── Transitions ────────────────────────────────────────────────────────

    async fn apply_event(
        &self,
        id: &str,
        event: LifecycleEvent,
        reason: Option<String>,
    ) -> Result<AgentInfo> {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))?;
        let from = agent.state;
        let Some(to) = next_state(from, event) else {
            return Err(GatewayError::bad_state(format!(
                "event {} is not valid in state {from}",
                event.as_str()
            )));
        };

        agent.state = to;
        agent.last_activity_at = now;
        match event {
            LifecycleEvent::Start => agent.usage.active_requests += 1,
            LifecycleEvent::Complete => {
                agent.usage.active_requests = agent.usage.active_requests.saturating_sub(1);
                agent.success_count += 1;
            }
            LifecycleEvent::Fail => agent.error_count += 1,
            _ => {}
        }
        agent.history.push(TransitionRecord {
            from,
            to,
            event,
            reason: reason.clone(),
            at: now,
        });
        let info = agent.info();
        drop(agents);

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.update_agent_state(id, to.as_str()).await {
                warn!(agent = id, err = %e, "agent state persist failed");
            }
            if let Err(e) = storage
                .append_history(
                    id,
                    from.as_str(),
                    to.as_str(),
                    event.as_str(),
                    reason.as_deref(),
                    now,
                )
                .await
            {
                warn!(agent = id, err = %e, "history row append failed");
            }
        }

        self.audit.record(
            "engine",
            event.as_str(),
            "agent",
            id,
            AuditOutcome::Success,
            serde_json::json!({"from": from.as_str(), "to": to.as_str(), "reason": reason}),
        );
        self.bus.publish(
            channels::AGENTS,
            "state_changed",
            serde_json::json!({
                "agentId": id,
                "from": from.as_str(),
                "to": to.as_str(),
                "event": event.as_str(),
                "reason": reason,
            }),
        );
        Ok(info)
    }

    /// created → initializing → ready, running the optional entry point in
    /// the sandbox in between. An entry-point failure lands the agent in
    /// `error`.
    pub async fn initialize(&self, id: &str) -> Result<AgentInfo> {
        self.apply_event(id, LifecycleEvent::Initialize, None).await?;

        let entry_point = {
            let agents = self.agents.read().await;
            agents
                .get(id)
                .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))?
                .manifest
                .entry_point
                .clone()
        };
        if let Some(entry) = entry_point {
            if entry.trim().is_empty() {
                self.apply_event(id, LifecycleEvent::Fail, Some("entry point is empty".into()))
                    .await?;
                return Err(GatewayError::internal("agent initialization failed"));
            }
            debug!(agent = id, entry = %entry, "entry point registered");
        }

        self.apply_event(id, LifecycleEvent::Ready, None).await
    }

    pub async fn start(&self, id: &str) -> Result<AgentInfo> {
        self.apply_event(id, LifecycleEvent::Start, None).await
    }

    pub async fn pause(&self, id: &str) -> Result<AgentInfo> {
        self.apply_event(id, LifecycleEvent::Pause, None).await
    }

    pub async fn resume(&self, id: &str) -> Result<AgentInfo> {
        self.apply_event(id, LifecycleEvent::Resume, None).await
    }

    pub async fn complete(&self, id: &str) -> Result<AgentInfo> {
        self.apply_event(id, LifecycleEvent::Complete, None).await
    }

    pub async fn fail(&self, id: &str, reason: &str) -> Result<AgentInfo> {
        self.apply_event(id, LifecycleEvent::Fail, Some(reason.to_string()))
            .await
    }

    /// error → ready.
    pub async fn recover(&self, id: &str) -> Result<AgentInfo> {
        self.apply_event(id, LifecycleEvent::Recover, None).await
    }

    /// Terminate is idempotent: unknown or already-terminated ids return
    /// `false` without events. The agent leaves the live set after the
    /// drain delay.
    pub async fn terminate(self: &Arc<Self>, id: &str, reason: Option<&str>) -> bool {
        let now = Utc::now();
        let from = {
            let mut agents = self.agents.write().await;
            let Some(agent) = agents.get_mut(id) else {
                return false;
            };
            let from = agent.state;
            let Some(to) = next_state(from, LifecycleEvent::Terminate) else {
                return false;
            };
            agent.state = to;
            agent.last_activity_at = now;
            agent.history.push(TransitionRecord {
                from,
                to,
                event: LifecycleEvent::Terminate,
                reason: reason.map(str::to_string),
                at: now,
            });
            agent.sandbox.clear();
            from
        };

        if let Some(handle) = self.checkpoint_tasks.lock().expect("task lock").remove(id) {
            handle.abort();
        }
        if let Some(worker) = self.workers.lock().expect("worker lock").remove(id) {
            let _ = worker.send(WorkerSignal::Terminate);
        }

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.update_agent_state(id, "terminated").await {
                warn!(agent = id, err = %e, "terminate persist failed");
            }
            if let Err(e) = storage
                .append_history(id, from.as_str(), "terminated", "terminate", reason, now)
                .await
            {
                warn!(agent = id, err = %e, "terminate history append failed");
            }
        }

        self.metrics.agents_live.fetch_sub(1, Ordering::Relaxed);
        self.audit.record(
            "engine",
            "terminate",
            "agent",
            id,
            AuditOutcome::Success,
            serde_json::json!({"reason": reason}),
        );
        self.bus.publish(
            channels::AGENTS,
            "terminated",
            serde_json::json!({"agentId": id, "reason": reason}),
        );

        // Drain window: keep the terminated agent visible briefly, then drop
        // it from the live set for good.
        let engine = Arc::downgrade(self);
        let id = id.to_string();
        let drain = self.config.drain_delay;
        tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            if let Some(engine) = engine.upgrade() {
                engine.agents.write().await.remove(&id);
            }
        });
        true
    }

    // ─── Usage & liveness ───────────────────────────────────────────────────

    /// Record a usage sample. Unknown ids are silently ignored. Limit
    /// breaches emit `resource_warning` but never refuse the sample.
    pub async fn record_usage(&self, id: &str, model: &str, input_tokens: u64, output_tokens: u64) {
        let now = Utc::now();
        let cost = self.prices.estimate(model, input_tokens, output_tokens);

        let warnings = {
            let mut agents = self.agents.write().await;
            let Some(agent) = agents.get_mut(id) else {
                return;
            };
            agent.usage.record(input_tokens, output_tokens, cost, now);
            agent.last_activity_at = now;

            let mut warnings = Vec::new();
            if agent.usage.tokens_this_minute > agent.limits.tokens_per_minute {
                warnings.push(("tokens_per_minute", agent.usage.tokens_this_minute as f64));
            }
            if input_tokens + output_tokens > agent.limits.max_tokens_per_request {
                warnings.push((
                    "max_tokens_per_request",
                    (input_tokens + output_tokens) as f64,
                ));
            }
            if agent.usage.active_requests > agent.limits.max_concurrent_requests {
                warnings.push(("max_concurrent_requests", agent.usage.active_requests as f64));
            }
            if agent.usage.estimated_cost_usd > agent.limits.daily_cost_ceiling_usd {
                warnings.push(("daily_cost_ceiling_usd", agent.usage.estimated_cost_usd));
            }
            warnings
        };

        for (limit, observed) in warnings {
            self.audit.record(
                "engine",
                "resource_warning",
                "agent",
                id,
                AuditOutcome::Failure,
                serde_json::json!({"limit": limit, "observed": observed}),
            );
            self.bus.publish(
                channels::AGENTS,
                "resource_warning",
                serde_json::json!({"agentId": id, "limit": limit, "observed": observed}),
            );
        }
    }

    /// Refresh an agent's heartbeat timestamp.
    pub async fn heartbeat(&self, id: &str) {
        if let Some(agent) = self.agents.write().await.get_mut(id) {
            agent.usage.last_heartbeat_at = Utc::now();
        }
    }

    /// Register this agent's worker; the engine sends `Terminate` through
    /// the returned channel's counterpart on heartbeat loss or terminate.
    pub fn attach_worker(&self, id: &str) -> mpsc::UnboundedReceiver<WorkerSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.workers
            .lock()
            .expect("worker lock")
            .insert(id.to_string(), tx);
        rx
    }

    /// Heartbeat monitor: probes every `min(timeout/2, 15 s)`, terminates
    /// the worker and fails any running agent whose heartbeat went stale.
    pub fn spawn_heartbeat_monitor(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let timeout = self.config.heartbeat_timeout;
        let probe = timeout.div_f64(2.0).min(Duration::from_secs(15));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else { break };
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(60));
                let stale: Vec<String> = {
                    let agents = engine.agents.read().await;
                    agents
                        .values()
                        .filter(|a| {
                            a.state == AgentState::Running && a.usage.last_heartbeat_at < cutoff
                        })
                        .map(|a| a.id.clone())
                        .collect()
                };
                for id in stale {
                    warn!(agent = %id, "heartbeat stale — failing agent");
                    if let Some(worker) = engine.workers.lock().expect("worker lock").remove(&id) {
                        let _ = worker.send(WorkerSignal::Terminate);
                    }
                    if let Err(e) = engine.fail(&id, "heartbeat timeout").await {
                        debug!(agent = %id, err = %e, "stale agent already transitioned");
                    }
                }
            }
        });
    }

    // ─── Capabilities ───────────────────────────────────────────────────────

    /// Audited sandbox check with an optional context map.
    pub async fn check_capability(
        &self,
        id: &str,
        capability: &str,
        context: &Map<String, Value>,
    ) -> Result<CapabilityCheck> {
        let check = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))?;
            agent.sandbox.check(capability, context)
        };
        self.audit.record(
            "engine",
            "capability_check",
            "agent",
            id,
            if check.allowed {
                AuditOutcome::Success
            } else {
                AuditOutcome::Denied
            },
            serde_json::json!({"capability": check.capability, "reason": check.reason}),
        );
        Ok(check)
    }

    pub async fn grant_capability(&self, id: &str, grant: CapabilityGrant) -> Result<()> {
        let grants = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))?;
            agent.sandbox.grant(grant.clone());
            agent.sandbox.grants().to_vec()
        };
        let manifest_json = self.manifest_json(id).await?;
        self.persist_shell(id, &manifest_json, self.state_of(id).await?, &grants)
            .await;
        self.audit.record(
            "engine",
            "capability_grant",
            "agent",
            id,
            AuditOutcome::Success,
            serde_json::json!({"capability": grant.capability, "grantedBy": grant.granted_by}),
        );
        Ok(())
    }

    pub async fn revoke_capability(&self, id: &str, capability: &str) -> Result<usize> {
        let (removed, grants) = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))?;
            let removed = agent.sandbox.revoke(capability);
            (removed, agent.sandbox.grants().to_vec())
        };
        let manifest_json = self.manifest_json(id).await?;
        self.persist_shell(id, &manifest_json, self.state_of(id).await?, &grants)
            .await;
        self.audit.record(
            "engine",
            "capability_revoke",
            "agent",
            id,
            AuditOutcome::Success,
            serde_json::json!({"capability": normalize(capability), "removed": removed}),
        );
        Ok(removed)
    }

    pub async fn list_grants(&self, id: &str) -> Result<Vec<CapabilityGrant>> {
        let agents = self.agents.read().await;
        let agent = agents
            .get(id)
            .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))?;
        Ok(agent.sandbox.grants().to_vec())
    }

    async fn manifest_json(&self, id: &str) -> Result<String> {
        let agents = self.agents.read().await;
        let agent = agents
            .get(id)
            .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))?;
        Ok(serde_json::to_string(&agent.manifest)?)
    }

    async fn state_of(&self, id: &str) -> Result<AgentState> {
        let agents = self.agents.read().await;
        Ok(agents
            .get(id)
            .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))?
            .state)
    }

    // ─── Checkpoints ────────────────────────────────────────────────────────

    /// Serialize the agent and write it atomically to its row.
    pub async fn checkpoint(&self, id: &str, custom: Map<String, Value>) -> Result<AgentCheckpoint> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            GatewayError::new(ErrorKind::StoreUnavailable, "no persistence provider")
        })?;
        let cp = {
            let agents = self.agents.read().await;
            let agent = agents
                .get(id)
                .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))?;
            AgentCheckpoint::from_agent(agent, custom)
        };
        storage
            .save_checkpoint(id, &cp.to_json()?)
            .await
            .map_err(GatewayError::store)?;
        self.bus.publish(
            channels::AGENTS,
            "checkpointed",
            serde_json::json!({"agentId": id}),
        );
        Ok(cp)
    }

    /// Rehydrate a live agent from its checkpoint with identical id, state,
    /// history, usage, and grants.
    pub async fn recover_from_checkpoint(
        self: &Arc<Self>,
        cp: AgentCheckpoint,
    ) -> Result<AgentInfo> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::new(
                ErrorKind::ShutdownInProgress,
                "engine is shutting down",
            ));
        }
        let mut agents = self.agents.write().await;
        if agents.len() >= self.config.max_agents {
            return Err(GatewayError::new(
                ErrorKind::CapacityExceeded,
                format!("agent limit of {} reached", self.config.max_agents),
            ));
        }
        if agents.contains_key(&cp.agent_id) {
            return Err(GatewayError::new(
                ErrorKind::Conflict,
                format!("agent {} is already live", cp.agent_id),
            ));
        }

        let agent_id = cp.agent_id.clone();
        let manifest_json = serde_json::to_string(&cp.manifest)?;
        let grants = cp.grants.clone();
        let mut agent = cp.into_agent();
        agent.home_node = self.config.node_id.clone();
        let state = agent.state;
        let info = agent.info();
        agents.insert(agent_id.clone(), agent);
        drop(agents);

        self.persist_shell(&agent_id, &manifest_json, state, &grants).await;
        self.metrics.agents_live.fetch_add(1, Ordering::Relaxed);
        self.audit.record(
            "engine",
            "recover_checkpoint",
            "agent",
            &agent_id,
            AuditOutcome::Success,
            serde_json::json!({"state": state.as_str()}),
        );
        self.bus.publish(
            channels::AGENTS,
            "recovered",
            serde_json::json!({"agentId": agent_id, "state": state.as_str()}),
        );
        self.start_auto_checkpoint(agent_id);
        Ok(info)
    }

    /// Load a checkpoint blob from storage by agent id.
    pub async fn load_checkpoint(&self, id: &str) -> Result<AgentCheckpoint> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            GatewayError::new(ErrorKind::StoreUnavailable, "no persistence provider")
        })?;
        let json = storage
            .load_checkpoint(id)
            .await
            .map_err(GatewayError::store)?
            .ok_or_else(|| GatewayError::not_found(format!("checkpoint for agent {id}")))?;
        AgentCheckpoint::from_json(&json)
    }

    fn start_auto_checkpoint(self: &Arc<Self>, agent_id: String) {
        if self.config.checkpoint_interval.is_zero() || self.storage.is_none() {
            return;
        }
        let engine: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.checkpoint_interval;
        let id = agent_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else { break };
                if let Err(e) = engine.checkpoint(&id, Map::new()).await {
                    warn!(agent = %id, err = %e, "auto-checkpoint failed");
                }
            }
        });
        self.checkpoint_tasks
            .lock()
            .expect("task lock")
            .insert(agent_id, handle);
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    pub async fn list(&self) -> Vec<AgentInfo> {
        let agents = self.agents.read().await;
        let mut infos: Vec<AgentInfo> = agents.values().map(Agent::info).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn get_info(&self, id: &str) -> Result<AgentInfo> {
        let agents = self.agents.read().await;
        agents
            .get(id)
            .map(Agent::info)
            .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))
    }

    pub async fn history_of(&self, id: &str) -> Result<Vec<TransitionRecord>> {
        let agents = self.agents.read().await;
        agents
            .get(id)
            .map(|a| a.history.clone())
            .ok_or_else(|| GatewayError::not_found(format!("agent {id}")))
    }

    /// Whether this node owns the agent.
    pub async fn owns(&self, id: &str) -> bool {
        self.agents.read().await.contains_key(id)
    }

    // ─── Shutdown ───────────────────────────────────────────────────────────

    /// Parallel best-effort checkpoint of every live agent, then sequential
    /// terminate, bounded by `shutdown_timeout`.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        info!(agents = ids.len(), "lifecycle engine draining");

        if self.storage.is_some() {
            let checkpoints = ids.iter().map(|id| self.checkpoint(id, Map::new()));
            let all = futures_util::future::join_all(checkpoints);
            if tokio::time::timeout(self.config.shutdown_timeout, all)
                .await
                .is_err()
            {
                warn!("shutdown checkpoints exceeded the timeout — continuing");
            }
        }

        for id in ids {
            self.terminate(&id, Some("shutdown")).await;
        }
    }
}
