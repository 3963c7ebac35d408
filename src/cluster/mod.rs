// SPDX-License-Identifier: MIT
//! Cluster coordination: node registry, leader election, job locks, and
//! cross-node request forwarding.
//!
//! Every gateway instance upserts its row in `cluster_nodes` and refreshes
//! its heartbeat on a fixed interval. A single leader lease lives in the
//! `cluster_leader` row and is taken by conditional update — a node becomes
//! leader by writing itself over an expired (or its own) lease. Leadership
//! changes fan out to `on_change` subscribers and the event bus. With the
//! distributed scheduler enabled, per-job advisory locks replace leadership
//! gating.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, GatewayError, Result};
use crate::events::{channels, EventBus};
use crate::memory::retention::JobGate;
use crate::proto::{types, Frame};
use crate::storage::{ClusterNodeRow, Storage};

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    pub node_ws_url: String,
    /// Gateway auth token, replayed on the inter-node channel.
    pub auth_token: String,
    pub heartbeat_interval: Duration,
    pub lease_duration: Duration,
    /// A node whose heartbeat is older than this is treated as failed.
    pub stale_after: Duration,
    pub distributed_scheduler: bool,
    /// Budget for one forwarded request, handshake included.
    pub forward_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
            node_ws_url: "ws://127.0.0.1:4800".into(),
            auth_token: String::new(),
            heartbeat_interval: Duration::from_secs(5),
            lease_duration: Duration::from_secs(15),
            stale_after: Duration::from_secs(30),
            distributed_scheduler: false,
            forward_timeout: Duration::from_secs(30),
        }
    }
}

type LeadershipCallback = Box<dyn Fn(bool) + Send + Sync>;

pub struct ClusterCoordinator {
    config: ClusterConfig,
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    leader: AtomicBool,
    subscribers: StdMutex<Vec<LeadershipCallback>>,
}

impl ClusterCoordinator {
    pub fn new(config: ClusterConfig, storage: Arc<Storage>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            bus,
            leader: AtomicBool::new(false),
            subscribers: StdMutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Subscribe to leadership changes. Called with the new `is_leader`.
    pub fn on_change(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .push(Box::new(callback));
    }

    /// Insert or refresh this node's registry row.
    pub async fn register(&self) -> Result<()> {
        self.storage
            .upsert_node(&self.config.node_id, &self.config.node_ws_url, "follower")
            .await
            .map_err(GatewayError::store)?;
        info!(node = %self.config.node_id, url = %self.config.node_ws_url, "cluster node registered");
        Ok(())
    }

    /// One heartbeat round: refresh the registry row and contend for (or
    /// renew) the leader lease. Returns the current leadership.
    pub async fn heartbeat_once(self: &Arc<Self>) -> Result<bool> {
        self.storage
            .touch_node_heartbeat(&self.config.node_id)
            .await
            .map_err(GatewayError::store)?;

        let lease = ChronoDuration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| ChronoDuration::seconds(15));
        let acquired = self
            .storage
            .try_acquire_leader(&self.config.node_id, lease)
            .await
            .map_err(GatewayError::store)?;

        let was_leader = self.leader.swap(acquired, Ordering::SeqCst);
        if was_leader != acquired {
            let role = if acquired { "leader" } else { "follower" };
            info!(node = %self.config.node_id, role, "leadership changed");
            if let Err(e) = self.storage.set_node_role(&self.config.node_id, role).await {
                warn!(err = %e, "role row update failed");
            }
            self.bus.publish(
                channels::CLUSTER,
                "leadership_changed",
                serde_json::json!({"nodeId": self.config.node_id, "isLeader": acquired}),
            );
            for callback in self.subscribers.lock().expect("subscriber lock").iter() {
                callback(acquired);
            }
        }
        Ok(acquired)
    }

    /// Run register + heartbeat rounds until the coordinator is dropped.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else { break };
                if let Err(e) = coordinator.heartbeat_once().await {
                    warn!(err = %e, "cluster heartbeat failed");
                }
            }
        });
    }

    // ─── Registry queries ──────────────────────────────────────────────────

    fn stale_cutoff(&self) -> DateTime<Utc> {
        Utc::now()
            - ChronoDuration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(30))
    }

    /// Registry rows with a fresh heartbeat.
    pub async fn alive_nodes(&self) -> Result<Vec<ClusterNodeRow>> {
        let cutoff = self.stale_cutoff().to_rfc3339();
        let nodes = self
            .storage
            .list_nodes()
            .await
            .map_err(GatewayError::store)?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.last_heartbeat > cutoff)
            .collect())
    }

    /// The owning node's row, if it is alive. Dead owners yield
    /// `AgentUnreachable`.
    pub async fn live_owner(&self, home_node: &str) -> Result<ClusterNodeRow> {
        let node = self
            .storage
            .get_node(home_node)
            .await
            .map_err(GatewayError::store)?
            .ok_or_else(|| {
                GatewayError::new(
                    ErrorKind::AgentUnreachable,
                    format!("owner node {home_node} is not registered"),
                )
            })?;
        if node.last_heartbeat <= self.stale_cutoff().to_rfc3339() {
            return Err(GatewayError::new(
                ErrorKind::AgentUnreachable,
                format!("owner node {home_node} heartbeat is stale"),
            ));
        }
        Ok(node)
    }

    // ─── Forwarding ─────────────────────────────────────────────────────────

    /// Forward a frame to another node over its duplex endpoint and stream
    /// back every frame correlated to it, ending with the terminal one.
    pub async fn forward(&self, node: &ClusterNodeRow, frame: &Frame) -> Result<Vec<Frame>> {
        let result = tokio::time::timeout(
            self.config.forward_timeout,
            self.forward_inner(node, frame),
        )
        .await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(GatewayError::new(
                ErrorKind::Timeout,
                format!("forward to {} timed out", node.id),
            )),
        }
    }

    async fn forward_inner(&self, node: &ClusterNodeRow, frame: &Frame) -> Result<Vec<Frame>> {
        let correlation = frame.id.clone().ok_or_else(|| {
            GatewayError::validation("forwarded frames need a correlation id")
        })?;

        let (ws, _) = connect_async(&node.ws_url).await.map_err(|e| {
            GatewayError::new(
                ErrorKind::AgentUnreachable,
                format!("connect to {} failed: {e}", node.id),
            )
        })?;
        let (mut sink, mut stream) = ws.split();

        // The remote gateway may demand auth before anything else.
        let mut sent_request = false;
        if self.config.auth_token.is_empty() {
            sink.send(Message::Text(frame.to_json())).await.map_err(forward_err)?;
            sent_request = true;
        }

        let mut replies = Vec::new();
        while let Some(message) = stream.next().await {
            let message = message.map_err(forward_err)?;
            let text = match message {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let reply = Frame::parse(&text)?;
            match reply.kind.as_str() {
                types::AUTH_REQUIRED => {
                    sink.send(Message::Text(
                        Frame::new(types::AUTH)
                            .with_id("internode-auth")
                            .with_payload(serde_json::json!({"token": self.config.auth_token}))
                            .to_json(),
                    ))
                    .await
                    .map_err(forward_err)?;
                }
                types::AUTH_SUCCESS => {
                    if !sent_request {
                        sink.send(Message::Text(frame.to_json()))
                            .await
                            .map_err(forward_err)?;
                        sent_request = true;
                    }
                }
                types::AUTH_FAILED => {
                    return Err(GatewayError::new(
                        ErrorKind::Unauthenticated,
                        "inter-node auth rejected",
                    ));
                }
                _ => {
                    if reply.id.as_deref() != Some(correlation.as_str()) {
                        continue; // unrelated broadcast
                    }
                    let is_terminal = reply.kind != types::CHAT_STREAM;
                    replies.push(reply);
                    if is_terminal {
                        break;
                    }
                }
            }
        }

        if replies.is_empty() {
            return Err(GatewayError::new(
                ErrorKind::AgentUnreachable,
                format!("node {} closed without a reply", node.id),
            ));
        }
        debug!(node = %node.id, frames = replies.len(), "forwarded request completed");
        Ok(replies)
    }
}

fn forward_err(e: tokio_tungstenite::tungstenite::Error) -> GatewayError {
    GatewayError::new(ErrorKind::AgentUnreachable, format!("inter-node channel: {e}"))
}

/// Job gating: leadership by default, per-job advisory locks when the
/// distributed scheduler is on.
#[async_trait::async_trait]
impl JobGate for ClusterCoordinator {
    async fn try_acquire(&self, job_id: &str) -> bool {
        if !self.config.distributed_scheduler {
            return self.is_leader();
        }
        let ttl = ChronoDuration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| ChronoDuration::seconds(15));
        self.storage
            .try_acquire_job(job_id, &self.config.node_id, ttl)
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(node_id: &str, lease_ms: u64) -> ClusterConfig {
        ClusterConfig {
            node_id: node_id.into(),
            node_ws_url: format!("ws://127.0.0.1:0/{node_id}"),
            lease_duration: Duration::from_millis(lease_ms),
            stale_after: Duration::from_millis(lease_ms * 2),
            ..Default::default()
        }
    }

    async fn shared_storage() -> Arc<Storage> {
        Arc::new(Storage::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn first_node_wins_the_lease() {
        let storage = shared_storage().await;
        let bus = Arc::new(EventBus::new());
        let a = ClusterCoordinator::new(config("node-a", 60_000), storage.clone(), bus.clone());
        let b = ClusterCoordinator::new(config("node-b", 60_000), storage, bus);
        a.register().await.unwrap();
        b.register().await.unwrap();

        assert!(a.heartbeat_once().await.unwrap());
        assert!(!b.heartbeat_once().await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn follower_takes_over_after_lease_expiry() {
        let storage = shared_storage().await;
        let bus = Arc::new(EventBus::new());
        let a = ClusterCoordinator::new(config("node-a", 30), storage.clone(), bus.clone());
        let b = ClusterCoordinator::new(config("node-b", 30), storage, bus);
        a.register().await.unwrap();
        b.register().await.unwrap();

        let flips = Arc::new(AtomicUsize::new(0));
        let observed = flips.clone();
        b.on_change(move |is_leader| {
            if is_leader {
                observed.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(a.heartbeat_once().await.unwrap());
        // node-a stops heartbeating; its lease expires.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(b.heartbeat_once().await.unwrap());
        assert!(b.is_leader());
        assert_eq!(flips.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_nodes_drop_out_of_alive_set() {
        let storage = shared_storage().await;
        let bus = Arc::new(EventBus::new());
        let a = ClusterCoordinator::new(config("node-a", 30), storage.clone(), bus.clone());
        a.register().await.unwrap();
        assert_eq!(a.alive_nodes().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.alive_nodes().await.unwrap().is_empty());
        let err = a.live_owner("node-a").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AgentUnreachable);
    }

    #[tokio::test]
    async fn job_gate_uses_leadership_without_distributed_scheduler() {
        let storage = shared_storage().await;
        let bus = Arc::new(EventBus::new());
        let a = ClusterCoordinator::new(config("node-a", 60_000), storage, bus);
        a.register().await.unwrap();
        assert!(!a.try_acquire("sweep").await);
        a.heartbeat_once().await.unwrap();
        assert!(a.try_acquire("sweep").await);
    }

    #[tokio::test]
    async fn job_gate_uses_row_locks_with_distributed_scheduler() {
        let storage = shared_storage().await;
        let bus = Arc::new(EventBus::new());
        let mut cfg_a = config("node-a", 60_000);
        cfg_a.distributed_scheduler = true;
        let mut cfg_b = config("node-b", 60_000);
        cfg_b.distributed_scheduler = true;
        let a = ClusterCoordinator::new(cfg_a, storage.clone(), bus.clone());
        let b = ClusterCoordinator::new(cfg_b, storage, bus);

        // Neither is leader, but the lock decides.
        assert!(a.try_acquire("sweep").await);
        assert!(!b.try_acquire("sweep").await);
        assert!(b.try_acquire("other-job").await);
    }
}
