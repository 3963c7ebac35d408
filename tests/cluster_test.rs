// SPDX-License-Identifier: MIT
//! Cluster coordination tests over a shared store: leader failover and
//! agent home-node registration.

mod common;

use common::manifest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentd::audit::AuditLogger;
use agentd::cluster::{ClusterConfig, ClusterCoordinator};
use agentd::events::EventBus;
use agentd::lifecycle::{EngineConfig, LifecycleEngine};
use agentd::metrics::GatewayMetrics;
use agentd::storage::Storage;

fn node_config(node_id: &str, lease_ms: u64) -> ClusterConfig {
    ClusterConfig {
        node_id: node_id.into(),
        node_ws_url: format!("ws://127.0.0.1:0/{node_id}"),
        lease_duration: Duration::from_millis(lease_ms),
        stale_after: Duration::from_millis(lease_ms * 3),
        ..ClusterConfig::default()
    }
}

fn engine_on(node_id: &str, storage: Arc<Storage>, bus: Arc<EventBus>) -> Arc<LifecycleEngine> {
    LifecycleEngine::new(
        EngineConfig {
            node_id: node_id.into(),
            checkpoint_interval: Duration::ZERO,
            ..EngineConfig::default()
        },
        Some(storage),
        bus,
        Arc::new(AuditLogger::new(vec![])),
        Arc::new(GatewayMetrics::new()),
    )
}

#[tokio::test]
async fn leader_failover_hands_work_to_the_follower() {
    let storage = Arc::new(Storage::in_memory().await.unwrap());
    let bus = Arc::new(EventBus::new());

    let node_a = ClusterCoordinator::new(node_config("node-a", 40), storage.clone(), bus.clone());
    let node_b = ClusterCoordinator::new(node_config("node-b", 40), storage.clone(), bus.clone());
    node_a.register().await.unwrap();
    node_b.register().await.unwrap();

    // Scheduler hook: starts when leadership is gained.
    let scheduler_running = Arc::new(AtomicBool::new(false));
    let hook = scheduler_running.clone();
    node_b.on_change(move |is_leader| hook.store(is_leader, Ordering::SeqCst));

    assert!(node_a.heartbeat_once().await.unwrap());
    assert!(!node_b.heartbeat_once().await.unwrap());
    assert!(!scheduler_running.load(Ordering::SeqCst));

    // node-a stops heartbeating; its lease lapses and B takes over.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(node_b.heartbeat_once().await.unwrap());
    assert!(node_b.is_leader());
    assert!(scheduler_running.load(Ordering::SeqCst));

    // A subsequent spawn on B registers B as the agent's home node.
    let engine_b = engine_on("node-b", storage.clone(), bus);
    let spawned = engine_b
        .spawn(manifest("a1", &["llm:chat"]), None)
        .await
        .unwrap();
    assert_eq!(spawned.home_node, "node-b");
    let row = storage.get_agent(&spawned.agent_id).await.unwrap().unwrap();
    assert_eq!(row.home_node, "node-b");
}

#[tokio::test]
async fn requests_for_dead_owners_are_unreachable() {
    let storage = Arc::new(Storage::in_memory().await.unwrap());
    let bus = Arc::new(EventBus::new());

    let node_a = ClusterCoordinator::new(node_config("node-a", 40), storage.clone(), bus.clone());
    node_a.register().await.unwrap();

    // An agent homed on node-a, whose heartbeat then goes stale.
    let engine_a = engine_on("node-a", storage.clone(), bus.clone());
    let spawned = engine_a.spawn(manifest("a1", &[]), None).await.unwrap();

    let node_b = ClusterCoordinator::new(node_config("node-b", 40), storage.clone(), bus);
    node_b.register().await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let row = storage.get_agent(&spawned.agent_id).await.unwrap().unwrap();
    let err = node_b.live_owner(&row.home_node).await.unwrap_err();
    assert_eq!(err.kind, agentd::error::ErrorKind::AgentUnreachable);
}

#[tokio::test]
async fn role_rows_track_leadership() {
    let storage = Arc::new(Storage::in_memory().await.unwrap());
    let bus = Arc::new(EventBus::new());
    let node_a = ClusterCoordinator::new(node_config("node-a", 60_000), storage.clone(), bus);
    node_a.register().await.unwrap();
    node_a.heartbeat_once().await.unwrap();

    let nodes = storage.list_nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].role, "leader");
}
