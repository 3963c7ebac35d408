// SPDX-License-Identifier: MIT
//! Shared fixtures: an in-memory lifecycle engine and a real daemon on a
//! free port with a WebSocket test client.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use agentd::audit::AuditLogger;
use agentd::config::{
    ClusterSection, GatewayConfig, GatewaySection, MemorySection, RetentionSection, RuntimeSection,
};
use agentd::events::EventBus;
use agentd::gateway;
use agentd::lifecycle::agent::{AgentManifest, ResourceLimitOverrides};
use agentd::lifecycle::{EngineConfig, LifecycleEngine};
use agentd::metrics::GatewayMetrics;
use agentd::proto::Frame;
use agentd::router::provider::ModelProvider;
use agentd::storage::Storage;
use agentd::GatewayContext;

pub fn manifest(id: &str, capabilities: &[&str]) -> AgentManifest {
    AgentManifest {
        id: id.to_string(),
        version: "0.1.0".into(),
        description: String::new(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        limits: ResourceLimitOverrides::default(),
        entry_point: None,
        signature: None,
    }
}

pub struct EngineFixture {
    pub engine: Arc<LifecycleEngine>,
    pub storage: Arc<Storage>,
    pub bus: Arc<EventBus>,
}

pub async fn engine_fixture(max_agents: usize) -> EngineFixture {
    let storage = Arc::new(Storage::in_memory().await.unwrap());
    let bus = Arc::new(EventBus::new());
    let engine = LifecycleEngine::new(
        EngineConfig {
            node_id: "node-test".into(),
            max_agents,
            checkpoint_interval: Duration::ZERO,
            drain_delay: Duration::from_millis(20),
            ..EngineConfig::default()
        },
        Some(storage.clone()),
        bus.clone(),
        Arc::new(AuditLogger::new(vec![])),
        Arc::new(GatewayMetrics::new()),
    );
    EngineFixture {
        engine,
        storage,
        bus,
    }
}

// ─── Daemon fixture ──────────────────────────────────────────────────────────

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn test_config(port: u16, auth_token: &str) -> GatewayConfig {
    GatewayConfig {
        data_dir: tempfile::tempdir().unwrap().keep(),
        log: "warn".into(),
        gateway: GatewaySection {
            host: "127.0.0.1".into(),
            port,
            auth_token: auth_token.to_string(),
            max_connections: 16,
            message_rate_limit: 1000,
            max_payload_size: 1024 * 1024,
        },
        cluster: ClusterSection {
            enabled: false,
            node_ws_url: format!("ws://127.0.0.1:{port}"),
            distributed_scheduler: false,
        },
        runtime: RuntimeSection {
            max_agents: 8,
            default_memory_limit: 64 * 1024 * 1024,
            heartbeat_timeout_ms: 60_000,
            shutdown_timeout_ms: 2_000,
            checkpoint_interval_ms: 0,
        },
        memory: MemorySection {
            encryption_enabled: false,
            master_key: None,
        },
        retention: RetentionSection {
            episodic_days: 90,
            semantic_days: 365,
            procedural_days: 365,
            archive_days: 0,
            archive_text_limit: 4096,
        },
        permission_secret: "test-permission-secret-0123456789ab".into(),
        enforce_egress_proxy: false,
        egress_proxy_url: None,
        enforce_production_hardening: false,
    }
}

pub struct TestDaemon {
    pub ctx: Arc<GatewayContext>,
    pub url: String,
}

/// Boot a full daemon on a free port and wait for it to accept.
pub async fn start_daemon(auth_token: &str, providers: Vec<Arc<dyn ModelProvider>>) -> TestDaemon {
    let port = free_port();
    let config = test_config(port, auth_token);
    let ctx = GatewayContext::bootstrap(config, providers).await.unwrap();

    let server_ctx = ctx.clone();
    tokio::spawn(async move {
        gateway::run(server_ctx).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestDaemon {
        ctx,
        url: format!("ws://127.0.0.1:{port}"),
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl Client {
    /// Connect and complete the auth handshake when a token is supplied.
    pub async fn connect(url: &str, token: Option<&str>) -> Self {
        let (ws, _) = connect_async(url).await.expect("connect");
        let mut client = Self { ws, next_id: 0 };

        if let Some(token) = token {
            let challenge = client.next_frame().await.expect("auth_required");
            assert_eq!(challenge.kind, "auth_required");
            client
                .send_frame(
                    Frame::new("auth")
                        .with_id("auth-0")
                        .with_payload(serde_json::json!({"token": token, "subject": "client"})),
                )
                .await;
            let result = client.next_frame().await.expect("auth reply");
            assert_eq!(result.kind, "auth_success", "auth rejected: {result:?}");
        }
        client
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        self.ws
            .send(Message::Text(frame.to_json()))
            .await
            .expect("send");
    }

    /// Next text frame of any kind.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return Some(Frame::parse(&text).expect("well-formed frame"));
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => return None,
                Err(_) => panic!("timed out waiting for a frame"),
            }
        }
    }

    /// Send a request and return the first non-event frame correlated to it.
    pub async fn request(&mut self, kind: &str, payload: serde_json::Value) -> Frame {
        self.next_id += 1;
        let id = format!("req-{}", self.next_id);
        self.send_frame(Frame::new(kind).with_id(&id).with_payload(payload))
            .await;
        self.wait_for(&id).await
    }

    /// Skip unrelated frames (events, stream chunks for other requests)
    /// until one matches `id`.
    pub async fn wait_for(&mut self, id: &str) -> Frame {
        loop {
            let frame = self.next_frame().await.expect("reply before close");
            if frame.id.as_deref() == Some(id) {
                return frame;
            }
        }
    }
}

/// Poll until `predicate` holds or the budget runs out.
pub async fn eventually<F, Fut>(budget: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {budget:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
