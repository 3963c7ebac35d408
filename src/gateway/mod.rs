// SPDX-License-Identifier: MIT
//! Gateway control plane.
//!
//! One duplex, message-framed WebSocket endpoint. Each connection gets its
//! own receive-loop task (reads are serialized per connection), an outbound
//! writer task, and an event fan-out task subscribed to the bus wildcard.
//! Authentication, per-IP connection limits, per-connection message rate
//! limits, and payload caps all live here; message semantics live in
//! `handlers`.

pub mod handlers;
pub mod health;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
};
use tracing::{debug, error, info, info_span, warn, Instrument as _};

use crate::error::{ErrorKind, GatewayError};
use crate::metrics::GatewayMetrics;
use crate::proto::{types, Frame};
use crate::GatewayContext;

/// Max new WebSocket connections per IP per minute.
const MAX_CONNECTIONS_PER_IP_PER_MIN: usize = 30;

/// Grace given to in-flight requests during drain.
const DRAIN_GRACE: std::time::Duration = std::time::Duration::from_secs(15);

// ─── Rate limiting ──────────────────────────────────────────────────────────

/// Per-IP connection rate tracker.
struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<std::time::Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Returns `true` if the connection should be allowed.
    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = std::time::Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);
        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_CONNECTIONS_PER_IP_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Sliding 60 s window over inbound messages for one connection.
pub(crate) struct MessageRateLimiter {
    limit: u64,
    events: VecDeque<DateTime<Utc>>,
}

impl MessageRateLimiter {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            limit,
            events: VecDeque::new(),
        }
    }

    /// Record one message; returns `false` when the window is exhausted.
    pub(crate) fn check(&mut self, now: DateTime<Utc>) -> bool {
        let cutoff = now - ChronoDuration::seconds(60);
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
        if self.events.len() as u64 >= self.limit {
            return false;
        }
        self.events.push_back(now);
        true
    }
}

/// Constant-time token comparison to prevent timing-based token oracles.
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ─── Connection state ────────────────────────────────────────────────────────

/// Mutable per-connection state owned by the receive loop.
pub struct Connection {
    pub id: String,
    pub subject: String,
    pub authenticated: bool,
    /// `subscribe_events` filter; `None` receives every event.
    pub agent_filter: Option<HashSet<String>>,
    rate: MessageRateLimiter,
    /// Correlation ids that already received their terminal reply.
    replied: HashSet<String>,
}

impl Connection {
    fn new(id: String, authenticated: bool, rate_limit: u64) -> Self {
        Self {
            id,
            subject: "anonymous".into(),
            authenticated,
            agent_filter: None,
            rate: MessageRateLimiter::new(rate_limit),
            replied: HashSet::new(),
        }
    }
}

/// Outbound frame channel shared by the dispatcher and the fan-out task.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    pub fn send(&self, frame: &Frame) {
        // Receiver gone means the writer task (and connection) closed.
        let _ = self.tx.send(frame.to_json());
    }
}

/// Send a terminal reply, enforcing at-most-one per correlation id.
pub(crate) fn send_terminal(conn: &mut Connection, out: &Outbound, frame: Frame) {
    if let Some(id) = &frame.id {
        if !conn.replied.insert(id.clone()) {
            warn!(conn = %conn.id, correlation = %id, "duplicate terminal reply suppressed");
            return;
        }
    }
    out.send(&frame);
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<GatewayContext>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", ctx.config.gateway.host, ctx.config.gateway.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    ctx.bus.publish(
        crate::events::channels::GATEWAY,
        "ready",
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "port": ctx.config.gateway.port,
        }),
    );

    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — draining");
                ctx.draining.store(true, Ordering::SeqCst);
                // Give in-flight requests their grace window: wait until every
                // connection closes or the budget runs out.
                let grace = DRAIN_GRACE.min(std::time::Duration::from_millis(
                    ctx.config.runtime.shutdown_timeout_ms,
                ));
                let deadline = tokio::time::Instant::now() + grace;
                while ctx.metrics.connections_active.load(Ordering::Relaxed) > 0
                    && tokio::time::Instant::now() < deadline
                {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                ctx.engine.shutdown().await;
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                if ctx.draining.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                if ctx.metrics.connections_active.load(Ordering::Relaxed)
                    >= ctx.config.gateway.max_connections as i64
                {
                    warn!(peer = %peer, "connection cap reached — rejecting");
                    drop(stream);
                    continue;
                }
                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                        drop(stream);
                        continue;
                    }
                }

                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        debug!(peer = %peer, err = %e, "connection closed with error");
                    }
                });
            }
        }
    }

    info!("gateway stopped");
    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C.
fn make_shutdown_future() -> impl std::future::Future<Output = ()> {
    async {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<GatewayContext>) -> anyhow::Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.config.gateway.max_payload_size),
        max_frame_size: Some(ctx.config.gateway.max_payload_size),
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut reader) = ws.split();

    let conn_id = uuid::Uuid::new_v4().to_string();
    GatewayMetrics::inc(&ctx.metrics.connections_total);
    ctx.metrics.connections_active.fetch_add(1, Ordering::Relaxed);

    // Outbound writer task: the single owner of the sink half.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    let out = Outbound { tx: out_tx };

    let auth_required = !ctx.config.gateway.auth_token.is_empty();
    let mut conn = Connection::new(
        conn_id.clone(),
        !auth_required,
        ctx.config.gateway.message_rate_limit,
    );

    // ── Auth handshake ──────────────────────────────────────────────────────
    if auth_required {
        out.send(&Frame::new(types::AUTH_REQUIRED));
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = Frame::parse(&text).unwrap_or_else(|_| Frame::new("invalid"));
                let token = frame
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("token"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                if frame.kind == types::AUTH
                    && tokens_equal(token, &ctx.config.gateway.auth_token)
                {
                    conn.authenticated = true;
                    conn.subject = frame
                        .payload
                        .as_ref()
                        .and_then(|p| p.get("subject"))
                        .and_then(|s| s.as_str())
                        .unwrap_or("client")
                        .to_string();
                    out.send(&Frame::reply(
                        types::AUTH_SUCCESS,
                        frame.id.as_deref(),
                        serde_json::json!({"connectionId": conn_id}),
                    ));
                } else {
                    warn!(conn = %conn_id, "authentication failed");
                    out.send(&Frame::reply(
                        types::AUTH_FAILED,
                        frame.id.as_deref(),
                        serde_json::json!({"message": "invalid token"}),
                    ));
                    ctx.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
                    drop(out);
                    let _ = writer.await;
                    return Ok(());
                }
            }
            _ => {
                ctx.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
                drop(out);
                let _ = writer.await;
                return Ok(());
            }
        }
    }

    // ── Event fan-out ───────────────────────────────────────────────────────
    // The filter lives in the receive loop; share it through a watch channel.
    let (filter_tx, filter_rx) = tokio::sync::watch::channel::<Option<HashSet<String>>>(None);
    let fanout = {
        let mut events = ctx.bus.subscribe_all();
        let out = out.clone();
        let metrics = ctx.metrics.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let wanted = {
                    let filter = filter_rx.borrow();
                    match filter.as_ref() {
                        None => true,
                        Some(agents) => event
                            .data
                            .get("agentId")
                            .and_then(|a| a.as_str())
                            .map(|a| agents.contains(a))
                            .unwrap_or(false),
                    }
                };
                if wanted {
                    GatewayMetrics::inc(&metrics.events_broadcast_total);
                    out.send(&Frame::event(&event.channel, &event.event_type, event.data));
                }
            }
        })
    };

    // ── Receive loop ────────────────────────────────────────────────────────
    while let Some(message) = reader.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(conn = %conn_id, err = %e, "read error");
                break;
            }
        };
        let text = match message {
            Message::Text(t) => t,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
            Message::Binary(_) => {
                let err = GatewayError::validation("binary frames are not supported");
                out.send(&Frame::error(None, &err));
                continue;
            }
            _ => continue,
        };

        GatewayMetrics::inc(&ctx.metrics.messages_total);
        if !conn.rate.check(Utc::now()) {
            GatewayMetrics::inc(&ctx.metrics.rate_limited_total);
            let err = GatewayError::new(
                ErrorKind::RateLimited,
                format!(
                    "more than {} messages in 60s",
                    ctx.config.gateway.message_rate_limit
                ),
            );
            out.send(&Frame::error(None, &err));
            continue;
        }

        let frame = match Frame::parse(&text) {
            Ok(f) => f,
            Err(e) => {
                out.send(&Frame::error(None, &e));
                continue;
            }
        };

        let started = std::time::Instant::now();
        let span = info_span!(
            "dispatch",
            conn = %conn_id,
            correlation = frame.id.as_deref().unwrap_or("-"),
            kind = %frame.kind
        );
        handlers::dispatch(&ctx, &mut conn, frame, &out, &filter_tx)
            .instrument(span)
            .await;
        ctx.metrics
            .request_latency
            .observe_ms(started.elapsed().as_millis() as u64);

        if ctx.draining.load(Ordering::SeqCst) {
            break;
        }
    }

    fanout.abort();
    ctx.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
    drop(out);
    let _ = writer.await;
    debug!(conn = %conn_id, "connection closed");
    Ok(())
}
