// SPDX-License-Identifier: MIT
//! Liveness and metrics endpoint.
//!
//! Plain HTTP on `gateway.port + 1`: `GET /health` returns the status
//! document, `GET /metrics` the Prometheus text exposition. Closed during
//! drain before the process exits.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

use crate::GatewayContext;

pub fn build_router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(ctx)
}

/// Serve until the gateway starts draining.
pub async fn run(ctx: Arc<GatewayContext>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", ctx.config.gateway.host, ctx.config.gateway.port + 1);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "health endpoint listening");

    let drain_ctx = ctx.clone();
    let router = build_router(ctx);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            loop {
                if drain_ctx.draining.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        })
        .await?;
    info!("health endpoint closed");
    Ok(())
}

/// `ok` iff every registered provider is healthy and the store is
/// reachable; `error` iff no provider is healthy; `degraded` otherwise.
async fn health(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    let providers = ctx.router.health().await;
    let healthy = providers
        .iter()
        .filter(|p| p.breaker_state != "open")
        .count();
    let store_ok = ctx.storage.ping().await.is_ok();

    let status = if providers.is_empty() || healthy == 0 {
        "error"
    } else if healthy == providers.len() && store_ok {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.metrics.started_at.elapsed().as_secs(),
        "providers": providers,
        "agents": ctx.engine.count().await,
        "connections": ctx.metrics.connections_active.load(Ordering::Relaxed),
        "store": store_ok,
        "timestamp": chrono::Utc::now(),
    }))
}

async fn metrics(State(ctx): State<Arc<GatewayContext>>) -> String {
    ctx.metrics.render_prometheus()
}
