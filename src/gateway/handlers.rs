// SPDX-License-Identifier: MIT
//! Control-plane message handlers.
//!
//! `dispatch` routes one inbound frame to its handler and guarantees the
//! reply contract: every failed request gets exactly one `error` frame with
//! the originating correlation id; streaming requests emit ≥0 `chat_stream`
//! chunks followed by exactly one `chat_stream_end`.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::capability::CapabilityGrant;
use crate::error::{ErrorKind, GatewayError, Result};
use crate::gateway::{send_terminal, Connection, Outbound};
use crate::lifecycle::agent::manifest_from_payload;
use crate::proto::{types, Frame};
use crate::router::provider::ChatRequest;
use crate::GatewayContext;

pub async fn dispatch(
    ctx: &Arc<GatewayContext>,
    conn: &mut Connection,
    frame: Frame,
    out: &Outbound,
    filter_tx: &watch::Sender<Option<HashSet<String>>>,
) {
    let correlation = frame.id.clone();
    match route(ctx, conn, &frame, out, filter_tx).await {
        Ok(Some(reply)) => send_terminal(conn, out, reply),
        Ok(None) => {} // handler already emitted its terminal frame
        Err(e) => {
            debug!(kind = %frame.kind, err = %e, "request failed");
            send_terminal(conn, out, Frame::error(correlation.as_deref(), &e));
        }
    }
}

async fn route(
    ctx: &Arc<GatewayContext>,
    conn: &mut Connection,
    frame: &Frame,
    out: &Outbound,
    filter_tx: &watch::Sender<Option<HashSet<String>>>,
) -> Result<Option<Frame>> {
    let id = frame.id.as_deref();
    let payload = payload_obj(frame);

    match frame.kind.as_str() {
        types::PING => Ok(Some(Frame::reply(
            types::PONG,
            id,
            json!({"timestamp": Utc::now()}),
        ))),

        // Re-auth on an authenticated connection is a no-op ack.
        types::AUTH => Ok(Some(Frame::reply(
            types::AUTH_SUCCESS,
            id,
            json!({"connectionId": conn.id}),
        ))),

        types::AGENT_SPAWN => handle_spawn(ctx, &payload, id).await,
        types::AGENT_LIST => {
            let agents = ctx.engine.list().await;
            Ok(Some(Frame::reply(
                types::AGENT_LIST,
                id,
                json!({"agents": agents}),
            )))
        }
        types::AGENT_STATUS => {
            let agent_id = require_str(&payload, "agentId")?;
            if forward_if_remote(ctx, conn, frame, agent_id, out).await? {
                return Ok(None);
            }
            let info = ctx.engine.get_info(agent_id).await?;
            let history = ctx.engine.history_of(agent_id).await?;
            Ok(Some(Frame::reply(
                types::AGENT_STATUS,
                id,
                json!({"agent": info, "history": history}),
            )))
        }
        types::AGENT_TERMINATE => {
            let agent_id = require_str(&payload, "agentId")?;
            if forward_if_remote(ctx, conn, frame, agent_id, out).await? {
                return Ok(None);
            }
            let reason = payload.get("reason").and_then(Value::as_str);
            let terminated = ctx.engine.terminate(agent_id, reason).await;
            Ok(Some(Frame::reply(
                types::AGENT_TERMINATE_RESULT,
                id,
                json!({"agentId": agent_id, "terminated": terminated}),
            )))
        }
        types::AGENT_TASK => handle_task(ctx, conn, frame, &payload, out).await,
        types::CHAT => handle_chat(ctx, conn, frame, &payload, out).await,

        types::CAPABILITY_CHECK => {
            let agent_id = require_str(&payload, "agentId")?;
            let capability = require_str(&payload, "capability")?;
            let context = payload
                .get("context")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let check = ctx.engine.check_capability(agent_id, capability, &context).await?;

            // When the context names a policy-classed target (path, host,
            // command, secret), the sandbox grant alone is not enough — the
            // policy rule set gets the final word.
            let (mut allowed, mut reason) = (check.allowed, check.reason);
            if allowed {
                if let Some(policy_ctx) = policy_context(agent_id, &context) {
                    let decision = ctx.policy.evaluate(&policy_ctx).await;
                    if !decision.allowed {
                        allowed = false;
                        reason = decision.reason;
                    }
                }
            }
            Ok(Some(Frame::reply(
                types::CAPABILITY_CHECK_RESULT,
                id,
                json!({"allowed": allowed, "capability": check.capability, "reason": reason}),
            )))
        }
        types::CAPABILITY_GRANT => handle_grant(ctx, conn, &payload, id).await,
        types::CAPABILITY_REVOKE => {
            let agent_id = require_str(&payload, "agentId")?;
            let capability = require_str(&payload, "capability")?;
            let removed = ctx.engine.revoke_capability(agent_id, capability).await?;
            Ok(Some(Frame::reply(
                types::CAPABILITY_REVOKE,
                id,
                json!({"agentId": agent_id, "removed": removed}),
            )))
        }
        types::CAPABILITY_LIST => {
            let agent_id = require_str(&payload, "agentId")?;
            let grants = ctx.engine.list_grants(agent_id).await?;
            Ok(Some(Frame::reply(
                types::CAPABILITY_LIST,
                id,
                json!({"agentId": agent_id, "grants": grants}),
            )))
        }

        types::SUBSCRIBE_EVENTS => {
            let filter: Option<HashSet<String>> = payload
                .get("agentIds")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                });
            conn.agent_filter = filter.clone();
            let _ = filter_tx.send(filter.clone());
            Ok(Some(Frame::reply(
                types::SUBSCRIBE_EVENTS,
                id,
                json!({"subscribed": true, "agentIds": filter}),
            )))
        }

        other => Err(GatewayError::validation(format!(
            "unknown message type {other:?}"
        ))),
    }
}

// ─── Agent handlers ──────────────────────────────────────────────────────────

async fn handle_spawn(
    ctx: &Arc<GatewayContext>,
    payload: &Map<String, Value>,
    id: Option<&str>,
) -> Result<Option<Frame>> {
    let parent_id = payload
        .get("parentId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let manifest = manifest_from_payload(payload)?;
    let spawned = ctx.engine.spawn(manifest, parent_id).await?;
    let info = ctx.engine.initialize(&spawned.agent_id).await?;
    Ok(Some(Frame::reply(
        types::AGENT_SPAWN_RESULT,
        id,
        json!({"agentId": info.agent_id, "status": info.state.as_str()}),
    )))
}

async fn handle_task(
    ctx: &Arc<GatewayContext>,
    conn: &mut Connection,
    frame: &Frame,
    payload: &Map<String, Value>,
    out: &Outbound,
) -> Result<Option<Frame>> {
    let agent_id = require_str(payload, "agentId")?.to_string();
    if forward_if_remote(ctx, conn, frame, &agent_id, out).await? {
        return Ok(None);
    }

    let req = chat_request(payload)?;
    require_capability(ctx, &agent_id, "llm:chat", &req.model).await?;

    ctx.engine.start(&agent_id).await?;
    match ctx.router.route(&req).await {
        Ok(resp) => {
            ctx.engine
                .record_usage(
                    &agent_id,
                    &resp.model,
                    resp.usage.input_tokens,
                    resp.usage.output_tokens,
                )
                .await;
            ctx.engine.complete(&agent_id).await?;
            Ok(Some(Frame::reply(
                types::AGENT_TASK_RESULT,
                frame.id.as_deref(),
                json!({
                    "agentId": agent_id,
                    "model": resp.model,
                    "content": resp.content,
                    "provider": resp.provider_id,
                }),
            )))
        }
        Err(e) => {
            let _ = ctx.engine.fail(&agent_id, &e.message).await;
            Err(e)
        }
    }
}

async fn handle_chat(
    ctx: &Arc<GatewayContext>,
    conn: &mut Connection,
    frame: &Frame,
    payload: &Map<String, Value>,
    out: &Outbound,
) -> Result<Option<Frame>> {
    let agent_id = payload
        .get("agentId")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(agent_id) = &agent_id {
        if forward_if_remote(ctx, conn, frame, agent_id, out).await? {
            return Ok(None);
        }
    }

    let req = chat_request(payload)?;
    let streaming = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if let Some(agent_id) = &agent_id {
        require_capability(ctx, agent_id, "llm:chat", &req.model).await?;
    }

    if !streaming {
        let resp = ctx.router.route(&req).await?;
        ctx.audit.record(
            conn.subject.clone(),
            "chat",
            "agent",
            agent_id.as_deref().unwrap_or("-"),
            crate::audit::AuditOutcome::Success,
            json!({"model": resp.model, "provider": resp.provider_id}),
        );
        if let Some(agent_id) = &agent_id {
            ctx.engine
                .record_usage(
                    agent_id,
                    &resp.model,
                    resp.usage.input_tokens,
                    resp.usage.output_tokens,
                )
                .await;
        }
        return Ok(Some(Frame::reply(
            types::CHAT_RESPONSE,
            frame.id.as_deref(),
            json!({
                "model": resp.model,
                "content": resp.content,
                "usage": resp.usage,
                "provider": resp.provider_id,
            }),
        )));
    }

    // ── Streaming: ≥0 chat_stream chunks, exactly one chat_stream_end ──────
    let controller = ctx.router.stream(&req).await?;
    let mut chunks = controller
        .take_chunks()
        .ok_or_else(|| GatewayError::internal("stream chunks already taken"))?;
    let correlation = frame.id.clone();

    while let Some(chunk) = chunks.recv().await {
        if chunk.is_complete {
            break;
        }
        out.send(&Frame::reply(
            types::CHAT_STREAM,
            correlation.as_deref(),
            json!({
                "content": chunk.content,
                "isComplete": false,
                "model": chunk.model,
            }),
        ));
    }

    let outcome = controller.wait().await?;
    if let Some(agent_id) = &agent_id {
        let output_tokens = outcome.content.split_whitespace().count() as u64;
        ctx.engine
            .record_usage(agent_id, &req.model, 0, output_tokens)
            .await;
    }
    send_terminal(
        conn,
        out,
        Frame::reply(
            types::CHAT_STREAM_END,
            correlation.as_deref(),
            json!({
                "content": outcome.content,
                "chunks": outcome.chunk_count,
                "durationMs": outcome.duration.as_millis() as u64,
                "aborted": outcome.aborted,
                "error": outcome.error,
            }),
        ),
    );
    Ok(None)
}

async fn handle_grant(
    ctx: &Arc<GatewayContext>,
    conn: &mut Connection,
    payload: &Map<String, Value>,
    id: Option<&str>,
) -> Result<Option<Frame>> {
    let agent_id = require_str(payload, "agentId")?;
    let capability = require_str(payload, "capability")?;

    // A delegation token proves the caller may hand out grants. Without one
    // the grant is only honored when the gateway runs without client auth
    // (dev mode).
    if let Some(token) = payload.get("token").and_then(Value::as_str) {
        let claims = ctx.tokens.verify(token, &conn.subject)?;
        if !claims.grants("capability:delegate") {
            return Err(GatewayError::new(
                ErrorKind::Forbidden,
                "token does not grant capability:delegate",
            ));
        }
    } else if !ctx.config.gateway.auth_token.is_empty() {
        return Err(GatewayError::new(
            ErrorKind::Forbidden,
            "capability_grant requires a delegation token",
        ));
    }

    let mut grant = CapabilityGrant::new(capability, &conn.subject);
    if let Some(expires) = payload.get("expiresAt").and_then(Value::as_str) {
        let parsed: DateTime<Utc> = expires
            .parse()
            .map_err(|_| GatewayError::validation("expiresAt must be RFC 3339"))?;
        grant = grant.with_expiry(parsed);
    }
    if let Some(constraints) = payload.get("constraints").and_then(Value::as_object) {
        grant = grant.with_constraints(constraints.clone());
    }
    ctx.engine.grant_capability(agent_id, grant).await?;
    Ok(Some(Frame::reply(
        types::CAPABILITY_GRANT,
        id,
        json!({"agentId": agent_id, "capability": capability, "granted": true}),
    )))
}

// ─── Cross-node forwarding ───────────────────────────────────────────────────

/// When the agent lives on another node, forward the frame there and pipe
/// the correlated replies back through this connection. Returns `true` when
/// the request was fully handled remotely.
async fn forward_if_remote(
    ctx: &Arc<GatewayContext>,
    conn: &mut Connection,
    frame: &Frame,
    agent_id: &str,
    out: &Outbound,
) -> Result<bool> {
    if ctx.engine.owns(agent_id).await {
        return Ok(false);
    }
    let Some(cluster) = &ctx.cluster else {
        return Ok(false);
    };

    let Some(row) = ctx
        .storage
        .get_agent(agent_id)
        .await
        .map_err(GatewayError::store)?
    else {
        return Ok(false); // let the local handler produce NotFound
    };
    if row.home_node == ctx.engine.node_id() {
        return Ok(false);
    }

    let owner = cluster.live_owner(&row.home_node).await?;
    debug!(agent = agent_id, owner = %owner.id, "forwarding to home node");
    let replies = cluster.forward(&owner, frame).await?;
    let last = replies.len().saturating_sub(1);
    for (i, reply) in replies.into_iter().enumerate() {
        if i == last {
            send_terminal(conn, out, reply);
        } else {
            out.send(&reply);
        }
    }
    Ok(true)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn payload_obj(frame: &Frame) -> Map<String, Value> {
    frame
        .payload
        .as_ref()
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn require_str<'a>(payload: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::validation(format!("missing field {key:?}")))
}

fn chat_request(payload: &Map<String, Value>) -> Result<ChatRequest> {
    let mut trimmed = payload.clone();
    trimmed.remove("agentId");
    trimmed.remove("stream");
    serde_json::from_value(Value::Object(trimmed))
        .map_err(|e| GatewayError::validation(format!("invalid chat request: {e}")))
}

/// Map a capability-check context onto the policy engine's resource classes.
fn policy_context(
    agent_id: &str,
    context: &Map<String, Value>,
) -> Option<crate::policy::PolicyContext> {
    use crate::policy::ResourceClass;
    let (class, target) = if let Some(path) = context.get("path").and_then(Value::as_str) {
        (ResourceClass::File, path)
    } else if let Some(host) = context.get("host").and_then(Value::as_str) {
        (ResourceClass::Network, host)
    } else if let Some(command) = context.get("command").and_then(Value::as_str) {
        (ResourceClass::Shell, command)
    } else if let Some(secret) = context.get("secret").and_then(Value::as_str) {
        (ResourceClass::Secret, secret)
    } else {
        return None;
    };
    Some(crate::policy::PolicyContext {
        agent_id: agent_id.to_string(),
        class,
        target: target.to_string(),
        operation: context
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("access")
            .to_string(),
    })
}

/// Sandbox gate for agent-bound model calls.
async fn require_capability(
    ctx: &Arc<GatewayContext>,
    agent_id: &str,
    capability: &str,
    model: &str,
) -> Result<()> {
    let mut context = Map::new();
    context.insert("model".into(), Value::String(model.to_string()));
    let check = ctx.engine.check_capability(agent_id, capability, &context).await?;
    if !check.allowed {
        return Err(GatewayError::new(
            ErrorKind::CapabilityDenied,
            format!("{}: {}", check.capability, check.reason),
        ));
    }
    Ok(())
}
