// SPDX-License-Identifier: MIT
//! Control-plane wire protocol.
//!
//! Every frame on the duplex connection is one UTF-8 JSON object:
//! `{type, id?, payload?, timestamp?}`. Request/response pairs share the
//! same `id` (correlation id); unsolicited frames carry `type: "event"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, GatewayError};

// ─── Frame ───────────────────────────────────────────────────────────────────

/// One control-plane message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id — present on any frame that expects or answers a reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Frame {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            payload: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Reply frame correlated to an inbound trigger.
    pub fn reply(kind: impl Into<String>, correlation: Option<&str>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            id: correlation.map(str::to_string),
            payload: Some(payload),
            timestamp: Some(Utc::now()),
        }
    }

    /// Terminal `error` frame for a failed request.
    pub fn error(correlation: Option<&str>, err: &GatewayError) -> Self {
        Self::reply(
            types::ERROR,
            correlation,
            serde_json::json!({
                "code": err.kind.code(),
                "message": err.message,
                "retriable": err.kind.retriable(),
            }),
        )
    }

    /// Unsolicited bus event wrapped for fan-out to subscribers.
    pub fn event(channel: &str, event_type: &str, data: Value) -> Self {
        Self {
            kind: types::EVENT.into(),
            id: None,
            payload: Some(serde_json::json!({
                "channel": channel,
                "type": event_type,
                "data": data,
                "timestamp": Utc::now(),
            })),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text)
            .map_err(|e| GatewayError::new(ErrorKind::Validation, format!("malformed frame: {e}")))
    }
}

// ─── Message type vocabulary ─────────────────────────────────────────────────

/// Frame `type` strings. Kept as constants so handlers and tests never drift.
pub mod types {
    pub const AUTH: &str = "auth";
    pub const AUTH_REQUIRED: &str = "auth_required";
    pub const AUTH_SUCCESS: &str = "auth_success";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const AGENT_SPAWN: &str = "agent_spawn";
    pub const AGENT_SPAWN_RESULT: &str = "agent_spawn_result";
    pub const AGENT_STATUS: &str = "agent_status";
    pub const AGENT_LIST: &str = "agent_list";
    pub const AGENT_TASK: &str = "agent_task";
    pub const AGENT_TASK_RESULT: &str = "agent_task_result";
    pub const AGENT_TERMINATE: &str = "agent_terminate";
    pub const AGENT_TERMINATE_RESULT: &str = "agent_terminate_result";
    pub const CHAT: &str = "chat";
    pub const CHAT_RESPONSE: &str = "chat_response";
    pub const CHAT_STREAM: &str = "chat_stream";
    pub const CHAT_STREAM_END: &str = "chat_stream_end";
    pub const CAPABILITY_CHECK: &str = "capability_check";
    pub const CAPABILITY_CHECK_RESULT: &str = "capability_check_result";
    pub const CAPABILITY_GRANT: &str = "capability_grant";
    pub const CAPABILITY_REVOKE: &str = "capability_revoke";
    pub const CAPABILITY_LIST: &str = "capability_list";
    pub const SUBSCRIBE_EVENTS: &str = "subscribe_events";
    pub const EVENT: &str = "event";
    pub const ERROR: &str = "error";
}
