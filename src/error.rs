// SPDX-License-Identifier: MIT
//! Typed error surface shared by every component boundary.
//!
//! Each crossing of a component boundary wraps the inner failure in a
//! [`GatewayError`] carrying one of the [`ErrorKind`]s below. The kind maps
//! 1:1 to the wire `error` frame (`{code, message, retriable}`); stack and
//! trace context stay in the audit log, never in the outbound payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds exposed to callers.
///
/// `ShutdownInProgress` and `AgentUnreachable` are operation-level kinds of
/// the lifecycle engine and cluster coordinator respectively; everything
/// else is shared vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    BadState,
    Validation,
    CapacityExceeded,
    CircuitOpen,
    RateLimited,
    Timeout,
    ProviderUnavailable,
    StoreUnavailable,
    Conflict,
    CapabilityDenied,
    ShutdownInProgress,
    AgentUnreachable,
    Internal,
}

impl ErrorKind {
    /// Stable wire code for the `error` frame payload.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BadState => "bad_state",
            ErrorKind::Validation => "validation",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Conflict => "conflict",
            ErrorKind::CapabilityDenied => "capability_denied",
            ErrorKind::ShutdownInProgress => "shutdown_in_progress",
            ErrorKind::AgentUnreachable => "agent_unreachable",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a client may retry the same request unchanged.
    ///
    /// Business errors (validation, forbidden, not-found) are terminal;
    /// transport and capacity conditions clear on their own.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::CircuitOpen
                | ErrorKind::ProviderUnavailable
                | ErrorKind::StoreUnavailable
                | ErrorKind::AgentUnreachable
                | ErrorKind::CapacityExceeded
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// The error type returned by every public operation in the crate.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn bad_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadState, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn store(message: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::StoreUnavailable, message.to_string())
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => GatewayError::new(ErrorKind::NotFound, "row not found"),
            other => GatewayError::store(other),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::validation(format!("invalid JSON: {e}"))
    }
}

/// Crate-wide result alias.
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
