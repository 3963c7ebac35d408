// SPDX-License-Identifier: MIT
//! Capability vocabulary, grants, and constraint evaluation.
//!
//! A capability is a named permission (`llm:chat`, `file:read`) attached to
//! an agent through a [`CapabilityGrant`]. Grants are cumulative and checked
//! in insertion order; the first non-expired grant whose constraints are
//! satisfied by the check's context wins. Constraints support glob patterns,
//! numeric ranges, host suffixes, and list membership.

pub mod tokens;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every capability the runtime understands. Manifests naming anything else
/// fail validation.
pub const KNOWN_CAPABILITIES: &[&str] = &[
    "llm:chat",
    "llm:stream",
    "memory:read",
    "memory:write",
    "file:read",
    "file:write",
    "net:http",
    "shell:exec",
    "agent:spawn",
    "agent:terminate",
    "event:subscribe",
    "capability:delegate",
];

/// Capabilities every agent receives at spawn regardless of its manifest.
/// Anything beyond reading its own memory must be requested explicitly.
pub const DEFAULT_CAPABILITIES: &[&str] = &["memory:read"];

/// Canonical form of a capability name. Dotted aliases (`memory.read`) are
/// accepted on the wire and normalized to the colon form.
pub fn normalize(capability: &str) -> String {
    capability.trim().replace('.', ":").to_ascii_lowercase()
}

/// `true` if `capability` (normalized) is in the vocabulary.
pub fn is_known(capability: &str) -> bool {
    let c = normalize(capability);
    KNOWN_CAPABILITIES.contains(&c.as_str())
}

// ─── Grants ──────────────────────────────────────────────────────────────────

/// A capability authorization attached to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityGrant {
    pub capability: String,
    /// Who granted it — `"system"`, a parent agent id, or a client subject.
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Arbitrary constraint map evaluated against the check context.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub constraints: Map<String, Value>,
}

impl CapabilityGrant {
    pub fn new(capability: &str, granted_by: &str) -> Self {
        Self {
            capability: normalize(capability),
            granted_by: granted_by.to_string(),
            granted_at: Utc::now(),
            expires_at: None,
            constraints: Map::new(),
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_constraints(mut self, constraints: Map<String, Value>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// `true` when every constraint is satisfied by `context`.
    /// A constraint whose key is absent from the context fails closed.
    pub fn constraints_satisfied(&self, context: &Map<String, Value>) -> bool {
        self.constraints
            .iter()
            .all(|(key, expected)| match context.get(key) {
                Some(actual) => constraint_matches(expected, actual),
                None => false,
            })
    }
}

/// Evaluate one constraint value against one context value.
fn constraint_matches(expected: &Value, actual: &Value) -> bool {
    match expected {
        Value::String(pattern) => {
            let Some(actual) = actual.as_str() else {
                return false;
            };
            if let Some(suffix) = pattern.strip_prefix("*.") {
                // Host suffix: `*.example.com` matches the apex and any subdomain.
                return actual == suffix || actual.ends_with(&format!(".{suffix}"));
            }
            if pattern.contains('*') || pattern.contains('?') {
                return glob_match(pattern, actual);
            }
            pattern == actual
        }
        Value::Object(range) => {
            let Some(n) = actual.as_f64() else {
                return false;
            };
            let min_ok = range.get("min").and_then(Value::as_f64).map_or(true, |m| n >= m);
            let max_ok = range.get("max").and_then(Value::as_f64).map_or(true, |m| n <= m);
            min_ok && max_ok
        }
        Value::Array(options) => options.iter().any(|o| o == actual),
        other => other == actual,
    }
}

/// Iterative `*`/`?` glob match (no character classes).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // Backtrack: let the last `*` absorb one more character.
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
