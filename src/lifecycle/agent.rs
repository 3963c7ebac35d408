// SPDX-License-Identifier: MIT
//! Agent runtime entity: manifest, merged resource limits, usage accounting.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::capability;
use crate::error::{GatewayError, Result};
use crate::lifecycle::sandbox::Sandbox;
use crate::lifecycle::state::{AgentState, TransitionRecord};

// ─── Manifest ────────────────────────────────────────────────────────────────

/// Immutable declaration of an agent's identity, permissions, and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentManifest {
    /// Stable id chosen by the author (distinct from the runtime agent id).
    pub id: String,
    /// major.minor.patch
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Requested capabilities; accepts dotted aliases.
    #[serde(default, alias = "permissions")]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub limits: ResourceLimitOverrides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl AgentManifest {
    /// Every listed capability must be in the vocabulary and the version
    /// must parse as semver.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(GatewayError::validation("manifest id is required"));
        }
        semver::Version::parse(&self.version).map_err(|e| {
            GatewayError::validation(format!("manifest version {:?}: {e}", self.version))
        })?;
        for cap in &self.capabilities {
            if !capability::is_known(cap) {
                return Err(GatewayError::validation(format!(
                    "unknown capability {cap:?}"
                )));
            }
        }
        Ok(())
    }
}

// ─── Resource limits ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub tokens_per_minute: u64,
    pub max_tokens_per_request: u64,
    pub max_memory_bytes: u64,
    pub max_concurrent_requests: u32,
    pub daily_cost_ceiling_usd: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            tokens_per_minute: 100_000,
            max_tokens_per_request: 32_768,
            max_memory_bytes: 512 * 1024 * 1024,
            max_concurrent_requests: 8,
            daily_cost_ceiling_usd: 50.0,
        }
    }
}

/// Manifest-level overrides; unset fields fall back to the global limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_request: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_cost_ceiling_usd: Option<f64>,
}

impl ResourceLimits {
    /// Merge order: built-in defaults ← global config ← manifest overrides.
    pub fn merged(global: &ResourceLimits, overrides: &ResourceLimitOverrides) -> Self {
        Self {
            tokens_per_minute: overrides.tokens_per_minute.unwrap_or(global.tokens_per_minute),
            max_tokens_per_request: overrides
                .max_tokens_per_request
                .unwrap_or(global.max_tokens_per_request),
            max_memory_bytes: overrides.max_memory_bytes.unwrap_or(global.max_memory_bytes),
            max_concurrent_requests: overrides
                .max_concurrent_requests
                .unwrap_or(global.max_concurrent_requests),
            daily_cost_ceiling_usd: overrides
                .daily_cost_ceiling_usd
                .unwrap_or(global.daily_cost_ceiling_usd),
        }
    }
}

// ─── Usage ───────────────────────────────────────────────────────────────────

/// Length of the sliding token window.
pub const USAGE_WINDOW: Duration = Duration::seconds(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u64,
    pub active_requests: u32,
    pub tokens_this_minute: u64,
    pub window_started_at: DateTime<Utc>,
    pub estimated_cost_usd: f64,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl ResourceUsage {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            request_count: 0,
            active_requests: 0,
            tokens_this_minute: 0,
            window_started_at: now,
            estimated_cost_usd: 0.0,
            last_heartbeat_at: now,
        }
    }

    /// Record one usage sample. A stale window resets to the new sample
    /// before any limit comparison happens.
    pub fn record(&mut self, input_tokens: u64, output_tokens: u64, cost: f64, now: DateTime<Utc>) {
        if now - self.window_started_at > USAGE_WINDOW {
            self.window_started_at = now;
            self.tokens_this_minute = 0;
        }
        self.tokens_this_minute += input_tokens + output_tokens;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.request_count += 1;
        self.estimated_cost_usd += cost;
    }
}

// ─── Pricing ─────────────────────────────────────────────────────────────────

/// USD per 1 000 tokens, input and output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Per-model price table used for cost estimation.
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        let mut prices = HashMap::new();
        prices.insert(
            "m1".to_string(),
            ModelPrice {
                input_per_1k: 0.003,
                output_per_1k: 0.015,
            },
        );
        prices.insert(
            "m1-mini".to_string(),
            ModelPrice {
                input_per_1k: 0.00025,
                output_per_1k: 0.00125,
            },
        );
        Self {
            prices,
            fallback: ModelPrice {
                input_per_1k: 0.001,
                output_per_1k: 0.005,
            },
        }
    }
}

impl PriceTable {
    pub fn insert(&mut self, model: &str, price: ModelPrice) {
        self.prices.insert(model.to_string(), price);
    }

    pub fn estimate(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let price = self.prices.get(model).unwrap_or(&self.fallback);
        (input_tokens as f64 / 1000.0) * price.input_per_1k
            + (output_tokens as f64 / 1000.0) * price.output_per_1k
    }
}

// ─── Agent ───────────────────────────────────────────────────────────────────

/// Runtime agent, exclusively owned by the lifecycle engine on its home node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub manifest: AgentManifest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub home_node: String,
    pub state: AgentState,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    pub sandbox: Sandbox,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub success_count: u64,
    pub error_count: u64,
    pub history: Vec<TransitionRecord>,
}

impl Agent {
    pub fn new(
        id: String,
        manifest: AgentManifest,
        parent_id: Option<String>,
        home_node: String,
        limits: ResourceLimits,
        sandbox: Sandbox,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            manifest,
            parent_id,
            home_node,
            state: AgentState::Created,
            limits,
            usage: ResourceUsage::new(now),
            sandbox,
            created_at: now,
            last_activity_at: now,
            success_count: 0,
            error_count: 0,
            history: Vec::new(),
        }
    }

    /// Serializable snapshot for `agent_status` / `agent_list`.
    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            agent_id: self.id.clone(),
            manifest_id: self.manifest.id.clone(),
            version: self.manifest.version.clone(),
            state: self.state,
            parent_id: self.parent_id.clone(),
            home_node: self.home_node.clone(),
            input_tokens: self.usage.input_tokens,
            output_tokens: self.usage.output_tokens,
            request_count: self.usage.request_count,
            active_requests: self.usage.active_requests,
            estimated_cost_usd: self.usage.estimated_cost_usd,
            success_count: self.success_count,
            error_count: self.error_count,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub manifest_id: String,
    pub version: String,
    pub state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub home_node: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u64,
    pub active_requests: u32,
    pub estimated_cost_usd: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Parse a manifest out of a control-plane payload.
pub fn manifest_from_payload(payload: &Map<String, Value>) -> Result<AgentManifest> {
    serde_json::from_value(Value::Object(payload.clone()))
        .map_err(|e| GatewayError::validation(format!("invalid manifest: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> AgentManifest {
        AgentManifest {
            id: "a1".into(),
            version: "0.1.0".into(),
            description: String::new(),
            capabilities: vec!["llm:chat".into()],
            limits: ResourceLimitOverrides::default(),
            entry_point: None,
            signature: None,
        }
    }

    #[test]
    fn manifest_validation() {
        assert!(manifest().validate().is_ok());

        let mut bad_version = manifest();
        bad_version.version = "1.0".into();
        assert!(bad_version.validate().is_err());

        let mut unknown_cap = manifest();
        unknown_cap.capabilities.push("teleport:anywhere".into());
        assert!(unknown_cap.validate().is_err());
    }

    #[test]
    fn manifest_accepts_permissions_alias() {
        let m: AgentManifest = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "version": "0.1.0",
            "permissions": ["llm:chat"],
        }))
        .unwrap();
        assert_eq!(m.capabilities, vec!["llm:chat"]);
    }

    #[test]
    fn limits_merge_prefers_overrides() {
        let global = ResourceLimits::default();
        let merged = ResourceLimits::merged(
            &global,
            &ResourceLimitOverrides {
                tokens_per_minute: Some(10),
                ..Default::default()
            },
        );
        assert_eq!(merged.tokens_per_minute, 10);
        assert_eq!(merged.max_concurrent_requests, global.max_concurrent_requests);
    }

    #[test]
    fn usage_accumulates_within_the_window() {
        let now = Utc::now();
        let mut usage = ResourceUsage::new(now);
        usage.record(100, 200, 0.01, now);
        usage.record(10, 20, 0.001, now + Duration::seconds(30));
        assert_eq!(usage.input_tokens, 110);
        assert_eq!(usage.output_tokens, 220);
        assert_eq!(usage.request_count, 2);
        assert_eq!(usage.tokens_this_minute, 330);
    }

    #[test]
    fn stale_window_resets_to_the_new_sample() {
        let now = Utc::now();
        let mut usage = ResourceUsage::new(now);
        usage.record(1000, 1000, 0.0, now);
        usage.record(5, 7, 0.0, now + Duration::seconds(61));
        assert_eq!(usage.tokens_this_minute, 12);
        // Cumulative totals are untouched by the window slide.
        assert_eq!(usage.input_tokens, 1005);
        assert_eq!(usage.request_count, 2);
    }

    #[test]
    fn price_table_estimates_with_fallback() {
        let table = PriceTable::default();
        let known = table.estimate("m1", 1000, 1000);
        assert!((known - 0.018).abs() < 1e-9);
        let unknown = table.estimate("mystery-model", 1000, 0);
        assert!((unknown - 0.001).abs() < 1e-9);
    }
}
