// SPDX-License-Identifier: MIT
//! Agent checkpoints.
//!
//! A checkpoint is the full serializable image of an agent — manifest,
//! state, transition history, usage, grants, plus arbitrary custom data —
//! written atomically to the agent's row. Recovering from a checkpoint on a
//! fresh engine yields an agent with an identical id, state, history, usage
//! totals, and grant set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::CapabilityGrant;
use crate::error::Result;
use crate::lifecycle::agent::{Agent, AgentManifest, ResourceLimits, ResourceUsage};
use crate::lifecycle::sandbox::Sandbox;
use crate::lifecycle::state::{AgentState, TransitionRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub agent_id: String,
    pub manifest: AgentManifest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub home_node: String,
    pub state: AgentState,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    pub grants: Vec<CapabilityGrant>,
    pub history: Vec<TransitionRecord>,
    pub success_count: u64,
    pub error_count: u64,
    pub agent_created_at: DateTime<Utc>,
    pub checkpointed_at: DateTime<Utc>,
    /// Agent-defined payload carried through checkpoint/recover untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
}

impl AgentCheckpoint {
    pub fn from_agent(agent: &Agent, custom: Map<String, Value>) -> Self {
        Self {
            agent_id: agent.id.clone(),
            manifest: agent.manifest.clone(),
            parent_id: agent.parent_id.clone(),
            home_node: agent.home_node.clone(),
            state: agent.state,
            limits: agent.limits,
            usage: agent.usage.clone(),
            grants: agent.sandbox.grants().to_vec(),
            history: agent.history.clone(),
            success_count: agent.success_count,
            error_count: agent.error_count,
            agent_created_at: agent.created_at,
            checkpointed_at: Utc::now(),
            custom,
        }
    }

    /// Rebuild the live agent this checkpoint describes.
    pub fn into_agent(self) -> Agent {
        let mut agent = Agent::new(
            self.agent_id,
            self.manifest,
            self.parent_id,
            self.home_node,
            self.limits,
            Sandbox::with_grants(self.grants),
        );
        agent.state = self.state;
        agent.usage = self.usage;
        agent.history = self.history;
        agent.success_count = self.success_count;
        agent.error_count = self.error_count;
        agent.created_at = self.agent_created_at;
        agent
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::error::GatewayError::internal(format!("checkpoint encode: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::error::GatewayError::validation(format!("checkpoint decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityGrant;
    use crate::lifecycle::agent::ResourceLimitOverrides;
    use crate::lifecycle::state::LifecycleEvent;

    fn agent() -> Agent {
        let manifest = AgentManifest {
            id: "m1".into(),
            version: "1.2.3".into(),
            description: "test".into(),
            capabilities: vec!["llm:chat".into()],
            limits: ResourceLimitOverrides::default(),
            entry_point: None,
            signature: None,
        };
        let mut sandbox = Sandbox::new();
        sandbox.grant(CapabilityGrant::new("llm:chat", "system"));
        let mut agent = Agent::new(
            "agent-1".into(),
            manifest,
            None,
            "node-1".into(),
            ResourceLimits::default(),
            sandbox,
        );
        agent.state = AgentState::Running;
        agent.usage.record(100, 200, 0.01, Utc::now());
        agent.history.push(TransitionRecord {
            from: AgentState::Created,
            to: AgentState::Initializing,
            event: LifecycleEvent::Initialize,
            reason: None,
            at: Utc::now(),
        });
        agent
    }

    #[test]
    fn roundtrip_preserves_identity_state_history_usage_grants() {
        let original = agent();
        let cp = AgentCheckpoint::from_agent(&original, Map::new());
        let json = cp.to_json().unwrap();
        let restored = AgentCheckpoint::from_json(&json).unwrap().into_agent();

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.state, original.state);
        assert_eq!(restored.history, original.history);
        assert_eq!(restored.usage.input_tokens, 100);
        assert_eq!(restored.usage.output_tokens, 200);
        assert_eq!(restored.sandbox.grants().len(), 1);
        assert_eq!(restored.created_at, original.created_at);
    }

    #[test]
    fn custom_payload_survives() {
        let mut custom = Map::new();
        custom.insert("scratch".into(), serde_json::json!({"cursor": 42}));
        let cp = AgentCheckpoint::from_agent(&agent(), custom);
        let back = AgentCheckpoint::from_json(&cp.to_json().unwrap()).unwrap();
        assert_eq!(back.custom["scratch"]["cursor"], 42);
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let err = AgentCheckpoint::from_json("{not json").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
