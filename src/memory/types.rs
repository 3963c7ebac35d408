// SPDX-License-Identifier: MIT
//! Memory data model: three disjoint kinds sharing a common schema prefix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Private,
    Shared,
    Public,
}

impl MemoryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryScope::Private => "private",
            MemoryScope::Shared => "shared",
            MemoryScope::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(MemoryScope::Private),
            "shared" => Ok(MemoryScope::Shared),
            "public" => Ok(MemoryScope::Public),
            other => Err(GatewayError::validation(format!("unknown scope {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Procedural => "procedural",
        }
    }

    pub const ALL: [MemoryKind; 3] =
        [MemoryKind::Episodic, MemoryKind::Semantic, MemoryKind::Procedural];

    pub fn table(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic_memories",
            MemoryKind::Semantic => "semantic_memories",
            MemoryKind::Procedural => "procedural_memories",
        }
    }
}

/// Shared schema prefix carried by every memory kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBase {
    /// Globally unique id; assigned on first save when empty.
    #[serde(default)]
    pub id: String,
    pub owner_id: String,
    pub scope: MemoryScope,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    /// In [0, 1].
    pub importance: f64,
    /// In [0, 1]; decays with wall time, boosted on read.
    pub strength: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MemoryBase {
    pub fn new(owner_id: &str, importance: f64, strength: f64) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            owner_id: owner_id.to_string(),
            scope: MemoryScope::Private,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            importance,
            strength,
            tags: Vec::new(),
            metadata: Map::new(),
        }
    }
}

/// A lived experience: what happened, in what context, how it went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicMemory {
    #[serde(flatten)]
    pub base: MemoryBase,
    pub event: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default)]
    pub success: bool,
    /// Emotional valence in [-1, 1].
    #[serde(default)]
    pub valence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub related_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A (subject, predicate, object) fact with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMemory {
    #[serde(flatten)]
    pub base: MemoryBase,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// In [0, 1].
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub related_concepts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A learned skill: trigger plus ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProceduralMemory {
    #[serde(flatten)]
    pub base: MemoryBase,
    pub name: String,
    pub description: String,
    pub trigger: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_version() -> u32 {
    1
}
fn default_active() -> bool {
    true
}

/// One stored memory of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Memory {
    Episodic(EpisodicMemory),
    Semantic(SemanticMemory),
    Procedural(ProceduralMemory),
}

impl Memory {
    pub fn kind(&self) -> MemoryKind {
        match self {
            Memory::Episodic(_) => MemoryKind::Episodic,
            Memory::Semantic(_) => MemoryKind::Semantic,
            Memory::Procedural(_) => MemoryKind::Procedural,
        }
    }

    pub fn base(&self) -> &MemoryBase {
        match self {
            Memory::Episodic(m) => &m.base,
            Memory::Semantic(m) => &m.base,
            Memory::Procedural(m) => &m.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut MemoryBase {
        match self {
            Memory::Episodic(m) => &mut m.base,
            Memory::Semantic(m) => &mut m.base,
            Memory::Procedural(m) => &mut m.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    pub fn owner_id(&self) -> &str {
        &self.base().owner_id
    }

    pub fn embedding(&self) -> Option<&Vec<f32>> {
        match self {
            Memory::Episodic(m) => m.embedding.as_ref(),
            Memory::Semantic(m) => m.embedding.as_ref(),
            Memory::Procedural(_) => None,
        }
    }

    pub fn clear_embedding(&mut self) {
        match self {
            Memory::Episodic(m) => m.embedding = None,
            Memory::Semantic(m) => m.embedding = None,
            Memory::Procedural(_) => {}
        }
    }

    /// Kind-specific fields scanned by case-insensitive text search.
    pub fn indexable_text(&self) -> Vec<&str> {
        match self {
            Memory::Episodic(m) => {
                let mut v = vec![m.event.as_str(), m.context.as_str()];
                if let Some(o) = &m.outcome {
                    v.push(o.as_str());
                }
                v
            }
            Memory::Semantic(m) => {
                vec![m.subject.as_str(), m.predicate.as_str(), m.object.as_str()]
            }
            Memory::Procedural(m) => {
                vec![m.name.as_str(), m.description.as_str(), m.trigger.as_str()]
            }
        }
    }

    /// Range checks shared by save and update.
    pub fn validate(&self) -> Result<()> {
        let base = self.base();
        if base.owner_id.is_empty() {
            return Err(GatewayError::validation("memory owner_id is required"));
        }
        if !(0.0..=1.0).contains(&base.importance) {
            return Err(GatewayError::validation("importance must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&base.strength) {
            return Err(GatewayError::validation("strength must be in [0, 1]"));
        }
        match self {
            Memory::Episodic(m) => {
                if !(-1.0..=1.0).contains(&m.valence) {
                    return Err(GatewayError::validation("valence must be in [-1, 1]"));
                }
            }
            Memory::Semantic(m) => {
                if !(0.0..=1.0).contains(&m.confidence) {
                    return Err(GatewayError::validation("confidence must be in [0, 1]"));
                }
            }
            Memory::Procedural(m) => {
                if m.steps.is_empty() {
                    return Err(GatewayError::validation("procedural memory needs steps"));
                }
            }
        }
        Ok(())
    }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// Unified query across the three kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Kinds to search; empty means all three.
    #[serde(default)]
    pub types: Vec<MemoryKind>,
    /// Case-insensitive substring for text mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Enables vector mode when the index is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Required tags (result tags must be a superset).
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub min_importance: f64,
    #[serde(default)]
    pub min_strength: f64,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub include_embeddings: bool,
}

fn default_min_similarity() -> f64 {
    0.7
}
fn default_limit() -> usize {
    20
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            text: None,
            embedding: None,
            tags: Vec::new(),
            min_importance: 0.0,
            min_strength: 0.0,
            min_similarity: default_min_similarity(),
            created_after: None,
            created_before: None,
            limit: default_limit(),
            include_embeddings: false,
        }
    }
}

impl MemoryQuery {
    pub fn kinds(&self) -> Vec<MemoryKind> {
        if self.types.is_empty() {
            MemoryKind::ALL.to_vec()
        } else {
            self.types.clone()
        }
    }
}

/// Per-owner aggregate counts for the health endpoint and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub episodic_count: u64,
    pub semantic_count: u64,
    pub procedural_count: u64,
    pub total_count: u64,
    pub avg_importance: f64,
    pub avg_strength: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn episodic(owner: &str) -> Memory {
        Memory::Episodic(EpisodicMemory {
            base: MemoryBase::new(owner, 0.5, 0.5),
            event: "deployed v2".into(),
            context: "production rollout".into(),
            outcome: Some("success".into()),
            success: true,
            valence: 0.6,
            session_id: None,
            related_ids: vec![],
            embedding: None,
        })
    }

    #[test]
    fn kind_tagged_serde_roundtrip() {
        let m = episodic("agent-1");
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"kind\":\"episodic\""));
        let back: Memory = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), MemoryKind::Episodic);
        assert_eq!(back, m);
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let mut m = episodic("agent-1");
        m.base_mut().importance = 1.5;
        assert!(m.validate().is_err());

        let mut m = episodic("agent-1");
        if let Memory::Episodic(e) = &mut m {
            e.valence = -2.0;
        }
        assert!(m.validate().is_err());

        let mut m = episodic("agent-1");
        m.base_mut().owner_id.clear();
        assert!(m.validate().is_err());
    }

    #[test]
    fn indexable_text_covers_kind_fields() {
        let m = episodic("agent-1");
        let fields = m.indexable_text();
        assert!(fields.contains(&"deployed v2"));
        assert!(fields.contains(&"production rollout"));
    }
}
