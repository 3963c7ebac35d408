// SPDX-License-Identifier: MIT
//! Vector index abstraction.
//!
//! The store only needs k-NN with a payload filter, so the index is a trait;
//! the in-process implementation keeps normalized vectors in a map and scans
//! with cosine similarity. A remote index (qdrant and friends) slots in by
//! implementing the same four operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::memory::types::{MemoryKind, MemoryScope};

/// Payload stored next to each vector, used for filtered search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    pub owner_id: String,
    pub kind: MemoryKind,
    pub scope: MemoryScope,
    pub importance: f64,
    pub strength: f64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Server-side filter applied before similarity ranking.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub owner_id: String,
    /// Empty means all kinds.
    pub kinds: Vec<MemoryKind>,
    /// Result tags must contain all of these.
    pub tags: Vec<String>,
    pub min_importance: f64,
    pub min_strength: f64,
}

impl VectorFilter {
    fn accepts(&self, payload: &VectorPayload) -> bool {
        payload.owner_id == self.owner_id
            && (self.kinds.is_empty() || self.kinds.contains(&payload.kind))
            && self.tags.iter().all(|t| payload.tags.contains(t))
            && payload.importance >= self.min_importance
            && payload.strength >= self.min_strength
    }
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, id: &str, embedding: &[f32], payload: VectorPayload) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    /// Hits with similarity ≥ `min_similarity`, best first, at most `limit`.
    async fn search(
        &self,
        embedding: &[f32],
        filter: &VectorFilter,
        min_similarity: f64,
        limit: usize,
    ) -> Result<Vec<VectorHit>>;
    async fn delete_by_owner(&self, owner_id: &str) -> Result<()>;
}

/// Brute-force cosine index. Fine for the in-process tier sizes the daemon
/// handles; anything bigger belongs behind a remote implementation.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<String, (Vec<f32>, VectorPayload)>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("vector lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0f64, 0f64, 0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        na += f64::from(*x) * f64::from(*x);
        nb += f64::from(*y) * f64::from(*y);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, id: &str, embedding: &[f32], payload: VectorPayload) -> Result<()> {
        self.entries
            .write()
            .expect("vector lock")
            .insert(id.to_string(), (embedding.to_vec(), payload));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.entries.write().expect("vector lock").remove(id);
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        filter: &VectorFilter,
        min_similarity: f64,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let entries = self.entries.read().expect("vector lock");
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|(_, (_, payload))| filter.accepts(payload))
            .filter_map(|(id, (vec, _))| {
                let score = cosine(embedding, vec);
                (score >= min_similarity).then(|| VectorHit {
                    id: id.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_by_owner(&self, owner_id: &str) -> Result<()> {
        self.entries
            .write()
            .expect("vector lock")
            .retain(|_, (_, payload)| payload.owner_id != owner_id);
        Ok(())
    }
}
