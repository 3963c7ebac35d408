// SPDX-License-Identifier: MIT
//! Tiered memory store.
//!
//! Rows live in three SQLite tables sharing a schema prefix; embeddings go
//! to the vector index unless encryption is on. Reading a memory is a
//! read-through counter: access count, last-accessed timestamp, and the
//! recomputed strength are persisted atomically with the read.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqlitePool};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, GatewayError, Result};
use crate::events::{channels, EventBus};
use crate::memory::crypto::MemoryCipher;
use crate::memory::recompute_strength;
use crate::memory::types::{
    EpisodicMemory, Memory, MemoryBase, MemoryKind, MemoryQuery, MemoryScope, MemoryStats,
    ProceduralMemory, SemanticMemory,
};
use crate::memory::vector::{VectorFilter, VectorIndex, VectorPayload};

pub struct MemoryStore {
    pool: SqlitePool,
    vector: Option<Arc<dyn VectorIndex>>,
    cipher: Option<Arc<MemoryCipher>>,
    bus: Arc<EventBus>,
}

impl MemoryStore {
    pub fn new(
        pool: SqlitePool,
        vector: Option<Arc<dyn VectorIndex>>,
        cipher: Option<Arc<MemoryCipher>>,
        bus: Arc<EventBus>,
    ) -> Self {
        if cipher.is_some() {
            warn!("memory encryption is enabled — vector upserts and text search are disabled");
        }
        Self {
            pool,
            vector,
            cipher,
            bus,
        }
    }

    fn vector_enabled(&self) -> bool {
        self.vector.is_some() && self.cipher.is_none()
    }

    fn text_search_enabled(&self) -> bool {
        self.cipher.is_none()
    }

    // ─── Save ───────────────────────────────────────────────────────────────

    /// Upsert a memory, assigning a fresh id when missing. Returns the saved
    /// (plaintext) copy.
    pub async fn save(&self, mut memory: Memory) -> Result<Memory> {
        memory.validate()?;
        if memory.id().is_empty() {
            memory.base_mut().id = Uuid::new_v4().to_string();
        }

        let sealed = self.seal(&memory)?;
        self.upsert_row(&sealed).await?;

        if let Some(embedding) = memory.embedding() {
            if self.vector_enabled() {
                let base = memory.base();
                self.vector
                    .as_ref()
                    .expect("vector_enabled checked")
                    .upsert(
                        memory.id(),
                        embedding,
                        VectorPayload {
                            owner_id: base.owner_id.clone(),
                            kind: memory.kind(),
                            scope: base.scope,
                            importance: base.importance,
                            strength: base.strength,
                            tags: base.tags.clone(),
                            created_at: base.created_at,
                        },
                    )
                    .await?;
            } else if self.cipher.is_some() {
                debug!(id = %memory.id(), "embedding not indexed — encryption is enabled");
            }
        }

        self.bus.publish(
            channels::MEMORY,
            "saved",
            serde_json::json!({
                "id": memory.id(),
                "kind": memory.kind().as_str(),
                "ownerId": memory.owner_id(),
            }),
        );
        Ok(memory)
    }

    // ─── Get ────────────────────────────────────────────────────────────────

    /// Read-through get: bumps access count, refreshes last-accessed, and
    /// recomputes strength before returning the decrypted copy.
    pub async fn get(&self, id: &str) -> Result<Memory> {
        let stored = self
            .fetch(id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("memory {id}")))?;

        let now = Utc::now();
        let base = stored.base();
        let access_count = base.access_count + 1;
        let strength = recompute_strength(base.strength, base.last_accessed_at, now);

        sqlx::query(&format!(
            "UPDATE {} SET access_count = ?, last_accessed_at = ?, strength = ? WHERE id = ?",
            stored.kind().table()
        ))
        .bind(access_count as i64)
        .bind(now.to_rfc3339())
        .bind(strength)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let mut result = self.open(&stored)?;
        {
            let base = result.base_mut();
            base.access_count = access_count;
            base.last_accessed_at = now;
            base.strength = strength;
        }
        Ok(result)
    }

    // ─── Update ─────────────────────────────────────────────────────────────

    /// Read-modify-write. The patch is a shallow JSON merge onto the
    /// decrypted memory; `id`, `kind`, and `owner_id` are immutable.
    pub async fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<Memory> {
        let stored = self
            .fetch(id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("memory {id}")))?;
        let plain = self.open(&stored)?;
        let old_embedding = plain.embedding().cloned();

        let mut doc = serde_json::to_value(&plain)?;
        let obj = doc.as_object_mut().expect("memory serializes to object");
        for (key, value) in patch {
            if matches!(key.as_str(), "id" | "kind" | "owner_id") {
                continue;
            }
            obj.insert(key.clone(), value.clone());
        }
        let updated: Memory = serde_json::from_value(doc)?;
        if updated.kind() != plain.kind() {
            return Err(GatewayError::validation("memory kind is immutable"));
        }
        updated.validate()?;

        let sealed = self.seal(&updated)?;
        self.upsert_row(&sealed).await?;

        if updated.embedding() != old_embedding.as_ref() {
            if let Some(idx) = self.vector.as_ref().filter(|_| self.vector_enabled()) {
                match updated.embedding() {
                    Some(embedding) => {
                        let base = updated.base();
                        idx.upsert(
                            id,
                            embedding,
                            VectorPayload {
                                owner_id: base.owner_id.clone(),
                                kind: updated.kind(),
                                scope: base.scope,
                                importance: base.importance,
                                strength: base.strength,
                                tags: base.tags.clone(),
                                created_at: base.created_at,
                            },
                        )
                        .await?;
                    }
                    None => idx.delete(id).await?,
                }
            }
        }

        self.bus.publish(
            channels::MEMORY,
            "updated",
            serde_json::json!({"id": id, "kind": updated.kind().as_str()}),
        );
        Ok(updated)
    }

    // ─── Delete / Clear ─────────────────────────────────────────────────────

    /// Remove a memory and its vector entry. Returns `false` for unknown ids.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut removed = false;
        for kind in MemoryKind::ALL {
            let r = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", kind.table()))
                .bind(id)
                .execute(&self.pool)
                .await?;
            if r.rows_affected() > 0 {
                removed = true;
                break;
            }
        }
        if removed {
            if let Some(idx) = &self.vector {
                idx.delete(id).await?;
            }
            self.bus
                .publish(channels::MEMORY, "deleted", serde_json::json!({"id": id}));
        }
        Ok(removed)
    }

    /// Transactional wipe of every memory owned by `owner_id`.
    pub async fn clear(&self, owner_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut total = 0u64;
        for kind in MemoryKind::ALL {
            let r = sqlx::query(&format!("DELETE FROM {} WHERE owner_id = ?", kind.table()))
                .bind(owner_id)
                .execute(&mut *tx)
                .await?;
            total += r.rows_affected();
        }
        tx.commit().await?;

        if let Some(idx) = &self.vector {
            idx.delete_by_owner(owner_id).await?;
        }
        self.bus.publish(
            channels::MEMORY,
            "cleared",
            serde_json::json!({"ownerId": owner_id, "removed": total}),
        );
        Ok(total)
    }

    // ─── Decay / prune ──────────────────────────────────────────────────────

    /// Multiply every stored strength by `1 - rate`. Returns rows affected.
    pub async fn decay_strength(&self, owner_id: &str, rate: f64) -> Result<u64> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(GatewayError::validation("decay rate must be in [0, 1]"));
        }
        let factor = 1.0 - rate;
        let mut total = 0u64;
        for kind in MemoryKind::ALL {
            let r = sqlx::query(&format!(
                "UPDATE {} SET strength = strength * ? WHERE owner_id = ?",
                kind.table()
            ))
            .bind(factor)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
            total += r.rows_affected();
        }
        self.bus.publish(
            channels::MEMORY,
            "decayed",
            serde_json::json!({"ownerId": owner_id, "rate": rate, "affected": total}),
        );
        Ok(total)
    }

    /// Delete memories whose strength fell below `min_strength`.
    pub async fn prune(&self, owner_id: &str, min_strength: f64) -> Result<u64> {
        let mut total = 0u64;
        for kind in MemoryKind::ALL {
            let rows = sqlx::query(&format!(
                "SELECT id FROM {} WHERE owner_id = ? AND strength < ?",
                kind.table()
            ))
            .bind(owner_id)
            .bind(min_strength)
            .fetch_all(&self.pool)
            .await?;
            for row in &rows {
                let id: String = row.get("id");
                sqlx::query(&format!("DELETE FROM {} WHERE id = ?", kind.table()))
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                if let Some(idx) = &self.vector {
                    idx.delete(&id).await?;
                }
                total += 1;
            }
        }
        self.bus.publish(
            channels::MEMORY,
            "pruned",
            serde_json::json!({"ownerId": owner_id, "minStrength": min_strength, "removed": total}),
        );
        Ok(total)
    }

    // ─── Query ──────────────────────────────────────────────────────────────

    /// Unified query across the three kinds. Vector mode when an embedding is
    /// supplied and the index is live; otherwise (or on zero vector hits)
    /// text/metadata mode. Text matching is unavailable under encryption.
    pub async fn query(&self, owner_id: &str, q: &MemoryQuery) -> Result<Vec<Memory>> {
        let mut scored: Vec<(Memory, f64)> = Vec::new();

        if let (Some(embedding), true) = (&q.embedding, self.vector_enabled()) {
            let filter = VectorFilter {
                owner_id: owner_id.to_string(),
                kinds: q.kinds(),
                tags: q.tags.clone(),
                min_importance: q.min_importance,
                min_strength: q.min_strength,
            };
            let hits = self
                .vector
                .as_ref()
                .expect("vector_enabled checked")
                .search(embedding, &filter, q.min_similarity, q.limit.max(1) * 4)
                .await?;
            for hit in hits {
                let Some(stored) = self.fetch(&hit.id).await? else {
                    // Row deleted after indexing; skip the orphan.
                    continue;
                };
                if !in_time_range(stored.base(), q) {
                    continue;
                }
                scored.push((self.open(&stored)?, hit.score));
            }
        }

        // Vector mode is never attempted under encryption, so the scan below
        // doubles as the degraded metadata-filter path; with encryption off it
        // is the text fallback for missing embeddings and zero vector hits.
        if scored.is_empty() {
            scored = self.text_query(owner_id, q).await?;
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(q.limit);

        let strip = !q.include_embeddings || self.cipher.is_some();
        Ok(scored
            .into_iter()
            .map(|(mut m, _)| {
                if strip {
                    m.clear_embedding();
                }
                m
            })
            .collect())
    }

    /// Metadata scan with optional case-insensitive substring match.
    async fn text_query(&self, owner_id: &str, q: &MemoryQuery) -> Result<Vec<(Memory, f64)>> {
        let needle = q
            .text
            .as_deref()
            .filter(|_| self.text_search_enabled())
            .map(str::to_lowercase);
        let mut out = Vec::new();

        for kind in q.kinds() {
            let rows = sqlx::query(&format!(
                "SELECT * FROM {} WHERE owner_id = ? ORDER BY created_at DESC",
                kind.table()
            ))
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let stored = row_to_memory(kind, &row)?;
                let base = stored.base();
                if base.importance < q.min_importance || base.strength < q.min_strength {
                    continue;
                }
                if !q.tags.iter().all(|t| base.tags.contains(t)) {
                    continue;
                }
                if !in_time_range(base, q) {
                    continue;
                }
                let plain = self.open(&stored)?;
                if let Some(needle) = &needle {
                    let hit = plain
                        .indexable_text()
                        .iter()
                        .any(|f| f.to_lowercase().contains(needle));
                    if !hit {
                        continue;
                    }
                }
                let score = plain.base().importance * plain.base().strength;
                out.push((plain, score));
            }
        }
        Ok(out)
    }

    // ─── Stats ──────────────────────────────────────────────────────────────

    pub async fn stats(&self, owner_id: &str) -> Result<MemoryStats> {
        let mut counts = [0u64; 3];
        let mut importance_sum = 0f64;
        let mut strength_sum = 0f64;
        for (i, kind) in MemoryKind::ALL.iter().enumerate() {
            let row = sqlx::query(&format!(
                "SELECT COUNT(*) AS n, COALESCE(SUM(importance), 0.0) AS imp,
                        COALESCE(SUM(strength), 0.0) AS str
                 FROM {} WHERE owner_id = ?",
                kind.table()
            ))
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
            counts[i] = row.get::<i64, _>("n") as u64;
            importance_sum += row.get::<f64, _>("imp");
            strength_sum += row.get::<f64, _>("str");
        }
        let total = counts.iter().sum::<u64>();
        let denom = if total == 0 { 1.0 } else { total as f64 };
        Ok(MemoryStats {
            episodic_count: counts[0],
            semantic_count: counts[1],
            procedural_count: counts[2],
            total_count: total,
            avg_importance: importance_sum / denom,
            avg_strength: strength_sum / denom,
        })
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    /// Fetch a row by id without touching the read-through counters.
    pub(crate) async fn fetch(&self, id: &str) -> Result<Option<Memory>> {
        for kind in MemoryKind::ALL {
            let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = ?", kind.table()))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                return Ok(Some(row_to_memory(kind, &row)?));
            }
        }
        Ok(None)
    }

    /// Encrypt the kind-specific text fields when a cipher is configured.
    fn seal(&self, memory: &Memory) -> Result<Memory> {
        let Some(cipher) = &self.cipher else {
            return Ok(memory.clone());
        };
        let owner = memory.owner_id().to_string();
        let mut sealed = memory.clone();
        match &mut sealed {
            Memory::Episodic(m) => {
                m.event = cipher.encrypt(&owner, &m.event)?;
                m.context = cipher.encrypt(&owner, &m.context)?;
                if let Some(o) = &m.outcome {
                    m.outcome = Some(cipher.encrypt(&owner, o)?);
                }
            }
            Memory::Semantic(m) => {
                m.subject = cipher.encrypt(&owner, &m.subject)?;
                m.predicate = cipher.encrypt(&owner, &m.predicate)?;
                m.object = cipher.encrypt(&owner, &m.object)?;
            }
            Memory::Procedural(m) => {
                m.name = cipher.encrypt(&owner, &m.name)?;
                m.description = cipher.encrypt(&owner, &m.description)?;
                m.trigger = cipher.encrypt(&owner, &m.trigger)?;
                for step in &mut m.steps {
                    *step = cipher.encrypt(&owner, step)?;
                }
            }
        }
        Ok(sealed)
    }

    /// Decrypt the kind-specific text fields when a cipher is configured.
    fn open(&self, memory: &Memory) -> Result<Memory> {
        let Some(cipher) = &self.cipher else {
            return Ok(memory.clone());
        };
        let owner = memory.owner_id().to_string();
        let mut plain = memory.clone();
        match &mut plain {
            Memory::Episodic(m) => {
                m.event = cipher.decrypt(&owner, &m.event)?;
                m.context = cipher.decrypt(&owner, &m.context)?;
                if let Some(o) = &m.outcome {
                    m.outcome = Some(cipher.decrypt(&owner, o)?);
                }
            }
            Memory::Semantic(m) => {
                m.subject = cipher.decrypt(&owner, &m.subject)?;
                m.predicate = cipher.decrypt(&owner, &m.predicate)?;
                m.object = cipher.decrypt(&owner, &m.object)?;
            }
            Memory::Procedural(m) => {
                m.name = cipher.decrypt(&owner, &m.name)?;
                m.description = cipher.decrypt(&owner, &m.description)?;
                m.trigger = cipher.decrypt(&owner, &m.trigger)?;
                for step in &mut m.steps {
                    *step = cipher.decrypt(&owner, step)?;
                }
            }
        }
        Ok(plain)
    }

    async fn upsert_row(&self, memory: &Memory) -> Result<()> {
        let base = memory.base();
        match memory {
            Memory::Episodic(m) => {
                sqlx::query(
                    "INSERT INTO episodic_memories
                     (id, owner_id, scope, created_at, last_accessed_at, access_count,
                      importance, strength, tags, metadata, embedding,
                      event, context, outcome, success, valence, session_id, related_ids)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                       scope = excluded.scope,
                       last_accessed_at = excluded.last_accessed_at,
                       access_count = excluded.access_count,
                       importance = excluded.importance,
                       strength = excluded.strength,
                       tags = excluded.tags,
                       metadata = excluded.metadata,
                       embedding = excluded.embedding,
                       event = excluded.event,
                       context = excluded.context,
                       outcome = excluded.outcome,
                       success = excluded.success,
                       valence = excluded.valence,
                       session_id = excluded.session_id,
                       related_ids = excluded.related_ids",
                )
                .bind(&base.id)
                .bind(&base.owner_id)
                .bind(base.scope.as_str())
                .bind(base.created_at.to_rfc3339())
                .bind(base.last_accessed_at.to_rfc3339())
                .bind(base.access_count as i64)
                .bind(base.importance)
                .bind(base.strength)
                .bind(to_json(&base.tags)?)
                .bind(to_json(&base.metadata)?)
                .bind(opt_json(&m.embedding)?)
                .bind(&m.event)
                .bind(&m.context)
                .bind(&m.outcome)
                .bind(m.success as i64)
                .bind(m.valence)
                .bind(&m.session_id)
                .bind(to_json(&m.related_ids)?)
                .execute(&self.pool)
                .await?;
            }
            Memory::Semantic(m) => {
                sqlx::query(
                    "INSERT INTO semantic_memories
                     (id, owner_id, scope, created_at, last_accessed_at, access_count,
                      importance, strength, tags, metadata, embedding,
                      subject, predicate, object, confidence, source, verified_at, related_concepts)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                       scope = excluded.scope,
                       last_accessed_at = excluded.last_accessed_at,
                       access_count = excluded.access_count,
                       importance = excluded.importance,
                       strength = excluded.strength,
                       tags = excluded.tags,
                       metadata = excluded.metadata,
                       embedding = excluded.embedding,
                       subject = excluded.subject,
                       predicate = excluded.predicate,
                       object = excluded.object,
                       confidence = excluded.confidence,
                       source = excluded.source,
                       verified_at = excluded.verified_at,
                       related_concepts = excluded.related_concepts",
                )
                .bind(&base.id)
                .bind(&base.owner_id)
                .bind(base.scope.as_str())
                .bind(base.created_at.to_rfc3339())
                .bind(base.last_accessed_at.to_rfc3339())
                .bind(base.access_count as i64)
                .bind(base.importance)
                .bind(base.strength)
                .bind(to_json(&base.tags)?)
                .bind(to_json(&base.metadata)?)
                .bind(opt_json(&m.embedding)?)
                .bind(&m.subject)
                .bind(&m.predicate)
                .bind(&m.object)
                .bind(m.confidence)
                .bind(&m.source)
                .bind(m.verified_at.map(|t| t.to_rfc3339()))
                .bind(to_json(&m.related_concepts)?)
                .execute(&self.pool)
                .await?;
            }
            Memory::Procedural(m) => {
                sqlx::query(
                    "INSERT INTO procedural_memories
                     (id, owner_id, scope, created_at, last_accessed_at, access_count,
                      importance, strength, tags, metadata, embedding,
                      name, description, \"trigger\", steps, inputs, outputs,
                      success_rate, execution_count, version, active)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                       scope = excluded.scope,
                       last_accessed_at = excluded.last_accessed_at,
                       access_count = excluded.access_count,
                       importance = excluded.importance,
                       strength = excluded.strength,
                       tags = excluded.tags,
                       metadata = excluded.metadata,
                       name = excluded.name,
                       description = excluded.description,
                       \"trigger\" = excluded.\"trigger\",
                       steps = excluded.steps,
                       inputs = excluded.inputs,
                       outputs = excluded.outputs,
                       success_rate = excluded.success_rate,
                       execution_count = excluded.execution_count,
                       version = excluded.version,
                       active = excluded.active",
                )
                .bind(&base.id)
                .bind(&base.owner_id)
                .bind(base.scope.as_str())
                .bind(base.created_at.to_rfc3339())
                .bind(base.last_accessed_at.to_rfc3339())
                .bind(base.access_count as i64)
                .bind(base.importance)
                .bind(base.strength)
                .bind(to_json(&base.tags)?)
                .bind(to_json(&base.metadata)?)
                .bind(Option::<String>::None)
                .bind(&m.name)
                .bind(&m.description)
                .bind(&m.trigger)
                .bind(to_json(&m.steps)?)
                .bind(to_json(&m.inputs)?)
                .bind(to_json(&m.outputs)?)
                .bind(m.success_rate)
                .bind(m.execution_count as i64)
                .bind(m.version as i64)
                .bind(m.active as i64)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

fn in_time_range(base: &MemoryBase, q: &MemoryQuery) -> bool {
    if let Some(after) = q.created_after {
        if base.created_at < after {
            return false;
        }
    }
    if let Some(before) = q.created_before {
        if base.created_at > before {
            return false;
        }
    }
    true
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| GatewayError::internal(format!("serialize: {e}")))
}

fn opt_json(embedding: &Option<Vec<f32>>) -> Result<Option<String>> {
    embedding.as_ref().map(|e| to_json(e)).transpose()
}

fn from_json<T: serde::de::DeserializeOwned + Default>(text: &str) -> T {
    serde_json::from_str(text).unwrap_or_default()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GatewayError::new(ErrorKind::Internal, format!("bad timestamp {s:?}: {e}")))
}

fn row_base(row: &SqliteRow) -> Result<MemoryBase> {
    Ok(MemoryBase {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        scope: MemoryScope::parse(&row.get::<String, _>("scope"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        last_accessed_at: parse_ts(&row.get::<String, _>("last_accessed_at"))?,
        access_count: row.get::<i64, _>("access_count") as u64,
        importance: row.get("importance"),
        strength: row.get("strength"),
        tags: from_json(&row.get::<String, _>("tags")),
        metadata: from_json(&row.get::<String, _>("metadata")),
    })
}

pub(crate) fn row_to_memory(kind: MemoryKind, row: &SqliteRow) -> Result<Memory> {
    let base = row_base(row)?;
    let embedding: Option<Vec<f32>> = row
        .try_get::<Option<String>, _>("embedding")
        .ok()
        .flatten()
        .map(|s| from_json(&s));
    Ok(match kind {
        MemoryKind::Episodic => Memory::Episodic(EpisodicMemory {
            base,
            event: row.get("event"),
            context: row.get("context"),
            outcome: row.get("outcome"),
            success: row.get::<i64, _>("success") != 0,
            valence: row.get("valence"),
            session_id: row.get("session_id"),
            related_ids: from_json(&row.get::<String, _>("related_ids")),
            embedding,
        }),
        MemoryKind::Semantic => Memory::Semantic(SemanticMemory {
            base,
            subject: row.get("subject"),
            predicate: row.get("predicate"),
            object: row.get("object"),
            confidence: row.get("confidence"),
            source: row.get("source"),
            verified_at: row
                .get::<Option<String>, _>("verified_at")
                .map(|s| parse_ts(&s))
                .transpose()?,
            related_concepts: from_json(&row.get::<String, _>("related_concepts")),
            embedding,
        }),
        MemoryKind::Procedural => Memory::Procedural(ProceduralMemory {
            base,
            name: row.get("name"),
            description: row.get("description"),
            trigger: row.get("trigger"),
            steps: from_json(&row.get::<String, _>("steps")),
            inputs: from_json(&row.get::<String, _>("inputs")),
            outputs: from_json(&row.get::<String, _>("outputs")),
            success_rate: row.get("success_rate"),
            execution_count: row.get::<i64, _>("execution_count") as u64,
            version: row.get::<i64, _>("version") as u32,
            active: row.get::<i64, _>("active") != 0,
        }),
    })
}
