// SPDX-License-Identifier: MIT
//! Retention sweep.
//!
//! A daily background job deletes memory rows older than the per-kind
//! retention windows, trims the audit and event logs, and optionally copies
//! rows past the archive threshold into a compressed archive table first.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use sqlx::{Row as _, SqlitePool};
use std::io::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::RetentionSection;
use crate::error::Result;
use crate::memory::store::row_to_memory;
use crate::memory::types::MemoryKind;
use crate::memory::vector::VectorIndex;
use crate::storage::Storage;

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub archived: u64,
    pub removed: u64,
    pub audit_trimmed: u64,
    pub events_trimmed: u64,
}

pub struct RetentionSweeper {
    pool: SqlitePool,
    storage: Storage,
    vector: Option<Arc<dyn VectorIndex>>,
    config: RetentionSection,
}

impl RetentionSweeper {
    pub fn new(
        storage: Storage,
        vector: Option<Arc<dyn VectorIndex>>,
        config: RetentionSection,
    ) -> Self {
        Self {
            pool: storage.pool(),
            storage,
            vector,
            config,
        }
    }

    fn window_days(&self, kind: MemoryKind) -> u32 {
        match kind {
            MemoryKind::Episodic => self.config.episodic_days,
            MemoryKind::Semantic => self.config.semantic_days,
            MemoryKind::Procedural => self.config.procedural_days,
        }
    }

    /// One full sweep. Safe to run concurrently across nodes — deletes are
    /// idempotent and the archive upsert ignores duplicates.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for kind in MemoryKind::ALL {
            let days = self.window_days(kind);
            if days == 0 {
                continue;
            }
            let cutoff = (now - Duration::days(i64::from(days))).to_rfc3339();

            if self.config.archive_days > 0 {
                let archive_cutoff =
                    (now - Duration::days(i64::from(self.config.archive_days))).to_rfc3339();
                report.archived += self.archive_kind(kind, &archive_cutoff).await?;
            }

            let rows = sqlx::query(&format!(
                "SELECT id FROM {} WHERE created_at < ?",
                kind.table()
            ))
            .bind(&cutoff)
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
                report.removed += 1;
            }
        }

        // Trim the audit and event logs to the longest memory window.
        let log_days = self
            .config
            .episodic_days
            .max(self.config.semantic_days)
            .max(self.config.procedural_days);
        if log_days > 0 {
            let cutoff = now - Duration::days(i64::from(log_days));
            report.audit_trimmed = self
                .storage
                .trim_audit_log(cutoff)
                .await
                .map_err(crate::error::GatewayError::store)?;
            report.events_trimmed = self
                .storage
                .trim_event_log(cutoff)
                .await
                .map_err(crate::error::GatewayError::store)?;
        }

        info!(
            archived = report.archived,
            removed = report.removed,
            audit_trimmed = report.audit_trimmed,
            events_trimmed = report.events_trimmed,
            "retention sweep complete"
        );
        Ok(report)
    }

    /// Copy rows older than `cutoff` into the compressed archive table.
    async fn archive_kind(&self, kind: MemoryKind, cutoff: &str) -> Result<u64> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE created_at < ?",
            kind.table()
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut archived = 0u64;
        for row in &rows {
            let memory = row_to_memory(kind, row)?;
            let mut json = serde_json::to_string(&memory)?;
            if json.len() > self.config.archive_text_limit {
                let mut cut = self.config.archive_text_limit;
                while !json.is_char_boundary(cut) {
                    cut -= 1;
                }
                json.truncate(cut);
            }
            let content = compress(&json)?;

            let r = sqlx::query(
                "INSERT INTO memory_archive (id, kind, owner_id, content, archived_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(memory.id())
            .bind(kind.as_str())
            .bind(memory.owner_id())
            .bind(&content)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            archived += r.rows_affected();
        }
        Ok(archived)
    }

    /// Run the sweep once a day until the sweeper is dropped. When a job-lock
    /// gate is supplied (distributed scheduler), a node only sweeps while it
    /// holds the `retention_sweep` lock.
    pub fn spawn_daily(self: Arc<Self>, gate: Option<Arc<dyn JobGate>>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so startup stays fast.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(gate) = &gate {
                    if !gate.try_acquire("retention_sweep").await {
                        continue;
                    }
                }
                if let Err(e) = self.run_once().await {
                    warn!(err = %e, "retention sweep failed");
                }
            }
        });
    }
}

/// Gate for jobs that must run on one node at a time.
#[async_trait::async_trait]
pub trait JobGate: Send + Sync {
    async fn try_acquire(&self, job_id: &str) -> bool;
}

fn compress(text: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| crate::error::GatewayError::internal(format!("gzip: {e}")))?;
    let bytes = encoder
        .finish()
        .map_err(|e| crate::error::GatewayError::internal(format!("gzip: {e}")))?;
    Ok(B64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionSection;
    use crate::events::EventBus;
    use crate::memory::store::MemoryStore;
    use crate::memory::types::{EpisodicMemory, Memory, MemoryBase};

    fn old_episodic(owner: &str, days_old: i64) -> Memory {
        let mut base = MemoryBase::new(owner, 0.5, 0.5);
        base.created_at = Utc::now() - Duration::days(days_old);
        Memory::Episodic(EpisodicMemory {
            base,
            event: "ancient event".into(),
            context: "long ago".into(),
            outcome: None,
            success: true,
            valence: 0.0,
            session_id: None,
            related_ids: vec![],
            embedding: None,
        })
    }

    async fn fixture() -> (Storage, MemoryStore) {
        let storage = Storage::in_memory().await.unwrap();
        let store = MemoryStore::new(
            storage.pool(),
            None,
            None,
            std::sync::Arc::new(EventBus::new()),
        );
        (storage, store)
    }

    #[tokio::test]
    async fn sweep_removes_expired_rows_and_keeps_fresh_ones() {
        let (storage, store) = fixture().await;
        store.save(old_episodic("a1", 120)).await.unwrap();
        let fresh = store.save(old_episodic("a1", 1)).await.unwrap();

        let sweeper = RetentionSweeper::new(
            storage,
            None,
            RetentionSection {
                episodic_days: 90,
                semantic_days: 365,
                procedural_days: 365,
                archive_days: 0,
                archive_text_limit: 4096,
            },
        );
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.archived, 0);
        assert!(store.fetch(fresh.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_archives_before_deleting() {
        let (storage, store) = fixture().await;
        let doomed = store.save(old_episodic("a1", 120)).await.unwrap();

        let pool = storage.pool();
        let sweeper = RetentionSweeper::new(
            storage,
            None,
            RetentionSection {
                episodic_days: 90,
                semantic_days: 365,
                procedural_days: 365,
                archive_days: 60,
                archive_text_limit: 4096,
            },
        );
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.archived, 1);

        let row = sqlx::query("SELECT id, kind FROM memory_archive WHERE id = ?")
            .bind(doomed.id())
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("kind"), "episodic");
    }

    #[tokio::test]
    async fn zero_window_disables_a_kind() {
        let (storage, store) = fixture().await;
        store.save(old_episodic("a1", 1000)).await.unwrap();
        let sweeper = RetentionSweeper::new(
            storage,
            None,
            RetentionSection {
                episodic_days: 0,
                semantic_days: 0,
                procedural_days: 0,
                archive_days: 0,
                archive_text_limit: 4096,
            },
        );
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
