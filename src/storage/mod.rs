// SPDX-License-Identifier: MIT
//! SQLite persistence (WAL mode — crash-safe agent and memory state).
//!
//! Owns the connection pool, migrations, and the row-level operations for
//! agents, transition history, capability grants, the audit/event logs, and
//! the cluster coordination tables. The memory store runs its own queries
//! against the shared pool (see `memory::store`).

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row as _, SqlitePool};
use std::{path::Path, str::FromStr};
use tokio::sync::mpsc;
use tracing::warn;

use crate::audit::AuditEvent;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
pub(crate) async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRow {
    pub id: String,
    pub manifest: String,
    pub state: String,
    pub home_node: String,
    pub checkpoint: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryRow {
    pub agent_id: String,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub reason: Option<String>,
    pub at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GrantRow {
    pub agent_id: String,
    pub capability: String,
    pub granted_by: String,
    pub granted_at: String,
    pub expires_at: Option<String>,
    pub constraints: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClusterNodeRow {
    pub id: String,
    pub ws_url: String,
    pub role: String,
    pub last_heartbeat: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("agentd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Reachability probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [
            include_str!("migrations/001_init.sql"),
            include_str!("migrations/002_memories.sql"),
            include_str!("migrations/003_cluster.sql"),
        ] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Agents ─────────────────────────────────────────────────────────────

    pub async fn upsert_agent(
        &self,
        id: &str,
        manifest_json: &str,
        state: &str,
        home_node: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        with_timeout(async {
            sqlx::query(
                "INSERT INTO agents (id, manifest, state, home_node, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     manifest = excluded.manifest,
                     state = excluded.state,
                     home_node = excluded.home_node,
                     updated_at = excluded.updated_at",
            )
            .bind(id)
            .bind(manifest_json)
            .bind(state)
            .bind(home_node)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn update_agent_state(&self, id: &str, state: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE agents SET state = ?, updated_at = ? WHERE id = ?")
                .bind(state)
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<AgentRow>> {
        with_timeout(async {
            Ok(sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn delete_agent(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM agents WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM capability_grants WHERE agent_id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Atomically replace the agent's checkpoint blob.
    pub async fn save_checkpoint(&self, id: &str, checkpoint_json: &str) -> Result<()> {
        with_timeout(async {
            let result = sqlx::query("UPDATE agents SET checkpoint = ?, updated_at = ? WHERE id = ?")
                .bind(checkpoint_json)
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                anyhow::bail!("agent {id} has no shell row to checkpoint into");
            }
            Ok(())
        })
        .await
    }

    pub async fn load_checkpoint(&self, id: &str) -> Result<Option<String>> {
        with_timeout(async {
            let row = sqlx::query("SELECT checkpoint FROM agents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.and_then(|r| r.get::<Option<String>, _>("checkpoint")))
        })
        .await
    }

    // ─── Transition history ────────────────────────────────────────────────

    pub async fn append_history(
        &self,
        agent_id: &str,
        from_state: &str,
        to_state: &str,
        event: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO agent_state_history (agent_id, from_state, to_state, event, reason, at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(agent_id)
            .bind(from_state)
            .bind(to_state)
            .bind(event)
            .bind(reason)
            .bind(at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn history(&self, agent_id: &str) -> Result<Vec<HistoryRow>> {
        with_timeout(async {
            Ok(sqlx::query_as::<_, HistoryRow>(
                "SELECT agent_id, from_state, to_state, event, reason, at
                 FROM agent_state_history WHERE agent_id = ? ORDER BY id ASC",
            )
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    // ─── Capability grants ─────────────────────────────────────────────────

    /// Replace the persisted grant set for an agent with the given rows.
    pub async fn replace_grants(&self, agent_id: &str, grants: &[GrantRow]) -> Result<()> {
        with_timeout(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM capability_grants WHERE agent_id = ?")
                .bind(agent_id)
                .execute(&mut *tx)
                .await?;
            for g in grants {
                sqlx::query(
                    "INSERT INTO capability_grants
                     (agent_id, capability, granted_by, granted_at, expires_at, constraints)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(agent_id)
                .bind(&g.capability)
                .bind(&g.granted_by)
                .bind(&g.granted_at)
                .bind(&g.expires_at)
                .bind(&g.constraints)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn load_grants(&self, agent_id: &str) -> Result<Vec<GrantRow>> {
        with_timeout(async {
            Ok(sqlx::query_as::<_, GrantRow>(
                "SELECT agent_id, capability, granted_by, granted_at, expires_at, constraints
                 FROM capability_grants WHERE agent_id = ? ORDER BY id ASC",
            )
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    // ─── Audit / event logs ────────────────────────────────────────────────

    /// Fire-and-forget audit writer. Returns the sender half; the drain task
    /// runs until every sender is dropped. Insert failures are logged and
    /// swallowed — the audited path must never block on storage.
    pub fn spawn_audit_writer(&self) -> mpsc::UnboundedSender<AuditEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let details = event.details.to_string();
                let result = sqlx::query(
                    "INSERT INTO audit_log (actor, action, resource_type, resource_id, outcome, details, at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&event.actor)
                .bind(&event.action)
                .bind(&event.resource_type)
                .bind(&event.resource_id)
                .bind(event.outcome.as_str())
                .bind(&details)
                .bind(event.at.to_rfc3339())
                .execute(&pool)
                .await;
                if let Err(e) = result {
                    warn!(err = %e, "audit row insert failed — event dropped from store");
                }
            }
        });
        tx
    }

    pub async fn insert_event_log(&self, channel: &str, event_type: &str, data: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("INSERT INTO event_log (channel, type, data, at) VALUES (?, ?, ?, ?)")
                .bind(channel)
                .bind(event_type)
                .bind(data)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Actions recorded against a resource, oldest first (diagnostics/tests).
    pub async fn audit_actions(&self, resource_id: &str) -> Result<Vec<String>> {
        with_timeout(async {
            let rows = sqlx::query(
                "SELECT action FROM audit_log WHERE resource_id = ? ORDER BY at ASC",
            )
            .bind(resource_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.iter().map(|r| r.get::<String, _>("action")).collect())
        })
        .await
    }

    pub async fn trim_audit_log(&self, before: DateTime<Utc>) -> Result<u64> {
        with_timeout(async {
            let r = sqlx::query("DELETE FROM audit_log WHERE at < ?")
                .bind(before.to_rfc3339())
                .execute(&self.pool)
                .await?;
            Ok(r.rows_affected())
        })
        .await
    }

    pub async fn trim_event_log(&self, before: DateTime<Utc>) -> Result<u64> {
        with_timeout(async {
            let r = sqlx::query("DELETE FROM event_log WHERE at < ?")
                .bind(before.to_rfc3339())
                .execute(&self.pool)
                .await?;
            Ok(r.rows_affected())
        })
        .await
    }

    // ─── Token revocations ─────────────────────────────────────────────────

    pub async fn add_revoked_token(&self, token_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO revoked_tokens (token_id, revoked_at) VALUES (?, ?)
                 ON CONFLICT(token_id) DO NOTHING",
            )
            .bind(token_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn load_revoked_tokens(&self) -> Result<Vec<String>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT token_id FROM revoked_tokens")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows.iter().map(|r| r.get::<String, _>("token_id")).collect())
        })
        .await
    }

    // ─── Cluster registry ──────────────────────────────────────────────────

    pub async fn upsert_node(&self, id: &str, ws_url: &str, role: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO cluster_nodes (id, ws_url, role, last_heartbeat) VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     ws_url = excluded.ws_url,
                     role = excluded.role,
                     last_heartbeat = excluded.last_heartbeat",
            )
            .bind(id)
            .bind(ws_url)
            .bind(role)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn touch_node_heartbeat(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE cluster_nodes SET last_heartbeat = ? WHERE id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn set_node_role(&self, id: &str, role: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE cluster_nodes SET role = ? WHERE id = ?")
                .bind(role)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<ClusterNodeRow>> {
        with_timeout(async {
            Ok(sqlx::query_as::<_, ClusterNodeRow>(
                "SELECT id, ws_url, role, last_heartbeat FROM cluster_nodes ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<ClusterNodeRow>> {
        with_timeout(async {
            Ok(sqlx::query_as::<_, ClusterNodeRow>(
                "SELECT id, ws_url, role, last_heartbeat FROM cluster_nodes WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await
    }

    // ─── Leader lease ──────────────────────────────────────────────────────

    /// Try to take (or keep) the leader lease. Succeeds when the lease row is
    /// empty, already ours, or expired. Returns `true` if this node is now
    /// the leader.
    pub async fn try_acquire_leader(&self, node_id: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires = (now + lease).to_rfc3339();
        with_timeout(async {
            let r = sqlx::query(
                "INSERT INTO cluster_leader (id, node_id, lease_expires_at) VALUES (1, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     node_id = excluded.node_id,
                     lease_expires_at = excluded.lease_expires_at
                 WHERE cluster_leader.node_id = excluded.node_id
                    OR cluster_leader.lease_expires_at < ?",
            )
            .bind(node_id)
            .bind(&expires)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(r.rows_affected() > 0)
        })
        .await
    }

    /// Current leader if its lease has not expired.
    pub async fn current_leader(&self) -> Result<Option<String>> {
        with_timeout(async {
            let row = sqlx::query("SELECT node_id, lease_expires_at FROM cluster_leader WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.and_then(|r| {
                let expires: String = r.get("lease_expires_at");
                if expires > Utc::now().to_rfc3339() {
                    Some(r.get::<String, _>("node_id"))
                } else {
                    None
                }
            }))
        })
        .await
    }

    // ─── Job locks ─────────────────────────────────────────────────────────

    /// Row-level advisory lock for the distributed scheduler. Succeeds when
    /// the lock is free, ours, or expired.
    pub async fn try_acquire_job(&self, job_id: &str, node_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires = (now + ttl).to_rfc3339();
        with_timeout(async {
            let r = sqlx::query(
                "INSERT INTO job_locks (job_id, owner_node, acquired_at, expires_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(job_id) DO UPDATE SET
                     owner_node = excluded.owner_node,
                     acquired_at = excluded.acquired_at,
                     expires_at = excluded.expires_at
                 WHERE job_locks.owner_node = excluded.owner_node
                    OR job_locks.expires_at < ?",
            )
            .bind(job_id)
            .bind(node_id)
            .bind(now.to_rfc3339())
            .bind(&expires)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(r.rows_affected() > 0)
        })
        .await
    }

    pub async fn release_job(&self, job_id: &str, node_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM job_locks WHERE job_id = ? AND owner_node = ?")
                .bind(job_id)
                .bind(node_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn agent_upsert_and_checkpoint_roundtrip() {
        let store = Storage::in_memory().await.unwrap();
        store
            .upsert_agent("a1", r#"{"id":"m"}"#, "created", "node-1")
            .await
            .unwrap();
        store.save_checkpoint("a1", r#"{"state":"ready"}"#).await.unwrap();
        let cp = store.load_checkpoint("a1").await.unwrap().unwrap();
        assert!(cp.contains("ready"));

        // Checkpointing a missing agent is an error, not a silent no-op.
        assert!(store.save_checkpoint("ghost", "{}").await.is_err());
    }

    #[tokio::test]
    async fn history_preserves_order() {
        let store = Storage::in_memory().await.unwrap();
        for (from, to, ev) in [
            ("created", "initializing", "initialize"),
            ("initializing", "ready", "ready"),
            ("ready", "running", "start"),
        ] {
            store
                .append_history("a1", from, to, ev, None, Utc::now())
                .await
                .unwrap();
        }
        let rows = store.history("a1").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].event, "initialize");
        assert_eq!(rows[2].to_state, "running");
    }

    #[tokio::test]
    async fn leader_lease_is_exclusive_until_expiry() {
        let store = Storage::in_memory().await.unwrap();
        assert!(store
            .try_acquire_leader("node-a", Duration::seconds(60))
            .await
            .unwrap());
        // Another node cannot steal a live lease.
        assert!(!store
            .try_acquire_leader("node-b", Duration::seconds(60))
            .await
            .unwrap());
        // The holder can refresh its own lease.
        assert!(store
            .try_acquire_leader("node-a", Duration::seconds(60))
            .await
            .unwrap());
        assert_eq!(store.current_leader().await.unwrap().as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn expired_lease_is_stealable() {
        let store = Storage::in_memory().await.unwrap();
        assert!(store
            .try_acquire_leader("node-a", Duration::seconds(-1))
            .await
            .unwrap());
        assert_eq!(store.current_leader().await.unwrap(), None);
        assert!(store
            .try_acquire_leader("node-b", Duration::seconds(60))
            .await
            .unwrap());
        assert_eq!(store.current_leader().await.unwrap().as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn job_locks_are_advisory_and_expiring() {
        let store = Storage::in_memory().await.unwrap();
        assert!(store
            .try_acquire_job("sweep", "node-a", Duration::seconds(60))
            .await
            .unwrap());
        assert!(!store
            .try_acquire_job("sweep", "node-b", Duration::seconds(60))
            .await
            .unwrap());
        store.release_job("sweep", "node-a").await.unwrap();
        assert!(store
            .try_acquire_job("sweep", "node-b", Duration::seconds(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn revocation_roundtrip() {
        let store = Storage::in_memory().await.unwrap();
        store.add_revoked_token("t1").await.unwrap();
        store.add_revoked_token("t1").await.unwrap(); // idempotent
        let ids = store.load_revoked_tokens().await.unwrap();
        assert_eq!(ids, vec!["t1".to_string()]);
    }
}
