// SPDX-License-Identifier: MIT
//! Audit trail for lifecycle, capability, policy, resource, and error events.
//!
//! Sinks are pluggable: stdout (tracing), an in-memory ring for tests and
//! diagnostics, a buffered append-only file with periodic flush, and the
//! SQLite `audit_log` table via a fire-and-forget writer task. A sink error
//! is logged at warn level and never propagates into the audited path.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// One audit record. `at` is strictly monotonic per logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub outcome: AuditOutcome,
    pub details: Value,
    pub at: DateTime<Utc>,
}

// ─── Sinks ───────────────────────────────────────────────────────────────────

/// A destination for audit events. Implementations must not block for long;
/// slow I/O belongs behind a buffer or a channel.
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
    /// Flush any buffered records. Default: no-op.
    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Emits each event as a structured tracing line.
pub struct StdoutSink;

impl AuditSink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        info!(
            target: "audit",
            actor = %event.actor,
            action = %event.action,
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            outcome = event.outcome.as_str(),
            "audit"
        );
        Ok(())
    }
}

/// Bounded in-memory ring, oldest records dropped first.
pub struct MemorySink {
    capacity: usize,
    ring: Mutex<VecDeque<AuditEvent>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.ring.lock().expect("audit ring lock").iter().cloned().collect()
    }
}

impl AuditSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let mut ring = self.ring.lock().expect("audit ring lock");
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event.clone());
        Ok(())
    }
}

/// Append-only JSONL file with an in-process buffer; flushed periodically by
/// [`AuditLogger::spawn_flush_task`] and on drop.
pub struct FileSink {
    path: PathBuf,
    writer: Mutex<Option<std::io::BufWriter<std::fs::File>>>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(None),
        }
    }

    fn ensure_open(
        &self,
        guard: &mut Option<std::io::BufWriter<std::fs::File>>,
    ) -> anyhow::Result<()> {
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *guard = Some(std::io::BufWriter::new(file));
        }
        Ok(())
    }
}

impl AuditSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let mut guard = self.writer.lock().expect("audit file lock");
        self.ensure_open(&mut guard)?;
        let w = guard.as_mut().expect("writer just opened");
        serde_json::to_writer(&mut *w, event)?;
        w.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        let mut guard = self.writer.lock().expect("audit file lock");
        if let Some(w) = guard.as_mut() {
            w.flush()?;
        }
        Ok(())
    }
}

// ─── Logger ──────────────────────────────────────────────────────────────────

/// Fans audit events out to every configured sink plus an optional
/// store-writer channel. Timestamps are forced strictly monotonic so the
/// audit trail totally orders events even within one millisecond.
pub struct AuditLogger {
    sinks: Vec<Box<dyn AuditSink>>,
    store_tx: Mutex<Option<mpsc::UnboundedSender<AuditEvent>>>,
    last_at: Mutex<DateTime<Utc>>,
}

impl AuditLogger {
    pub fn new(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            sinks,
            store_tx: Mutex::new(None),
            last_at: Mutex::new(Utc::now() - Duration::seconds(1)),
        }
    }

    /// Attach the fire-and-forget store writer channel (see `Storage`).
    pub fn attach_store(&self, tx: mpsc::UnboundedSender<AuditEvent>) {
        *self.store_tx.lock().expect("audit store lock") = Some(tx);
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_at.lock().expect("audit ts lock");
        let now = Utc::now();
        let at = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = at;
        at
    }

    /// Record an event. Never fails, never panics on sink trouble.
    pub fn record(
        &self,
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        outcome: AuditOutcome,
        details: Value,
    ) {
        let event = AuditEvent {
            actor: actor.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            outcome,
            details,
            at: self.next_timestamp(),
        };

        for sink in &self.sinks {
            if let Err(e) = sink.record(&event) {
                warn!(sink = sink.name(), err = %e, "audit sink failed — event dropped by this sink");
            }
        }
        if let Some(tx) = self.store_tx.lock().expect("audit store lock").as_ref() {
            // Receiver gone means shutdown in progress; nothing to do.
            let _ = tx.send(event);
        }
    }

    /// Flush buffered sinks every `interval`. Runs until the logger is dropped.
    pub fn spawn_flush_task(self: &std::sync::Arc<Self>, interval: std::time::Duration) {
        let logger = std::sync::Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(logger) = logger.upgrade() else {
                    break;
                };
                for sink in &logger.sinks {
                    if let Err(e) = sink.flush() {
                        warn!(sink = sink.name(), err = %e, "audit sink flush failed");
                    }
                }
            }
        });
    }
}
