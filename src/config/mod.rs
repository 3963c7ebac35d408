// SPDX-License-Identifier: MIT
//! Daemon configuration.
//!
//! Priority (highest to lowest): CLI / env var  >  TOML  >  built-in default.
//! The TOML file lives at `{data_dir}/config.toml`; every field is an
//! optional override. Validation failures are reported all at once so an
//! operator can fix a config file in one pass (exit code 2); production
//! hardening violations are fatal at startup (exit code 1).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4800;
const DEFAULT_MAX_CONNECTIONS: usize = 128;
const DEFAULT_MESSAGE_RATE_LIMIT: u64 = 120;
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_AGENTS: usize = 64;
const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_RETENTION_EPISODIC_DAYS: u32 = 90;
const DEFAULT_RETENTION_SEMANTIC_DAYS: u32 = 365;
const DEFAULT_RETENTION_PROCEDURAL_DAYS: u32 = 365;
const DEFAULT_ARCHIVE_TEXT_LIMIT: usize = 4096;

/// Minimum length for `permission_secret` (HMAC key for capability tokens).
pub const MIN_PERMISSION_SECRET_LEN: usize = 32;

// ─── TOML config file ─────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct TomlGateway {
    host: Option<String>,
    port: Option<u16>,
    auth_token: Option<String>,
    max_connections: Option<usize>,
    message_rate_limit: Option<u64>,
    max_payload_size: Option<usize>,
}

#[derive(Deserialize, Default)]
struct TomlCluster {
    enabled: Option<bool>,
    node_ws_url: Option<String>,
    distributed_scheduler: Option<bool>,
}

#[derive(Deserialize, Default)]
struct TomlRuntime {
    max_agents: Option<usize>,
    default_memory_limit: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    checkpoint_interval_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlMemory {
    encryption_enabled: Option<bool>,
    master_key: Option<String>,
}

#[derive(Deserialize, Default)]
struct TomlRetention {
    episodic_days: Option<u32>,
    semantic_days: Option<u32>,
    procedural_days: Option<u32>,
    archive_days: Option<u32>,
    archive_text_limit: Option<usize>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    log: Option<String>,
    permission_secret: Option<String>,
    enforce_egress_proxy: Option<bool>,
    egress_proxy_url: Option<String>,
    enforce_production_hardening: Option<bool>,
    gateway: Option<TomlGateway>,
    cluster: Option<TomlCluster>,
    runtime: Option<TomlRuntime>,
    memory: Option<TomlMemory>,
    retention: Option<TomlRetention>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ─── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewaySection {
    pub host: String,
    pub port: u16,
    /// Required client token; empty disables auth (dev only).
    pub auth_token: String,
    pub max_connections: usize,
    /// Messages per connection per rolling 60 s window.
    pub message_rate_limit: u64,
    /// Max inbound frame size in bytes.
    pub max_payload_size: usize,
}

#[derive(Debug, Clone)]
pub struct ClusterSection {
    pub enabled: bool,
    /// This node's advertised duplex endpoint, e.g. `ws://10.0.0.5:4800`.
    pub node_ws_url: String,
    /// Per-job advisory locks instead of leadership gating.
    pub distributed_scheduler: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeSection {
    pub max_agents: usize,
    pub default_memory_limit: u64,
    pub heartbeat_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// 0 disables auto-checkpoint.
    pub checkpoint_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct MemorySection {
    pub encryption_enabled: bool,
    pub master_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetentionSection {
    pub episodic_days: u32,
    pub semantic_days: u32,
    pub procedural_days: u32,
    /// Rows older than this (but younger than the delete window) are archived.
    /// 0 disables archiving.
    pub archive_days: u32,
    pub archive_text_limit: usize,
}

// ─── GatewayConfig ────────────────────────────────────────────────────────────

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub data_dir: PathBuf,
    pub log: String,
    pub gateway: GatewaySection,
    pub cluster: ClusterSection,
    pub runtime: RuntimeSection,
    pub memory: MemorySection,
    pub retention: RetentionSection,
    /// HMAC key for capability tokens; must be ≥ 32 bytes.
    pub permission_secret: String,
    pub enforce_egress_proxy: bool,
    pub egress_proxy_url: Option<String>,
    pub enforce_production_hardening: bool,
}

impl GatewayConfig {
    /// Build config from CLI args + env vars + optional TOML file.
    pub fn new(
        host: Option<String>,
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();
        let tg = toml.gateway.unwrap_or_default();
        let tc = toml.cluster.unwrap_or_default();
        let tr = toml.runtime.unwrap_or_default();
        let tm = toml.memory.unwrap_or_default();
        let tt = toml.retention.unwrap_or_default();

        let gateway = GatewaySection {
            host: host.or(tg.host).unwrap_or_else(|| DEFAULT_HOST.into()),
            port: port.or(tg.port).unwrap_or(DEFAULT_PORT),
            auth_token: env_var("AGENTD_AUTH_TOKEN")
                .or(tg.auth_token)
                .unwrap_or_default(),
            max_connections: tg.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            message_rate_limit: tg.message_rate_limit.unwrap_or(DEFAULT_MESSAGE_RATE_LIMIT),
            max_payload_size: tg.max_payload_size.unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES),
        };

        let cluster = ClusterSection {
            enabled: tc.enabled.unwrap_or(false),
            node_ws_url: tc
                .node_ws_url
                .unwrap_or_else(|| format!("ws://{}:{}", gateway.host, gateway.port)),
            distributed_scheduler: tc.distributed_scheduler.unwrap_or(false),
        };

        let runtime = RuntimeSection {
            max_agents: tr.max_agents.unwrap_or(DEFAULT_MAX_AGENTS),
            default_memory_limit: tr.default_memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT_BYTES),
            heartbeat_timeout_ms: tr
                .heartbeat_timeout_ms
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            shutdown_timeout_ms: tr
                .shutdown_timeout_ms
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            checkpoint_interval_ms: tr
                .checkpoint_interval_ms
                .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL_MS),
        };

        let memory = MemorySection {
            encryption_enabled: tm.encryption_enabled.unwrap_or(false),
            master_key: env_var("AGENTD_MASTER_KEY").or(tm.master_key),
        };

        let retention = RetentionSection {
            episodic_days: tt.episodic_days.unwrap_or(DEFAULT_RETENTION_EPISODIC_DAYS),
            semantic_days: tt.semantic_days.unwrap_or(DEFAULT_RETENTION_SEMANTIC_DAYS),
            procedural_days: tt
                .procedural_days
                .unwrap_or(DEFAULT_RETENTION_PROCEDURAL_DAYS),
            archive_days: tt.archive_days.unwrap_or(0),
            archive_text_limit: tt.archive_text_limit.unwrap_or(DEFAULT_ARCHIVE_TEXT_LIMIT),
        };

        Self {
            data_dir,
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            gateway,
            cluster,
            runtime,
            memory,
            retention,
            permission_secret: env_var("AGENTD_PERMISSION_SECRET")
                .or(toml.permission_secret)
                .unwrap_or_default(),
            enforce_egress_proxy: toml.enforce_egress_proxy.unwrap_or(false),
            egress_proxy_url: toml.egress_proxy_url,
            enforce_production_hardening: toml.enforce_production_hardening.unwrap_or(false),
        }
    }

    /// Structural validation. Returns every problem found (exit code 2 path).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.gateway.port == 0 {
            problems.push("gateway.port must be non-zero".into());
        }
        if self.gateway.port == u16::MAX {
            problems.push("gateway.port must leave room for the health endpoint on port+1".into());
        }
        if self.gateway.max_payload_size == 0 {
            problems.push("gateway.max_payload_size must be non-zero".into());
        }
        if self.gateway.message_rate_limit == 0 {
            problems.push("gateway.message_rate_limit must be non-zero".into());
        }
        if self.runtime.max_agents == 0 {
            problems.push("runtime.max_agents must be non-zero".into());
        }
        if self.cluster.enabled && !self.cluster.node_ws_url.starts_with("ws") {
            problems.push(format!(
                "cluster.node_ws_url must be a ws:// or wss:// URL, got {:?}",
                self.cluster.node_ws_url
            ));
        }
        if self.memory.encryption_enabled
            && self.memory.master_key.as_deref().unwrap_or("").is_empty()
        {
            problems.push("memory.encryption_enabled requires memory.master_key".into());
        }
        if self.enforce_egress_proxy && self.egress_proxy_url.as_deref().unwrap_or("").is_empty() {
            problems.push("enforce_egress_proxy requires egress_proxy_url".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Production hardening checks — weak secrets and plaintext shortcuts that
    /// are tolerable in dev become fatal at startup (exit code 1).
    pub fn enforce_hardening(&self) -> Result<(), Vec<String>> {
        if !self.enforce_production_hardening {
            return Ok(());
        }
        let mut problems = Vec::new();

        if self.permission_secret.len() < MIN_PERMISSION_SECRET_LEN {
            problems.push(format!(
                "permission_secret must be at least {MIN_PERMISSION_SECRET_LEN} bytes in production"
            ));
        }
        if self.gateway.auth_token.is_empty() {
            problems.push("gateway.auth_token must be set in production".into());
        }
        if self.memory.encryption_enabled {
            let key = self.memory.master_key.as_deref().unwrap_or("");
            if key.len() < 16 {
                problems.push("memory.master_key is too short for production use".into());
            }
        }
        if self.cluster.enabled && self.cluster.node_ws_url.starts_with("ws://") {
            let host_part = self
                .cluster
                .node_ws_url
                .trim_start_matches("ws://")
                .split([':', '/'])
                .next()
                .unwrap_or("");
            if host_part != "127.0.0.1" && host_part != "localhost" {
                problems.push("cluster.node_ws_url must use wss:// for non-local endpoints".into());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Some(dir) = env_var("AGENTD_DATA_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".agentd"))
        .unwrap_or_else(|| PathBuf::from(".agentd"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GatewayConfig {
        GatewayConfig::new(
            None,
            Some(4800),
            Some(std::env::temp_dir().join("agentd-config-test")),
            Some("warn".into()),
        )
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = base();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.gateway.host, DEFAULT_HOST);
        assert_eq!(cfg.runtime.max_agents, DEFAULT_MAX_AGENTS);
        assert!(!cfg.cluster.enabled);
    }

    #[test]
    fn encryption_without_key_is_rejected() {
        let mut cfg = base();
        cfg.memory.encryption_enabled = true;
        cfg.memory.master_key = None;
        let problems = cfg.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("master_key")));
    }

    #[test]
    fn hardening_rejects_short_secret_and_missing_token() {
        let mut cfg = base();
        cfg.enforce_production_hardening = true;
        cfg.permission_secret = "short".into();
        cfg.gateway.auth_token.clear();
        let problems = cfg.enforce_hardening().unwrap_err();
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn hardening_is_noop_when_disabled() {
        let mut cfg = base();
        cfg.permission_secret.clear();
        assert!(cfg.enforce_hardening().is_ok());
    }

    #[test]
    fn hardening_rejects_plaintext_external_cluster_url() {
        let mut cfg = base();
        cfg.enforce_production_hardening = true;
        cfg.permission_secret = "x".repeat(32);
        cfg.gateway.auth_token = "token".into();
        cfg.cluster.enabled = true;
        cfg.cluster.node_ws_url = "ws://10.0.0.5:4800".into();
        let problems = cfg.enforce_hardening().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("wss://")));
    }
}
