// SPDX-License-Identifier: MIT
//! Sandbox policy evaluation.
//!
//! A policy set is an ordered list of rules typed by resource class. For a
//! given context, enabled rules of the matching class are scanned in
//! descending priority; the first match wins. `approve` decisions call an
//! external approval handler, blocking up to the handler timeout — with no
//! handler configured, `approve` degrades to `block`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::capability::glob_match;

/// What kind of resource a rule governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    File,
    Network,
    Shell,
    Secret,
}

/// A rule's verdict. `Approve` defers to a human or external system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDecision {
    Allow,
    Block,
    Approve,
}

/// Terminal outcome of an evaluation (after approval resolution).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    /// Rule that decided, `None` when the default decision applied.
    pub rule_id: Option<String>,
    pub reason: String,
}

/// One policy rule. `pattern` globs match against the context target
/// (path, host, command, or secret name depending on the class).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub class: ResourceClass,
    pub priority: i32,
    pub enabled: bool,
    pub decision: RuleDecision,
    /// Glob patterns over the target (any match qualifies).
    pub patterns: Vec<String>,
    /// Operations the rule applies to (`read`, `write`, `connect`, ...).
    /// Empty means all operations.
    #[serde(default)]
    pub operations: Vec<String>,
}

impl PolicyRule {
    fn matches(&self, ctx: &PolicyContext) -> bool {
        if self.class != ctx.class {
            return false;
        }
        if !self.operations.is_empty() && !self.operations.iter().any(|o| o == &ctx.operation) {
            return false;
        }
        self.patterns.iter().any(|p| glob_match(p, &ctx.target))
    }
}

/// What an agent is trying to do.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub agent_id: String,
    pub class: ResourceClass,
    /// Path, host, command line, or secret name.
    pub target: String,
    pub operation: String,
}

/// External approval hook for `approve` rules.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn approve(&self, ctx: &PolicyContext, rule_id: &str) -> bool;
}

/// Ordered rule set with a fail-safe default.
pub struct PolicyEngine {
    /// Sorted by descending priority at construction.
    rules: Vec<PolicyRule>,
    default_decision: RuleDecision,
    approval_handler: Option<Arc<dyn ApprovalHandler>>,
    handler_timeout: Duration,
}

impl PolicyEngine {
    pub fn new(mut rules: Vec<PolicyRule>, default_decision: RuleDecision) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules,
            default_decision,
            approval_handler: None,
            handler_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_approval_handler(
        mut self,
        handler: Arc<dyn ApprovalHandler>,
        timeout: Duration,
    ) -> Self {
        self.approval_handler = Some(handler);
        self.handler_timeout = timeout;
        self
    }

    /// Evaluate `ctx` against the rule set. First match wins; no match yields
    /// the default decision.
    pub async fn evaluate(&self, ctx: &PolicyContext) -> PolicyDecision {
        for rule in self.rules.iter().filter(|r| r.enabled) {
            if !rule.matches(ctx) {
                continue;
            }
            return self.resolve(rule.decision, Some(rule.id.clone()), ctx).await;
        }
        self.resolve(self.default_decision, None, ctx).await
    }

    async fn resolve(
        &self,
        decision: RuleDecision,
        rule_id: Option<String>,
        ctx: &PolicyContext,
    ) -> PolicyDecision {
        let reason_src = rule_id.clone().unwrap_or_else(|| "default".to_string());
        match decision {
            RuleDecision::Allow => PolicyDecision {
                allowed: true,
                rule_id,
                reason: format!("allowed by {reason_src}"),
            },
            RuleDecision::Block => PolicyDecision {
                allowed: false,
                rule_id,
                reason: format!("blocked by {reason_src}"),
            },
            RuleDecision::Approve => {
                let Some(handler) = self.approval_handler.as_ref() else {
                    return PolicyDecision {
                        allowed: false,
                        rule_id,
                        reason: "approval required but no handler configured".into(),
                    };
                };
                let id = rule_id.clone().unwrap_or_else(|| "default".into());
                match tokio::time::timeout(self.handler_timeout, handler.approve(ctx, &id)).await {
                    Ok(true) => PolicyDecision {
                        allowed: true,
                        rule_id,
                        reason: format!("approved via {id}"),
                    },
                    Ok(false) => PolicyDecision {
                        allowed: false,
                        rule_id,
                        reason: format!("approval denied via {id}"),
                    },
                    Err(_) => {
                        warn!(rule = %id, agent = %ctx.agent_id, "approval handler timed out");
                        PolicyDecision {
                            allowed: false,
                            rule_id,
                            reason: "approval timed out".into(),
                        }
                    }
                }
            }
        }
    }
}
