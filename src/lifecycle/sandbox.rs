// SPDX-License-Identifier: MIT
//! Per-agent capability sandbox.
//!
//! Grants are cumulative and consulted in insertion order; expired grants
//! are discarded as they are encountered. A check either returns the first
//! grant whose constraints hold for the context, or a deny with the reason.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::{normalize, CapabilityGrant};

/// Result of a capability check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityCheck {
    pub allowed: bool,
    pub capability: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sandbox {
    grants: Vec<CapabilityGrant>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grants(grants: Vec<CapabilityGrant>) -> Self {
        Self { grants }
    }

    pub fn grants(&self) -> &[CapabilityGrant] {
        &self.grants
    }

    /// Append a grant. Grants are cumulative — duplicates are allowed and
    /// the earliest matching one wins at check time.
    pub fn grant(&mut self, grant: CapabilityGrant) {
        self.grants.push(grant);
    }

    /// Remove every grant for `capability`. Returns how many were removed.
    pub fn revoke(&mut self, capability: &str) -> usize {
        let want = normalize(capability);
        let before = self.grants.len();
        self.grants.retain(|g| g.capability != want);
        before - self.grants.len()
    }

    /// Drop all grants (sandbox teardown on terminate).
    pub fn clear(&mut self) {
        self.grants.clear();
    }

    /// `true` if a non-expired grant exists, ignoring constraints.
    pub fn holds(&self, capability: &str) -> bool {
        let want = normalize(capability);
        let now = Utc::now();
        self.grants
            .iter()
            .any(|g| g.capability == want && !g.is_expired(now))
    }

    /// Full check against an optional context map. Expired grants are
    /// removed as a side effect.
    pub fn check(&mut self, capability: &str, context: &Map<String, Value>) -> CapabilityCheck {
        let want = normalize(capability);
        let now = Utc::now();
        self.grants.retain(|g| !g.is_expired(now));

        let mut constraint_miss = false;
        for grant in &self.grants {
            if grant.capability != want {
                continue;
            }
            if grant.constraints_satisfied(context) {
                return CapabilityCheck {
                    allowed: true,
                    capability: want,
                    reason: format!("granted by {}", grant.granted_by),
                };
            }
            constraint_miss = true;
        }

        CapabilityCheck {
            allowed: false,
            capability: want,
            reason: if constraint_miss {
                "constraints not satisfied".to_string()
            } else {
                "no matching grant".to_string()
            },
        }
    }
}
