// SPDX-License-Identifier: MIT
//! Short-lived signed capability tokens for sensitive operations.
//!
//! A token encodes `{token_id, subject, capabilities, constraints,
//! issued_at, expires_at}` and carries an HMAC-SHA256 over its canonical
//! JSON serialization using the process-wide `permission_secret`. Wire
//! format: `base64(canonical_json) + "." + hex(hmac)`. Revocation is a
//! persistent set of token ids checked on every verification.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::RwLock;
use uuid::Uuid;

use crate::config::MIN_PERMISSION_SECRET_LEN;
use crate::error::{ErrorKind, GatewayError, Result};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a capability token. Field order is the canonical
/// serialization order — do not reorder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityToken {
    pub token_id: String,
    pub subject: String,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub constraints: Map<String, serde_json::Value>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CapabilityToken {
    pub fn grants(&self, capability: &str) -> bool {
        let want = crate::capability::normalize(capability);
        self.capabilities.iter().any(|c| *c == want)
    }
}

/// Issues and verifies signed capability tokens.
pub struct TokenManager {
    secret: Vec<u8>,
    revoked: RwLock<HashSet<String>>,
}

impl TokenManager {
    /// Fails with `Validation` if the secret is shorter than 32 bytes.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.len() < MIN_PERMISSION_SECRET_LEN {
            return Err(GatewayError::validation(format!(
                "permission secret must be at least {MIN_PERMISSION_SECRET_LEN} bytes"
            )));
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            revoked: RwLock::new(HashSet::new()),
        })
    }

    /// Issue a token for `subject` valid for `ttl`.
    pub fn issue(
        &self,
        subject: &str,
        capabilities: &[String],
        constraints: Map<String, serde_json::Value>,
        ttl: Duration,
    ) -> Result<String> {
        let now = Utc::now();
        let token = CapabilityToken {
            token_id: Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            capabilities: capabilities
                .iter()
                .map(|c| crate::capability::normalize(c))
                .collect(),
            constraints,
            issued_at: now,
            expires_at: now + ttl,
        };
        let canonical = serde_json::to_vec(&token)
            .map_err(|e| GatewayError::internal(format!("token serialization: {e}")))?;
        let sig = self.sign(&canonical);
        Ok(format!("{}.{}", B64.encode(&canonical), hex::encode(sig)))
    }

    /// Verify signature, expiry, subject, and revocation. Returns the claims.
    pub fn verify(&self, wire: &str, expected_subject: &str) -> Result<CapabilityToken> {
        let (body_b64, sig_hex) = wire
            .split_once('.')
            .ok_or_else(|| GatewayError::new(ErrorKind::Unauthenticated, "malformed token"))?;
        let body = B64
            .decode(body_b64)
            .map_err(|_| GatewayError::new(ErrorKind::Unauthenticated, "malformed token body"))?;
        let sig = hex::decode(sig_hex)
            .map_err(|_| GatewayError::new(ErrorKind::Unauthenticated, "malformed signature"))?;

        // Constant-time signature check before anything else is trusted.
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(&body);
        mac.verify_slice(&sig)
            .map_err(|_| GatewayError::new(ErrorKind::Unauthenticated, "invalid signature"))?;

        let token: CapabilityToken = serde_json::from_slice(&body)
            .map_err(|_| GatewayError::new(ErrorKind::Unauthenticated, "malformed claims"))?;

        if token.expires_at <= Utc::now() {
            return Err(GatewayError::new(ErrorKind::Unauthenticated, "token expired"));
        }
        if token.subject != expected_subject {
            return Err(GatewayError::new(
                ErrorKind::Forbidden,
                "token subject mismatch",
            ));
        }
        if self
            .revoked
            .read()
            .expect("revocation lock")
            .contains(&token.token_id)
        {
            return Err(GatewayError::new(ErrorKind::Unauthenticated, "token revoked"));
        }
        Ok(token)
    }

    /// Add a token id to the revocation set. Idempotent.
    pub fn revoke(&self, token_id: &str) -> bool {
        self.revoked
            .write()
            .expect("revocation lock")
            .insert(token_id.to_string())
    }

    /// Rehydrate the revocation set from persistence at startup.
    pub fn load_revocations(&self, ids: impl IntoIterator<Item = String>) {
        let mut revoked = self.revoked.write().expect("revocation lock");
        revoked.extend(ids);
    }

    fn sign(&self, body: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenManager {
        TokenManager::new(&"s".repeat(32)).unwrap()
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(TokenManager::new("tiny").is_err());
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let mgr = manager();
        let wire = mgr
            .issue(
                "client-1",
                &["llm:chat".into(), "memory.read".into()],
                Map::new(),
                Duration::minutes(5),
            )
            .unwrap();
        let token = mgr.verify(&wire, "client-1").unwrap();
        assert!(token.grants("llm:chat"));
        // Dotted alias was normalized at issue time.
        assert!(token.grants("memory:read"));
        assert!(!token.grants("shell:exec"));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let mgr = manager();
        let wire = mgr
            .issue("client-1", &["llm:chat".into()], Map::new(), Duration::minutes(5))
            .unwrap();
        let (body, sig) = wire.split_once('.').unwrap();
        let forged = CapabilityToken {
            token_id: "forged".into(),
            subject: "client-1".into(),
            capabilities: vec!["shell:exec".into()],
            constraints: Map::new(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(5),
        };
        let forged_b64 = B64.encode(serde_json::to_vec(&forged).unwrap());
        assert!(mgr.verify(&format!("{forged_b64}.{sig}"), "client-1").is_err());
        assert!(mgr.verify(&format!("{body}.deadbeef"), "client-1").is_err());
    }

    #[test]
    fn expired_token_fails() {
        let mgr = manager();
        let wire = mgr
            .issue("client-1", &["llm:chat".into()], Map::new(), Duration::seconds(-1))
            .unwrap();
        let err = mgr.verify(&wire, "client-1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
    }

    #[test]
    fn wrong_subject_fails() {
        let mgr = manager();
        let wire = mgr
            .issue("client-1", &["llm:chat".into()], Map::new(), Duration::minutes(5))
            .unwrap();
        let err = mgr.verify(&wire, "client-2").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[test]
    fn revoked_token_fails() {
        let mgr = manager();
        let wire = mgr
            .issue("client-1", &["llm:chat".into()], Map::new(), Duration::minutes(5))
            .unwrap();
        let token = mgr.verify(&wire, "client-1").unwrap();
        assert!(mgr.revoke(&token.token_id));
        assert!(mgr.verify(&wire, "client-1").is_err());
    }
}
