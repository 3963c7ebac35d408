// SPDX-License-Identifier: MIT
//! At-rest sealing for memory text fields.
//!
//! Each value is AES-256-GCM encrypted under a per-owner sub-key derived by
//! `scrypt(master_key, HMAC-SHA-256("salt", owner_id), N=16384, r=8, p=1,
//! len=32)`. Stored form: `enc:v1:<b64 iv>:<b64 tag>:<b64 ciphertext>` with
//! a fresh 12-byte IV per value. Values without the prefix are returned
//! unchanged on decrypt, so plaintext written before encryption was enabled
//! stays readable.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{ErrorKind, GatewayError, Result};

const PREFIX: &str = "enc:v1:";
const IV_LEN: usize = 12;

/// scrypt cost parameters: N=16384 (2^14), r=8, p=1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const KEY_LEN: usize = 32;

pub struct MemoryCipher {
    master_key: Vec<u8>,
    /// scrypt is deliberately slow — derive each owner's sub-key once.
    derived: RwLock<HashMap<String, [u8; KEY_LEN]>>,
}

impl MemoryCipher {
    pub fn new(master_key: &str) -> Result<Self> {
        if master_key.is_empty() {
            return Err(GatewayError::validation("master key must not be empty"));
        }
        Ok(Self {
            master_key: master_key.as_bytes().to_vec(),
            derived: RwLock::new(HashMap::new()),
        })
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(PREFIX)
    }

    fn owner_key(&self, owner_id: &str) -> Result<[u8; KEY_LEN]> {
        if let Some(key) = self.derived.read().expect("cipher lock").get(owner_id) {
            return Ok(*key);
        }

        let mut salt_mac: Hmac<Sha256> =
            Mac::new_from_slice(b"salt").expect("hmac accepts any key size");
        salt_mac.update(owner_id.as_bytes());
        let salt = salt_mac.finalize().into_bytes();

        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
            .map_err(|e| GatewayError::internal(format!("scrypt params: {e}")))?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(&self.master_key, &salt, &params, &mut key)
            .map_err(|e| GatewayError::internal(format!("scrypt: {e}")))?;

        self.derived
            .write()
            .expect("cipher lock")
            .insert(owner_id.to_string(), key);
        Ok(key)
    }

    /// Seal a value for `owner_id`. Already sealed values pass through.
    pub fn encrypt(&self, owner_id: &str, plaintext: &str) -> Result<String> {
        if Self::is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }
        let key = self.owner_key(owner_id)?;
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let mut buf = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(nonce, &[], &mut buf)
            .map_err(|_| GatewayError::internal("AES-GCM encryption failed"))?;

        Ok(format!(
            "{PREFIX}{}:{}:{}",
            B64.encode(iv),
            B64.encode(tag),
            B64.encode(&buf)
        ))
    }

    /// Open a sealed value for `owner_id`. Plain values pass through.
    pub fn decrypt(&self, owner_id: &str, value: &str) -> Result<String> {
        let Some(rest) = value.strip_prefix(PREFIX) else {
            return Ok(value.to_string());
        };
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 3 {
            return Err(GatewayError::new(
                ErrorKind::Validation,
                "malformed sealed value",
            ));
        }
        let iv = B64
            .decode(parts[0])
            .map_err(|_| GatewayError::validation("bad iv encoding"))?;
        let tag = B64
            .decode(parts[1])
            .map_err(|_| GatewayError::validation("bad tag encoding"))?;
        let mut buf = B64
            .decode(parts[2])
            .map_err(|_| GatewayError::validation("bad ciphertext encoding"))?;
        if iv.len() != IV_LEN {
            return Err(GatewayError::validation("bad iv length"));
        }
        if tag.len() != 16 {
            return Err(GatewayError::validation("bad tag length"));
        }

        let key = self.owner_key(owner_id)?;
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&iv),
                &[],
                &mut buf,
                aes_gcm::Tag::from_slice(&tag),
            )
            .map_err(|_| {
                GatewayError::new(ErrorKind::Internal, "decryption failed — wrong key or tampering")
            })?;

        String::from_utf8(buf)
            .map_err(|_| GatewayError::internal("decrypted value is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> MemoryCipher {
        MemoryCipher::new("a-master-key-for-tests").unwrap()
    }

    #[test]
    fn roundtrip() {
        let c = cipher();
        let sealed = c.encrypt("agent-1", "the launch code is 0000").unwrap();
        assert!(MemoryCipher::is_encrypted(&sealed));
        assert_eq!(c.decrypt("agent-1", &sealed).unwrap(), "the launch code is 0000");
    }

    #[test]
    fn fresh_iv_per_value() {
        let c = cipher();
        let a = c.encrypt("agent-1", "same text").unwrap();
        let b = c.encrypt("agent-1", "same text").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn per_owner_keys_are_isolated() {
        let c = cipher();
        let sealed = c.encrypt("agent-1", "private").unwrap();
        assert!(c.decrypt("agent-2", &sealed).is_err());
    }

    #[test]
    fn plaintext_passes_through_decrypt() {
        let c = cipher();
        assert_eq!(c.decrypt("agent-1", "not sealed").unwrap(), "not sealed");
    }

    #[test]
    fn double_encrypt_is_idempotent() {
        let c = cipher();
        let sealed = c.encrypt("agent-1", "once").unwrap();
        let again = c.encrypt("agent-1", &sealed).unwrap();
        assert_eq!(sealed, again);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let c = cipher();
        let sealed = c.encrypt("agent-1", "integrity matters").unwrap();
        let mut parts: Vec<String> = sealed.split(':').map(str::to_string).collect();
        let last = parts.last_mut().unwrap();
        // Flip the first ciphertext byte.
        let mut raw = B64.decode(last.as_str()).unwrap();
        raw[0] ^= 0xFF;
        *last = B64.encode(raw);
        assert!(c.decrypt("agent-1", &parts.join(":")).is_err());
    }

    #[test]
    fn malformed_sealed_values_are_rejected() {
        let c = cipher();
        assert!(c.decrypt("agent-1", "enc:v1:onlyonepart").is_err());
        assert!(c.decrypt("agent-1", "enc:v1:!!:!!:!!").is_err());
    }
}
