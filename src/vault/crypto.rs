//! Payload sealing for the vault.
//!
//! - Key: HKDF-SHA256 over the account's shared seed, salted with the user id.
//!   Every device of one account derives the same key.
//! - Cipher: AES-256-GCM with a random 96-bit nonce.
//! - AAD: `entity|op|entity_id`, so a sealed body cannot be replayed under
//!   another change envelope.
//! - Wire form: base64(nonce || ciphertext || tag).

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload as AeadPayload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::db::ChangeOp;
use crate::error::SyncError;

/// Nonce size for AES-GCM (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// HKDF `info` label; bump the suffix to rotate every derived key.
const KEY_INFO: &[u8] = b"pcrm-vault-payload-v1";

/// Minimum accepted seed length in bytes.
const MIN_SEED_LEN: usize = 16;

/// Symmetric key for sealing change payloads.
#[derive(Clone)]
pub struct VaultKey {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// Additional authenticated data binding a payload to its envelope.
pub fn envelope_aad(entity: &str, op: ChangeOp, entity_id: &str) -> Vec<u8> {
    format!("{}|{}|{}", entity, op.as_str(), entity_id).into_bytes()
}

impl VaultKey {
    /// Derive the payload key from raw seed bytes.
    pub fn derive(seed: &[u8], user_id: &str) -> Result<Self, SyncError> {
        if seed.len() < MIN_SEED_LEN {
            return Err(SyncError::Codec(format!(
                "key seed must be at least {MIN_SEED_LEN} bytes, got {}",
                seed.len()
            )));
        }
        let hk = Hkdf::<Sha256>::new(Some(user_id.as_bytes()), seed);
        let mut okm = [0u8; 32];
        hk.expand(KEY_INFO, &mut okm)
            .map_err(|e| SyncError::Codec(format!("key derivation failed: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(&okm)
            .map_err(|e| SyncError::Codec(format!("invalid key length: {e}")))?;
        Ok(Self { cipher })
    }

    /// Derive from the hex-encoded seed stored in `vault_state`.
    pub fn from_hex_seed(seed_hex: &str, user_id: &str) -> Result<Self, SyncError> {
        let seed = hex::decode(seed_hex.trim())
            .map_err(|e| SyncError::Codec(format!("key seed is not hex: {e}")))?;
        Self::derive(&seed, user_id)
    }

    /// Encrypt `plaintext`, returning the base64 wire form.
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<String, SyncError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, AeadPayload { msg: plaintext, aad })
            .map_err(|e| SyncError::Codec(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt a base64 wire payload produced by [`VaultKey::seal`].
    pub fn open(&self, aad: &[u8], sealed: &str) -> Result<Vec<u8>, SyncError> {
        let raw = STANDARD
            .decode(sealed.trim())
            .map_err(|e| SyncError::Codec(format!("payload is not base64: {e}")))?;
        if raw.len() <= NONCE_SIZE {
            return Err(SyncError::Codec("invalid ciphertext length".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), AeadPayload { msg: ciphertext, aad })
            .map_err(|_| SyncError::Codec("decryption failed".to_string()))
    }
}

/// Generate a fresh random seed (hex) for a new vault account.
pub fn generate_seed_hex() -> String {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    hex::encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_for(user: &str) -> VaultKey {
        VaultKey::from_hex_seed(&"ab".repeat(32), user).unwrap()
    }

    #[test]
    fn test_seal_open() {
        let key = key_for("user-1");
        let aad = envelope_aad("contact", ChangeOp::Upsert, "c-1");
        let sealed = key.seal(&aad, br#"{"id":"c-1"}"#).unwrap();
        assert_eq!(key.open(&aad, &sealed).unwrap(), br#"{"id":"c-1"}"#);
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let key = key_for("user-1");
        let aad = envelope_aad("contact", ChangeOp::Upsert, "c-1");
        assert_ne!(key.seal(&aad, b"x").unwrap(), key.seal(&aad, b"x").unwrap());
    }

    #[test]
    fn test_other_envelope_fails() {
        let key = key_for("user-1");
        let sealed = key
            .seal(&envelope_aad("contact", ChangeOp::Upsert, "c-1"), b"x")
            .unwrap();
        let err = key
            .open(&envelope_aad("contact", ChangeOp::Upsert, "c-2"), &sealed)
            .unwrap_err();
        assert!(matches!(err, SyncError::Codec(_)));
    }

    #[test]
    fn test_key_depends_on_user() {
        let aad = envelope_aad("company", ChangeOp::Delete, "co-1");
        let sealed = key_for("user-1").seal(&aad, b"x").unwrap();
        assert!(key_for("user-2").open(&aad, &sealed).is_err());
    }

    #[test]
    fn test_rejects_short_or_bad_seed() {
        assert!(VaultKey::from_hex_seed("abcd", "u").is_err());
        assert!(VaultKey::from_hex_seed("zz", "u").is_err());
        assert!(key_for("u").open(b"", "AAAA").is_err());
        assert_eq!(generate_seed_hex().len(), 64);
    }
}
