//! Ledger secrets
//!
//! Symmetric keys that protect private ledger content. Each rotation adds a
//! generation; private records remember the generation that encrypted them.
//!
//! ## Chain wrapping
//!
//! The sealable form of the secrets carries only the newest key in the clear
//! (inside the seal). Every older key is wrapped under its successor:
//!
//! ```text
//! key_n                          (sealed)
//! wrap(key_n,   key_{n-1})
//! wrap(key_n-1, key_{n-2})
//! ...
//! wrap(key_2,   key_1)
//! ```
//!
//! Unsealing the latest generation therefore recovers every historical key.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_core::{TesseraError, TesseraResult};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Associated data bound into every private payload.
const PRIVATE_PAYLOAD_AAD: &[u8] = b"tessera/private-payload/v1";

/// Associated data bound into every wrapped key.
const KEY_WRAP_AAD: &[u8] = b"tessera/key-wrap/v1";

/// 256-bit symmetric ledger key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct LedgerKey([u8; 32]);

impl LedgerKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.0).into())
    }
}

impl std::fmt::Debug for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LedgerKey(..)")
    }
}

/// Ciphertext of a private record payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Generation of the key that encrypted this payload
    pub generation: u64,
    /// 12-byte nonce for ChaCha20Poly1305
    pub nonce: [u8; 12],
    /// Ciphertext including the authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Encode for storage in a record payload.
    pub fn to_bytes(&self) -> TesseraResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from a record payload.
    pub fn from_bytes(bytes: &[u8]) -> TesseraResult<Self> {
        bincode::deserialize(bytes).map_err(|e| {
            TesseraError::ledger_corrupt(format!("undecodable private payload: {e}"))
        })
    }
}

/// A key encrypted under the key of the following generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Generation of the wrapped key
    pub generation: u64,
    /// 12-byte nonce for ChaCha20Poly1305
    pub nonce: [u8; 12],
    /// Encrypted key bytes
    pub ciphertext: Vec<u8>,
}

/// Plaintext placed inside a seal.
#[derive(Serialize, Deserialize)]
pub struct SealableSecrets {
    /// Newest generation
    pub generation: u64,
    /// Key of the newest generation
    pub current: LedgerKey,
    /// Older keys, newest first, each wrapped under its successor
    pub wrapped: Vec<WrappedKey>,
}

/// All known generations of ledger keys.
#[derive(Clone, PartialEq, Eq)]
pub struct LedgerSecrets {
    keys: BTreeMap<u64, LedgerKey>,
}

impl std::fmt::Debug for LedgerSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerSecrets")
            .field("generations", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LedgerSecrets {
    /// First generation of a brand-new service.
    pub fn generate() -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, LedgerKey::generate());
        Self { keys }
    }

    /// Build from explicit keys. Generations must be contiguous from 1.
    pub fn from_keys(keys: BTreeMap<u64, LedgerKey>) -> TesseraResult<Self> {
        if keys.is_empty() {
            return Err(TesseraError::invalid("ledger secrets need at least one key"));
        }
        for (position, generation) in keys.keys().enumerate() {
            if *generation != position as u64 + 1 {
                return Err(TesseraError::invalid(format!(
                    "ledger secret generations are not contiguous at {generation}"
                )));
            }
        }
        Ok(Self { keys })
    }

    /// Newest generation.
    pub fn current_generation(&self) -> u64 {
        self.keys.keys().next_back().copied().unwrap_or(0)
    }

    /// Whether a key for `generation` is held.
    pub fn has_generation(&self, generation: u64) -> bool {
        self.keys.contains_key(&generation)
    }

    /// Add a new generation and make it current. Returns the new generation.
    pub fn rotate(&mut self) -> u64 {
        let next = self.current_generation() + 1;
        self.keys.insert(next, LedgerKey::generate());
        tracing::info!(generation = next, "rotated ledger secrets");
        next
    }

    /// Encrypt a private payload under the current generation.
    pub fn encrypt(&self, plaintext: &[u8]) -> TesseraResult<EncryptedPayload> {
        let generation = self.current_generation();
        let key = self
            .keys
            .get(&generation)
            .ok_or_else(|| TesseraError::internal("ledger secrets hold no keys"))?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = key
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: PRIVATE_PAYLOAD_AAD,
                },
            )
            .map_err(|e| TesseraError::crypto(format!("encryption failed: {e}")))?;
        Ok(EncryptedPayload {
            generation,
            nonce: nonce.into(),
            ciphertext,
        })
    }

    /// Decrypt a private payload.
    ///
    /// Fails with `SecretsMismatch` when the generation is unknown or the
    /// key does not authenticate the ciphertext.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> TesseraResult<Vec<u8>> {
        let key = self.keys.get(&payload.generation).ok_or_else(|| {
            TesseraError::secrets_mismatch(format!(
                "no ledger key for generation {} (latest held: {})",
                payload.generation,
                self.current_generation()
            ))
        })?;
        key.cipher()
            .decrypt(
                Nonce::from_slice(&payload.nonce),
                Payload {
                    msg: &payload.ciphertext,
                    aad: PRIVATE_PAYLOAD_AAD,
                },
            )
            .map_err(|_| {
                TesseraError::secrets_mismatch(format!(
                    "ledger key for generation {} does not decrypt payload",
                    payload.generation
                ))
            })
    }

    /// Produce the chain-wrapped form that goes inside a seal.
    pub fn to_sealable(&self) -> TesseraResult<SealableSecrets> {
        let generation = self.current_generation();
        let current = self
            .keys
            .get(&generation)
            .cloned()
            .ok_or_else(|| TesseraError::internal("ledger secrets hold no keys"))?;

        let mut wrapped = Vec::with_capacity(self.keys.len().saturating_sub(1));
        for older in (1..generation).rev() {
            let (Some(wrapping), Some(key)) = (self.keys.get(&(older + 1)), self.keys.get(&older))
            else {
                return Err(TesseraError::internal(format!(
                    "missing ledger key while wrapping generation {older}"
                )));
            };
            let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
            let ciphertext = wrapping
                .cipher()
                .encrypt(
                    &nonce,
                    Payload {
                        msg: &key.0,
                        aad: KEY_WRAP_AAD,
                    },
                )
                .map_err(|e| TesseraError::crypto(format!("key wrap failed: {e}")))?;
            wrapped.push(WrappedKey {
                generation: older,
                nonce: nonce.into(),
                ciphertext,
            });
        }

        Ok(SealableSecrets {
            generation,
            current,
            wrapped,
        })
    }

    /// Unwind a chain-wrapped form back into every generation.
    pub fn from_sealable(sealable: SealableSecrets) -> TesseraResult<Self> {
        let mut keys = BTreeMap::new();
        let mut successor = sealable.current.clone();
        keys.insert(sealable.generation, sealable.current.clone());

        let mut expected = sealable.generation;
        for wrapped in &sealable.wrapped {
            expected = expected.checked_sub(1).ok_or_else(|| {
                TesseraError::secrets_mismatch("wrapped key chain longer than generation count")
            })?;
            if wrapped.generation != expected {
                return Err(TesseraError::secrets_mismatch(format!(
                    "wrapped key chain broken: expected generation {expected}, found {}",
                    wrapped.generation
                )));
            }
            let mut bytes = successor
                .cipher()
                .decrypt(
                    Nonce::from_slice(&wrapped.nonce),
                    Payload {
                        msg: &wrapped.ciphertext,
                        aad: KEY_WRAP_AAD,
                    },
                )
                .map_err(|_| {
                    TesseraError::secrets_mismatch(format!(
                        "cannot unwrap ledger key for generation {}",
                        wrapped.generation
                    ))
                })?;
            let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                TesseraError::secrets_mismatch("unwrapped ledger key has wrong length")
            })?;
            bytes.zeroize();
            let key = LedgerKey::from_bytes(raw);
            keys.insert(wrapped.generation, key.clone());
            successor = key;
        }

        if expected != 1 {
            return Err(TesseraError::secrets_mismatch(format!(
                "wrapped key chain stops at generation {expected}"
            )));
        }
        Ok(Self { keys })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn encrypt_decrypt_across_rotations() {
        let mut secrets = LedgerSecrets::generate();
        let first = secrets.encrypt(b"gen one").unwrap();
        secrets.rotate();
        secrets.rotate();
        let third = secrets.encrypt(b"gen three").unwrap();

        assert_eq!(first.generation, 1);
        assert_eq!(third.generation, 3);
        assert_eq!(secrets.decrypt(&first).unwrap(), b"gen one");
        assert_eq!(secrets.decrypt(&third).unwrap(), b"gen three");
    }

    #[test]
    fn chain_wrap_recovers_every_generation() {
        let mut secrets = LedgerSecrets::generate();
        let old = secrets.encrypt(b"old").unwrap();
        secrets.rotate();
        secrets.rotate();
        secrets.rotate();

        let restored = LedgerSecrets::from_sealable(secrets.to_sealable().unwrap()).unwrap();
        assert_eq!(restored, secrets);
        assert_eq!(restored.decrypt(&old).unwrap(), b"old");
    }

    #[test]
    fn stale_secrets_cannot_read_newer_generation() {
        let mut secrets = LedgerSecrets::generate();
        let stale = secrets.clone();
        secrets.rotate();
        let payload = secrets.encrypt(b"new").unwrap();
        assert_matches!(
            stale.decrypt(&payload),
            Err(TesseraError::SecretsMismatch { .. })
        );
    }

    #[test]
    fn foreign_key_does_not_decrypt() {
        let a = LedgerSecrets::generate();
        let b = LedgerSecrets::generate();
        let payload = a.encrypt(b"secret").unwrap();
        assert_matches!(b.decrypt(&payload), Err(TesseraError::SecretsMismatch { .. }));
    }

    #[test]
    fn truncated_chain_is_rejected() {
        let mut secrets = LedgerSecrets::generate();
        secrets.rotate();
        secrets.rotate();
        let mut sealable = secrets.to_sealable().unwrap();
        sealable.wrapped.pop();
        assert_matches!(
            LedgerSecrets::from_sealable(sealable),
            Err(TesseraError::SecretsMismatch { .. })
        );
    }

    #[test]
    fn from_keys_requires_contiguous_generations() {
        let mut keys = BTreeMap::new();
        keys.insert(1, LedgerKey::generate());
        keys.insert(3, LedgerKey::generate());
        assert!(LedgerSecrets::from_keys(keys).is_err());
    }
}
