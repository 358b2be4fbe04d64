//! Sealing effects
//!
//! Sealing binds secret material to a trust boundary: only an execution
//! context holding the same platform secret can open a sealed blob. The
//! recovery core never inspects blob contents; it hands blobs to
//! [`SealingEffects::unseal`] and gets plaintext or a typed failure back.
//!
//! # Effect Classification
//!
//! - **Category**: Infrastructure Effect
//! - **Implementation**: [`PlatformSealer`] (ChaCha20Poly1305 under an HKDF-derived key)
//! - **Usage**: node lifecycle (`apply_secrets`) and secrets export

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use tessera_core::{hash::Hash32, TesseraError, TesseraResult};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SEAL_INFO: &[u8] = b"tessera/seal/v1";
const SEAL_AAD: &[u8] = b"tessera/sealed-secrets/v1";
const NONCE_LEN: usize = 12;

/// Seal and unseal opaque blobs within a trust boundary.
#[async_trait]
pub trait SealingEffects: Send + Sync {
    /// Seal plaintext to this execution context.
    async fn seal(&self, plaintext: &[u8]) -> TesseraResult<Vec<u8>>;

    /// Open a blob sealed by a matching context.
    ///
    /// Returns `SecretsMismatch` if the blob was sealed elsewhere or tampered with.
    async fn unseal(&self, sealed: &[u8]) -> TesseraResult<Vec<u8>>;

    /// Stable fingerprint of the trust boundary, safe to log.
    fn boundary_id(&self) -> Hash32;
}

/// Software sealer keyed by a platform secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PlatformSealer {
    key: [u8; 32],
}

impl std::fmt::Debug for PlatformSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformSealer")
            .field("boundary", &self.boundary_id())
            .finish()
    }
}

impl PlatformSealer {
    /// Derive the sealing key from a platform secret.
    pub fn new(platform_secret: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(None, platform_secret);
        let mut key = [0u8; 32];
        // 32 bytes is always a valid HKDF-SHA256 output length
        if hk.expand(SEAL_INFO, &mut key).is_err() {
            key = tessera_core::hash::hash(platform_secret);
        }
        Self { key }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.key).into())
    }
}

#[async_trait]
impl SealingEffects for PlatformSealer {
    async fn seal(&self, plaintext: &[u8]) -> TesseraResult<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|e| TesseraError::crypto(format!("seal failed: {e}")))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    async fn unseal(&self, sealed: &[u8]) -> TesseraResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(TesseraError::secrets_mismatch("sealed blob is truncated"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| {
                TesseraError::secrets_mismatch(
                    "sealed blob cannot be opened in this execution context",
                )
            })
    }

    fn boundary_id(&self) -> Hash32 {
        let mut h = tessera_core::hash::hasher();
        h.update(b"tessera/boundary").update(&self.key);
        h.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn seal_roundtrip_within_boundary() {
        let sealer = PlatformSealer::new(b"platform-a");
        let blob = sealer.seal(b"ledger keys").await.unwrap();
        assert_ne!(&blob[NONCE_LEN..], b"ledger keys");
        assert_eq!(sealer.unseal(&blob).await.unwrap(), b"ledger keys");

        let same = PlatformSealer::new(b"platform-a");
        assert_eq!(same.boundary_id(), sealer.boundary_id());
        assert_eq!(same.unseal(&blob).await.unwrap(), b"ledger keys");
    }

    #[tokio::test]
    async fn other_boundary_cannot_unseal() {
        let blob = PlatformSealer::new(b"platform-a")
            .seal(b"ledger keys")
            .await
            .unwrap();
        let other = PlatformSealer::new(b"platform-b");
        assert_matches!(
            other.unseal(&blob).await,
            Err(TesseraError::SecretsMismatch { .. })
        );
        assert_matches!(
            other.unseal(&blob[..4]).await,
            Err(TesseraError::SecretsMismatch { .. })
        );
    }
}
