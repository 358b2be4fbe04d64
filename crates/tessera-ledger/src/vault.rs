//! Secrets Vault
//!
//! Append-only store of sealed secrets bundles, one per ledger secrets
//! generation. Bundles are immutable values: the vault only ever appends a
//! strictly newer generation, so a bundle can be handed to any number of
//! nodes without coordination.

use crate::sealing::SealingEffects;
use crate::secrets::{LedgerSecrets, SealableSecrets};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tessera_core::{TesseraError, TesseraResult};

/// Sealed ledger secrets of one generation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsBundle {
    /// Ledger secrets generation sealed inside
    pub generation: u64,
    /// Opaque sealed blob
    #[serde(with = "hex_blob")]
    pub sealed_blob: Vec<u8>,
}

impl std::fmt::Debug for SecretsBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsBundle")
            .field("generation", &self.generation)
            .field("sealed_len", &self.sealed_blob.len())
            .finish()
    }
}

impl SecretsBundle {
    /// Seal ledger secrets into a bundle at their current generation.
    pub async fn seal<S: SealingEffects + ?Sized>(
        sealer: &S,
        secrets: &LedgerSecrets,
    ) -> TesseraResult<Self> {
        let sealable = secrets.to_sealable()?;
        let generation = sealable.generation;
        let plaintext = bincode::serialize(&sealable)?;
        let sealed_blob = sealer.seal(&plaintext).await?;
        tracing::debug!(generation, "sealed ledger secrets");
        Ok(Self {
            generation,
            sealed_blob,
        })
    }

    /// Unseal the bundle back into ledger secrets.
    ///
    /// Fails with `SecretsMismatch` if the blob cannot be opened, or if the
    /// sealed generation disagrees with the bundle's label.
    pub async fn unseal<S: SealingEffects + ?Sized>(
        &self,
        sealer: &S,
    ) -> TesseraResult<LedgerSecrets> {
        let plaintext = sealer.unseal(&self.sealed_blob).await?;
        let sealable: SealableSecrets = bincode::deserialize(&plaintext)
            .map_err(|e| TesseraError::secrets_mismatch(format!("unsealed blob is malformed: {e}")))?;
        if sealable.generation != self.generation {
            return Err(TesseraError::secrets_mismatch(format!(
                "bundle labelled generation {} seals generation {}",
                self.generation, sealable.generation
            )));
        }
        LedgerSecrets::from_sealable(sealable)
    }
}

/// Append-only history of sealed bundles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsVault {
    bundles: Vec<SecretsBundle>,
}

impl SecretsVault {
    /// Empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bundle. Generations must strictly increase.
    pub fn push(&mut self, bundle: SecretsBundle) -> TesseraResult<()> {
        if let Some(latest) = self.latest() {
            if bundle.generation <= latest.generation {
                return Err(TesseraError::invalid(format!(
                    "secrets generation {} is not newer than {}",
                    bundle.generation, latest.generation
                )));
            }
        }
        self.bundles.push(bundle);
        Ok(())
    }

    /// Newest bundle.
    pub fn latest(&self) -> Option<&SecretsBundle> {
        self.bundles.last()
    }

    /// Bundle for an exact generation.
    pub fn get(&self, generation: u64) -> Option<&SecretsBundle> {
        self.bundles.iter().find(|b| b.generation == generation)
    }

    /// Bundles strictly newer than `generation`, oldest first.
    pub fn newer_than(&self, generation: u64) -> impl Iterator<Item = &SecretsBundle> {
        self.bundles
            .iter()
            .filter(move |b| b.generation > generation)
    }

    /// All bundles, oldest first.
    pub fn bundles(&self) -> &[SecretsBundle] {
        &self.bundles
    }

    /// Number of generations held.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Whether no bundle is held.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Write the vault as JSON.
    pub fn write_to_file(&self, path: &Path) -> TesseraResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a vault written by [`SecretsVault::write_to_file`].
    pub fn read_from_file(path: &Path) -> TesseraResult<Self> {
        let bytes = std::fs::read(path)?;
        let loaded: SecretsVault = serde_json::from_slice(&bytes)?;
        // Re-append to enforce monotonic generations on untrusted input.
        let mut vault = SecretsVault::new();
        for bundle in loaded.bundles {
            vault.push(bundle)?;
        }
        Ok(vault)
    }
}

mod hex_blob {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
