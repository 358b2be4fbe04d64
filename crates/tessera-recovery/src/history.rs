//! Recovery history
//!
//! Record of every completed recovery attempt: its offset, the secrets
//! generation it applied and a fingerprint of each application transaction
//! it exposed. Later attempts are checked against all earlier ones, not only
//! the most recent, and the history can be kept in a JSON file so the check
//! survives process restarts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tessera_core::{Hash32, TesseraError, TesseraResult};

/// Index to payload fingerprint of every visible application transaction.
pub type VisibleSet = BTreeMap<u64, Hash32>;

/// Fingerprint a set of plaintext payloads.
pub fn fingerprint(transactions: &BTreeMap<u64, Vec<u8>>) -> VisibleSet {
    transactions
        .iter()
        .map(|(index, payload)| (*index, Hash32::of(payload)))
        .collect()
}

/// One completed recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    /// Highest index the attempt was required to expose
    pub offset: u64,
    /// Secrets generation applied
    pub generation: u64,
    /// Committed index when the service reopened
    pub committed_index: u64,
    /// Application transactions the recovered cluster exposed
    pub visible: VisibleSet,
}

/// Completed attempts, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryHistory {
    attempts: Vec<RecoveryAttempt>,
}

impl RecoveryHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file is an empty history.
    pub fn load(path: &Path) -> TesseraResult<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to `path` as JSON.
    pub fn save(&self, path: &Path) -> TesseraResult<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Completed attempts, oldest first.
    pub fn attempts(&self) -> &[RecoveryAttempt] {
        &self.attempts
    }

    /// Number of completed attempts.
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Whether no attempt has completed.
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Highest secrets generation any attempt applied.
    pub fn highest_generation(&self) -> Option<u64> {
        self.attempts.iter().map(|a| a.generation).max()
    }

    /// Reject a bundle generationally older than one already applied.
    pub fn check_generation(&self, generation: u64) -> TesseraResult<()> {
        match self.highest_generation() {
            Some(highest) if generation < highest => Err(TesseraError::secrets_mismatch(format!(
                "bundle generation {generation} is older than generation {highest} applied by an earlier recovery"
            ))),
            _ => Ok(()),
        }
    }

    /// Check that `visible` contains every transaction of every earlier
    /// attempt with an unchanged payload.
    pub fn check_superset(&self, visible: &VisibleSet) -> TesseraResult<()> {
        for (number, attempt) in self.attempts.iter().enumerate() {
            for (index, digest) in &attempt.visible {
                match visible.get(index) {
                    None => {
                        return Err(TesseraError::recovery_failed(format!(
                            "transaction {index} exposed by recovery {} is missing",
                            number + 1
                        )))
                    }
                    Some(found) if found != digest => {
                        return Err(TesseraError::recovery_failed(format!(
                            "transaction {index} changed since recovery {}",
                            number + 1
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Append a completed attempt.
    pub fn record(&mut self, attempt: RecoveryAttempt) {
        tracing::info!(
            attempt = self.attempts.len() + 1,
            offset = attempt.offset,
            generation = attempt.generation,
            visible = attempt.visible.len(),
            "recovery recorded"
        );
        self.attempts.push(attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn visible(entries: &[(u64, &str)]) -> VisibleSet {
        let payloads: BTreeMap<u64, Vec<u8>> = entries
            .iter()
            .map(|(i, p)| (*i, p.as_bytes().to_vec()))
            .collect();
        fingerprint(&payloads)
    }

    fn attempt(generation: u64, entries: &[(u64, &str)]) -> RecoveryAttempt {
        RecoveryAttempt {
            offset: entries.iter().map(|(i, _)| *i).max().unwrap_or(0),
            generation,
            committed_index: 0,
            visible: visible(entries),
        }
    }

    #[test]
    fn superset_is_checked_against_every_attempt() {
        let mut history = RecoveryHistory::new();
        history.record(attempt(1, &[(1, "a"), (2, "b")]));
        history.record(attempt(1, &[(3, "c")]));

        history
            .check_superset(&visible(&[(1, "a"), (2, "b"), (3, "c"), (4, "d")]))
            .unwrap();
        // Dropping an index from the first attempt is caught even though the
        // latest attempt is satisfied.
        assert_matches!(
            history.check_superset(&visible(&[(2, "b"), (3, "c")])),
            Err(TesseraError::RecoveryFailed { .. })
        );
        assert_matches!(
            history.check_superset(&visible(&[(1, "a"), (2, "B"), (3, "c")])),
            Err(TesseraError::RecoveryFailed { .. })
        );
    }

    #[test]
    fn older_generation_is_a_mismatch() {
        let mut history = RecoveryHistory::new();
        history.check_generation(1).unwrap();
        history.record(attempt(3, &[]));
        history.check_generation(3).unwrap();
        history.check_generation(4).unwrap();
        assert_matches!(
            history.check_generation(2),
            Err(TesseraError::SecretsMismatch { .. })
        );
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        assert!(RecoveryHistory::load(&path).unwrap().is_empty());

        let mut history = RecoveryHistory::new();
        history.record(attempt(2, &[(1, "a"), (5, "e")]));
        history.save(&path).unwrap();
        assert_eq!(RecoveryHistory::load(&path).unwrap(), history);
    }
}
