//! Ledger snapshots exported from a terminated cluster.
//!
//! A snapshot is consumed read-only by a recovering cluster. It must be
//! prefix-complete: record `i` sits at position `i - 1` for every record.
//! [`LedgerSnapshot::validate`] is the only gate; callers must not replay an
//! unvalidated snapshot.

use crate::record::{TransactionRecord, Visibility};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tessera_core::{Hash32, TesseraError, TesseraResult};

/// Magic prefix of the on-disk ledger format.
const LEDGER_FILE_MAGIC: &[u8; 8] = b"TSRLEDG1";

/// Ordered sequence of committed records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    records: Vec<TransactionRecord>,
}

impl LedgerSnapshot {
    /// Wrap records without validating them.
    pub fn new(records: Vec<TransactionRecord>) -> Self {
        Self { records }
    }

    /// Wrap records, rejecting anything that is not prefix-complete.
    pub fn from_records(records: Vec<TransactionRecord>) -> TesseraResult<Self> {
        let snapshot = Self { records };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Check prefix-completeness: indices start at 1 and increase by exactly one.
    pub fn validate(&self) -> TesseraResult<()> {
        for (position, record) in self.records.iter().enumerate() {
            let expected = position as u64 + 1;
            if record.index == expected {
                continue;
            }
            let message = if record.index > expected {
                format!(
                    "gap in ledger: expected index {expected}, found {}",
                    record.index
                )
            } else {
                format!(
                    "out-of-order record: index {} found at position {expected}",
                    record.index
                )
            };
            return Err(TesseraError::ledger_corrupt(message));
        }
        Ok(())
    }

    /// Records in index order.
    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    /// Highest index in the snapshot (0 if empty).
    pub fn max_index(&self) -> u64 {
        self.records.last().map(|r| r.index).unwrap_or(0)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at a 1-based index.
    pub fn get(&self, index: u64) -> Option<&TransactionRecord> {
        let position = usize::try_from(index.checked_sub(1)?).ok()?;
        self.records.get(position)
    }

    /// Count of records with the given visibility.
    pub fn count(&self, visibility: Visibility) -> usize {
        self.records
            .iter()
            .filter(|r| r.visibility == visibility)
            .count()
    }

    /// Tip of the record hash chain.
    pub fn digest(&self) -> Hash32 {
        self.records
            .iter()
            .fold(Hash32::ZERO, |link, record| record.chain_digest(&link))
    }

    /// Serialize to the on-disk format.
    pub fn to_bytes(&self) -> TesseraResult<Vec<u8>> {
        let mut bytes = LEDGER_FILE_MAGIC.to_vec();
        bincode::serialize_into(&mut bytes, &self.records)?;
        Ok(bytes)
    }

    /// Parse and validate the on-disk format.
    pub fn from_bytes(bytes: &[u8]) -> TesseraResult<Self> {
        let body = bytes
            .strip_prefix(LEDGER_FILE_MAGIC.as_slice())
            .ok_or_else(|| TesseraError::ledger_corrupt("missing ledger file header"))?;
        let records: Vec<TransactionRecord> = bincode::deserialize(body)
            .map_err(|e| TesseraError::ledger_corrupt(format!("undecodable ledger: {e}")))?;
        Self::from_records(records)
    }

    /// Write the snapshot to a file.
    pub fn write_to_file(&self, path: &Path) -> TesseraResult<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        std::io::Write::write_all(&mut writer, LEDGER_FILE_MAGIC)?;
        bincode::serialize_into(&mut writer, &self.records)?;
        std::io::Write::flush(&mut writer)?;
        tracing::debug!(
            path = %path.display(),
            records = self.records.len(),
            "wrote ledger snapshot"
        );
        Ok(())
    }

    /// Read and validate a snapshot from a file.
    pub fn read_from_file(path: &Path) -> TesseraResult<Self> {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 8];
        std::io::Read::read_exact(&mut reader, &mut magic)
            .map_err(|_| TesseraError::ledger_corrupt("truncated ledger file header"))?;
        if &magic != LEDGER_FILE_MAGIC {
            return Err(TesseraError::ledger_corrupt("missing ledger file header"));
        }
        let records: Vec<TransactionRecord> = bincode::deserialize_from(reader)
            .map_err(|e| TesseraError::ledger_corrupt(format!("undecodable ledger: {e}")))?;
        Self::from_records(records)
    }
}

impl FromIterator<TransactionRecord> for LedgerSnapshot {
    fn from_iter<T: IntoIterator<Item = TransactionRecord>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
