//! Transaction records
//!
//! A record is immutable once it has an index. Indices are 1-based, gap-free
//! and shared by both visibility classes, so index order is the single
//! happened-before relation of the ledger.

use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_core::hash::{hasher, Hash32};

/// Whether a record is replicated in plaintext or encrypted under the ledger secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    /// Plaintext-replicated
    Public,
    /// Encrypted; legible only once ledger secrets are unsealed
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => f.write_str("public"),
            Visibility::Private => f.write_str("private"),
        }
    }
}

/// Which table a record belongs to.
///
/// `Nodes` and `Governance` are the reserved internal schema: they carry the
/// node table and governance activity as ordinary committed records, and are
/// always public.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordDomain {
    /// Opaque application payload
    Application,
    /// JSON-encoded `NodeRecord`
    Nodes,
    /// JSON-encoded `GovernanceRecord`
    Governance,
}

impl RecordDomain {
    /// Whether this domain belongs to the reserved internal schema.
    pub fn is_internal(self) -> bool {
        !matches!(self, RecordDomain::Application)
    }
}

/// A committed ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// 1-based position in the shared index space
    pub index: u64,
    /// Public or private
    pub visibility: Visibility,
    /// Table the payload belongs to
    pub domain: RecordDomain,
    /// Plaintext for public records, an encoded `EncryptedPayload` for private ones
    pub payload: Vec<u8>,
}

impl TransactionRecord {
    /// Construct a record at a known index.
    pub fn new(
        index: u64,
        visibility: Visibility,
        domain: RecordDomain,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            index,
            visibility,
            domain,
            payload: payload.into(),
        }
    }

    /// Shorthand for a public application record.
    pub fn public(index: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(index, Visibility::Public, RecordDomain::Application, payload)
    }

    /// Whether this record is public.
    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    /// Whether this record is private.
    pub fn is_private(&self) -> bool {
        self.visibility == Visibility::Private
    }

    /// Extend a hash chain with this record.
    ///
    /// `link_n = H(link_{n-1} || index || visibility || domain || payload)`.
    /// Two logs with the same tip digest hold the same records in the same order.
    pub fn chain_digest(&self, previous: &Hash32) -> Hash32 {
        let mut h = hasher();
        h.update(previous.as_bytes())
            .update(&self.index.to_le_bytes())
            .update(&[self.visibility as u8, self.domain as u8])
            .update(&(self.payload.len() as u64).to_le_bytes())
            .update(&self.payload);
        h.finalize()
    }
}

/// A transaction awaiting an index from the consensus layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Public or private
    pub visibility: Visibility,
    /// Table the payload belongs to
    pub domain: RecordDomain,
    /// Payload, already encrypted if private
    pub payload: Vec<u8>,
}

impl PendingTransaction {
    /// Public transaction in the given domain.
    pub fn public(domain: RecordDomain, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            visibility: Visibility::Public,
            domain,
            payload: payload.into(),
        }
    }

    /// Private application transaction carrying an encrypted payload.
    pub fn private(encrypted: impl Into<Vec<u8>>) -> Self {
        Self {
            visibility: Visibility::Private,
            domain: RecordDomain::Application,
            payload: encrypted.into(),
        }
    }

    /// Assign an index, producing a committed record.
    pub fn at_index(self, index: u64) -> TransactionRecord {
        TransactionRecord {
            index,
            visibility: self.visibility,
            domain: self.domain,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_digest_depends_on_every_field() {
        let base = TransactionRecord::public(1, b"a".to_vec());
        let link = base.chain_digest(&Hash32::ZERO);

        let mut other = base.clone();
        other.index = 2;
        assert_ne!(other.chain_digest(&Hash32::ZERO), link);

        let mut other = base.clone();
        other.visibility = Visibility::Private;
        assert_ne!(other.chain_digest(&Hash32::ZERO), link);

        let mut other = base.clone();
        other.domain = RecordDomain::Governance;
        assert_ne!(other.chain_digest(&Hash32::ZERO), link);

        assert_ne!(base.chain_digest(&link), link);
    }

    #[test]
    fn pending_keeps_tags() {
        let record = PendingTransaction::private(vec![9u8; 4]).at_index(7);
        assert_eq!(record.index, 7);
        assert!(record.is_private());
        assert_eq!(record.domain, RecordDomain::Application);
        assert!(RecordDomain::Nodes.is_internal());
    }
}
