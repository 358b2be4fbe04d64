//! # Tessera Ledger - Records and Secrets
//!
//! Durable inputs of a recovery: the ledger (an ordered sequence of committed
//! transaction records) and the sealed ledger secrets that protect its
//! private records.
//!
//! ## Architecture
//!
//! - **record**: `TransactionRecord`, visibility and domain tags, hash chaining
//! - **snapshot**: `LedgerSnapshot` with prefix-completeness validation and file export/import
//! - **schema**: reserved internal schema for node and governance tables
//! - **secrets**: generational ledger keys, chain wrapping, payload encryption
//! - **sealing**: `SealingEffects` trust-boundary interface and the platform sealer
//! - **vault**: `SecretsBundle` and the append-only `SecretsVault`

#![forbid(unsafe_code)]

pub mod record;
pub mod schema;
pub mod sealing;
pub mod secrets;
pub mod snapshot;
pub mod vault;

pub use record::{PendingTransaction, RecordDomain, TransactionRecord, Visibility};
pub use schema::{
    GovernanceRecord, Member, NodeRecord, NodeStatus, ProposalKind, ProposalOutcome,
    PublicTables,
};
pub use sealing::{PlatformSealer, SealingEffects};
pub use secrets::{EncryptedPayload, LedgerKey, LedgerSecrets};
pub use snapshot::LedgerSnapshot;
pub use vault::{SecretsBundle, SecretsVault};
