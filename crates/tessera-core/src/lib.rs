//! # Tessera Core - Foundation Layer
//!
//! Shared vocabulary for the Tessera replicated ledger: identifiers, the
//! unified error taxonomy, hashing and recovery configuration.
//!
//! ## What Belongs Here
//!
//! - Identifier newtypes (`NodeId`, `MemberId`, `ProposalId`)
//! - `TesseraError` and the `TesseraResult` alias
//! - The single hash algorithm declaration
//! - `RecoveryConfig`
//!
//! ## What Does NOT Belong Here
//!
//! - Ledger records and secrets (tessera-ledger)
//! - Replication (tessera-consensus)
//! - Voting (tessera-governance)
//! - Node lifecycle and recovery orchestration (tessera-recovery)

#![forbid(unsafe_code)]

/// Recovery configuration
pub mod config;

/// Unified error type
pub mod errors;

/// Hashing
pub mod hash;

/// Identifier newtypes
pub mod identifiers;

pub use config::RecoveryConfig;
pub use errors::{TesseraError, TesseraResult};
pub use hash::Hash32;
pub use identifiers::{MemberId, NodeId, ProposalId};
