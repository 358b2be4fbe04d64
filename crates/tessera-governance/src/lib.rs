//! # Tessera Governance - Threshold Voting
//!
//! Generic threshold voting over a fixed member set, used by the recovery
//! coordinator for the `AcceptRecovery` proposal.
//!
//! ## Rules
//!
//! - One ballot per member per proposal
//! - `Completed` the instant accepts reach `ceil((M + 1) / 2)`
//! - `Rejected` only once completion is mathematically unreachable
//! - Decisions are one-shot; ballots after a decision are refused
//! - At most one identical pending proposal of a one-shot kind
//!
//! Proposals and ballots are committed to the ledger as governance records;
//! the engine returns them and leaves committing to the caller.

#![forbid(unsafe_code)]

pub mod engine;
pub mod proposal;

pub use engine::{ProposalReceipt, QuorumEngine, VoteReceipt};
pub use proposal::{quorum_threshold, Ballot, Proposal};
