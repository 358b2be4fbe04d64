//! # Tessera Consensus - Replication Adapter
//!
//! The recovery core treats agreement as a black box with
//! "submit / committed index / subscribe" semantics. This crate defines that
//! interface and an in-process implementation used by clusters and tests.
//!
//! ## Architecture
//!
//! - **replica**: `ReplicaLog`, one node's committed log, and `MemoryReplica`
//! - **adapter**: `ConsensusAdapter` and the leader-ordered `ReplicatedLog`
//!
//! ## Protocol Notes
//!
//! - Indices are assigned once, by the leader, and shared by public and private records
//! - A record is committed when a strict majority of replicas has appended it
//! - Commit sync is the point where every replica reports the same index and digest

#![forbid(unsafe_code)]

pub mod adapter;
pub mod replica;

pub use adapter::{replica_quorum, ConsensusAdapter, ReplicatedLog};
pub use replica::{MemoryReplica, ReplicaLog};
