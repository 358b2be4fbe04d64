//! # Tessera Recovery - Catastrophic Crash Recovery
//!
//! Reconstructs a fully operational cluster from the durable ledger and the
//! sealed ledger secrets of a cluster that no longer exists, keeping private
//! state sealed until a quorum of members authorizes its release.
//!
//! ## Architecture
//!
//! - **lifecycle**: per-node state machine (`Uninitialized` → `PublicActive` → `FullyActive`)
//! - **cluster**: a running service instance and its `Opening → PublicOnly → FullyOpen` phase
//! - **coordinator**: cluster-level recovery orchestration with bounded barriers
//! - **history**: completed recoveries, for regression checks across attempts
//! - **environment**: node bring-up effects
//!
//! ## What Belongs Here
//!
//! - Recovery protocol and node lifecycle transitions
//! - Fan-out/fan-in barriers over nodes
//! - Node table updates committed during recovery
//!
//! ## What Does NOT Belong Here
//!
//! - Agreement on order (tessera-consensus)
//! - Threshold arithmetic (tessera-governance)
//! - Record formats, ledger secrets and sealing (tessera-ledger)
//!
//! ## Design Principles
//!
//! - Every transition function is safe to call more than once
//! - Partial success is never reported as success
//! - Node and member tables are ledger records, never side state

#![forbid(unsafe_code)]

pub mod cluster;
pub mod coordinator;
pub mod environment;
pub mod history;
pub mod lifecycle;

pub use cluster::{Cluster, ClusterPhase, ClusterStatus};
pub use coordinator::{PublicSync, RecoveryCoordinator};
pub use environment::{ClusterEnvironment, InProcessEnvironment, NodeResources};
pub use history::{fingerprint, RecoveryAttempt, RecoveryHistory, VisibleSet};
pub use lifecycle::{LifecycleController, NodeHandle, NodeState};
