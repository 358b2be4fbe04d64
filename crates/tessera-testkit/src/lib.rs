//! Tessera Testing Infrastructure
//!
//! Common setup for recovery tests and the simulator: deterministic member
//! sets, a fast test configuration, a transaction generator that remembers
//! what it committed, and crash/recover helpers that drive a full recovery
//! the way an operator and the consortium would.
//!
//! # Usage
//!
//! ```rust,no_run
//! use tessera_testkit::*;
//!
//! # async fn run() -> tessera_core::TesseraResult<()> {
//! let mut scenario = RecoveryScenario::start(2, 3).await?;
//! scenario.issue(5, 5).await?;
//! scenario.crash_and_recover().await?;
//! scenario.verify().await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod fixtures;
pub mod scenario;
pub mod txs;

pub use fixtures::*;
pub use scenario::*;
pub use txs::*;
