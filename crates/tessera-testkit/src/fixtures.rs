//! Deterministic fixtures.

use std::sync::Arc;
use tessera_core::{hash, MemberId, RecoveryConfig, TesseraResult};
use tessera_ledger::Member;
use tessera_recovery::{Cluster, InProcessEnvironment};

/// Platform secret shared by every in-process test node.
pub const TEST_PLATFORM_SECRET: &[u8] = b"tessera-testkit-platform";

/// `count` members with ids `0..count` and deterministic public keys.
pub fn test_members(count: usize) -> Vec<Member> {
    (0..count as u64)
        .map(|i| {
            let key = hash::hash(format!("member-key-{i}").as_bytes());
            Member::new(MemberId::new(i), key.to_vec())
        })
        .collect()
}

/// Configuration with short barrier deadlines and frequent yields.
pub fn test_config() -> RecoveryConfig {
    RecoveryConfig {
        public_sync_timeout_ms: 5_000,
        apply_secrets_timeout_ms: 5_000,
        replay_yield_interval: 4,
        ..RecoveryConfig::default()
    }
}

/// In-process environment on the shared test platform secret.
pub fn test_environment() -> Arc<InProcessEnvironment> {
    Arc::new(InProcessEnvironment::new(TEST_PLATFORM_SECRET))
}

/// Freshly started, fully open cluster.
pub async fn fresh_cluster(nodes: usize, members: usize) -> TesseraResult<Cluster> {
    Cluster::start_fresh(
        test_environment().as_ref(),
        test_config(),
        test_members(members),
        nodes,
    )
    .await
}
