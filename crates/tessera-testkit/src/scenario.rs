//! Crash and recover helpers
//!
//! A simulated crash exports the ledger and the sealed secrets of a running
//! cluster and drops it. Recovery then goes through the coordinator exactly
//! as an operator would: replay, public sync, an `AcceptRecovery` proposal
//! and member votes until the service reopens.

use crate::fixtures::{test_config, test_environment, test_members};
use crate::txs::Txs;
use std::sync::Arc;
use tessera_core::{MemberId, ProposalId, RecoveryConfig, TesseraError, TesseraResult};
use tessera_ledger::{LedgerSnapshot, SecretsBundle, SecretsVault};
use tessera_recovery::{
    Cluster, ClusterEnvironment, ClusterPhase, InProcessEnvironment, RecoveryCoordinator,
    RecoveryHistory,
};

/// What survives a crash.
#[derive(Debug, Clone)]
pub struct Crashed {
    /// Exported ledger
    pub ledger: LedgerSnapshot,
    /// Exported sealed secrets
    pub vault: SecretsVault,
}

impl Crashed {
    /// Newest sealed bundle.
    pub fn latest_bundle(&self) -> TesseraResult<SecretsBundle> {
        self.vault
            .latest()
            .cloned()
            .ok_or_else(|| TesseraError::not_found("crashed service exported no secrets"))
    }
}

/// Export everything durable and drop the cluster.
pub fn crash(cluster: Cluster) -> TesseraResult<Crashed> {
    let crashed = Crashed {
        ledger: cluster.export_ledger()?,
        vault: cluster.export_sealed_secrets(),
    };
    tracing::info!(
        records = crashed.ledger.len(),
        generations = crashed.vault.len(),
        "cluster crashed"
    );
    drop(cluster);
    Ok(crashed)
}

/// Propose `bundle` with the first member and have members accept in id
/// order until the service reopens.
pub async fn approve_recovery(
    coordinator: &mut RecoveryCoordinator,
    bundle: SecretsBundle,
) -> TesseraResult<ProposalId> {
    let members: Vec<MemberId> = coordinator
        .cluster()
        .ok_or_else(|| TesseraError::invalid_transition(coordinator.phase(), "approve_recovery"))?
        .governance()
        .members()
        .map(|m| m.id)
        .collect();
    let proposer = *members
        .first()
        .ok_or_else(|| TesseraError::recovery_failed("no members to approve recovery"))?;
    let proposal = coordinator.submit_accept_recovery(proposer, bundle).await?;
    for member in members {
        if coordinator.phase() == ClusterPhase::FullyOpen {
            break;
        }
        coordinator.vote(member, proposal, true).await?;
    }
    Ok(proposal)
}

/// Recover `crashed` onto `node_count` new nodes with the latest bundle.
pub async fn recover(
    env: Arc<dyn ClusterEnvironment>,
    config: RecoveryConfig,
    crashed: &Crashed,
    node_count: usize,
    history: RecoveryHistory,
    offset: u64,
) -> TesseraResult<(Cluster, RecoveryHistory)> {
    let mut coordinator = RecoveryCoordinator::new(config, env)
        .with_history(history)
        .with_vault(crashed.vault.clone());
    coordinator
        .begin_recovery_with_offset(crashed.ledger.clone(), node_count, offset)
        .await?;
    coordinator.await_public_sync().await?;
    approve_recovery(&mut coordinator, crashed.latest_bundle()?).await?;
    let history = coordinator.history().clone();
    Ok((coordinator.into_cluster()?, history))
}

/// Repeated crash/recover cycles over one growing transaction set.
#[derive(Debug)]
pub struct RecoveryScenario {
    env: Arc<InProcessEnvironment>,
    config: RecoveryConfig,
    node_count: usize,
    cluster: Option<Cluster>,
    txs: Txs,
    history: RecoveryHistory,
}

impl RecoveryScenario {
    /// Start a fresh service with the test configuration.
    pub async fn start(node_count: usize, member_count: usize) -> TesseraResult<Self> {
        Self::start_with_config(node_count, member_count, test_config()).await
    }

    /// Start a fresh service with an explicit configuration.
    pub async fn start_with_config(
        node_count: usize,
        member_count: usize,
        config: RecoveryConfig,
    ) -> TesseraResult<Self> {
        let env = test_environment();
        let cluster = Cluster::start_fresh(
            env.as_ref(),
            config.clone(),
            test_members(member_count),
            node_count,
        )
        .await?;
        Ok(Self {
            env,
            config,
            node_count,
            cluster: Some(cluster),
            txs: Txs::new(),
            history: RecoveryHistory::new(),
        })
    }

    /// The running cluster.
    pub fn cluster(&self) -> TesseraResult<&Cluster> {
        self.cluster
            .as_ref()
            .ok_or_else(|| TesseraError::not_serving("service", "cluster is down"))
    }

    /// Mutable access to the running cluster.
    pub fn cluster_mut(&mut self) -> TesseraResult<&mut Cluster> {
        self.cluster
            .as_mut()
            .ok_or_else(|| TesseraError::not_serving("service", "cluster is down"))
    }

    /// Issue a batch of transactions on the running cluster.
    pub async fn issue(&mut self, public: usize, private: usize) -> TesseraResult<()> {
        let cluster = self
            .cluster
            .as_ref()
            .ok_or_else(|| TesseraError::not_serving("service", "cluster is down"))?;
        self.txs.issue(cluster, public, private).await
    }

    /// Crash the running cluster and keep what survives.
    pub fn crash(&mut self) -> TesseraResult<Crashed> {
        let cluster = self
            .cluster
            .take()
            .ok_or_else(|| TesseraError::not_serving("service", "cluster is already down"))?;
        crash(cluster)
    }

    /// Crash, then recover onto new nodes, expecting every issued transaction.
    pub async fn crash_and_recover(&mut self) -> TesseraResult<()> {
        let crashed = self.crash()?;
        self.recover_from(&crashed).await
    }

    /// Recover from an earlier crash.
    pub async fn recover_from(&mut self, crashed: &Crashed) -> TesseraResult<()> {
        let (cluster, history) = recover(
            self.env.clone(),
            self.config.clone(),
            crashed,
            self.node_count,
            self.history.clone(),
            self.txs.highest_index(),
        )
        .await?;
        self.cluster = Some(cluster);
        self.history = history;
        Ok(())
    }

    /// Check the running cluster against every transaction ever issued.
    pub async fn verify(&self) -> TesseraResult<()> {
        self.cluster()?.check_for_service()?;
        self.txs.verify(self.cluster()?).await
    }

    /// Issued transactions.
    pub fn txs(&self) -> &Txs {
        &self.txs
    }

    /// Completed recoveries.
    pub fn history(&self) -> &RecoveryHistory {
        &self.history
    }

    /// Environment the nodes run in.
    pub fn environment(&self) -> Arc<InProcessEnvironment> {
        self.env.clone()
    }

    /// Configuration in use.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }
}
