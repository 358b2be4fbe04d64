//! Recovery Coordinator
//!
//! Forms a new cluster from the ledger and sealed secrets of a defunct one.
//!
//! ## Flow
//!
//! 1. [`begin_recovery`](RecoveryCoordinator::begin_recovery): validate the
//!    snapshot, start `node_count` nodes, replay it on each concurrently
//! 2. [`await_public_sync`](RecoveryCoordinator::await_public_sync): fan-in
//!    barrier; evict divergent replicas, rebuild the node and member tables
//!    from the ledger, retire the old nodes, trust the new ones (`PublicOnly`)
//! 3. [`submit_accept_recovery`](RecoveryCoordinator::submit_accept_recovery)
//!    and [`vote`](RecoveryCoordinator::vote): members authorize releasing
//!    the secrets
//! 4. [`on_quorum_reached`](RecoveryCoordinator::on_quorum_reached): fan-out
//!    `apply_secrets`, retry unseal failures with newer generations, verify
//!    the exposed transactions against every earlier recovery (`FullyOpen`)
//!
//! Both barriers are bounded by [`RecoveryConfig`] deadlines. The only
//! success outcome is `FullyOpen`; anything short of it is a typed error and
//! intermediate phases are visible through status queries alone. A failure
//! inside either barrier discards the attempt, after which `begin_recovery`
//! can be called again on the same coordinator.

use crate::cluster::{Cluster, ClusterPhase};
use crate::environment::ClusterEnvironment;
use crate::history::{fingerprint, RecoveryAttempt, RecoveryHistory, VisibleSet};
use crate::lifecycle::{LifecycleController, NodeHandle, NodeState};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tessera_consensus::{ConsensusAdapter, ReplicaLog};
use tessera_core::{Hash32, MemberId, NodeId, ProposalId, RecoveryConfig, TesseraError, TesseraResult};
use tessera_governance::{QuorumEngine, VoteReceipt};
use tessera_ledger::{
    GovernanceRecord, LedgerSnapshot, NodeRecord, NodeStatus, ProposalKind, ProposalOutcome, PublicTables,
    SecretsBundle, SecretsVault,
};
use tokio::task::{AbortHandle, JoinHandle};

/// Outcome of the public sync barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicSync {
    /// Committed index every replica agrees on
    pub committed_index: u64,
    /// Hash-chain tip every replica agrees on
    pub digest: Hash32,
    /// Nodes that joined the recovered cluster
    pub nodes: Vec<NodeId>,
    /// Nodes evicted for failing or diverging during replay
    pub evicted: Vec<NodeId>,
}

struct StartedNode {
    handle: NodeHandle,
    replica: Arc<dyn ReplicaLog>,
}

struct Attempt {
    offset: u64,
    snapshot: Arc<LedgerSnapshot>,
    tables: PublicTables,
    started: BTreeMap<NodeId, StartedNode>,
    replays: Vec<(NodeId, JoinHandle<TesseraResult<NodeState>>)>,
    cluster: Cluster,
    public_sync: Option<PublicSync>,
}

/// Orchestrates one recovery attempt at a time.
pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    env: Arc<dyn ClusterEnvironment>,
    history: RecoveryHistory,
    history_path: Option<PathBuf>,
    vault: SecretsVault,
    attempt: Option<Attempt>,
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("phase", &self.phase())
            .field("completed_recoveries", &self.history.len())
            .field("vault_generations", &self.vault.len())
            .finish()
    }
}

impl RecoveryCoordinator {
    /// Coordinator with an empty history and no fallback bundles.
    pub fn new(config: RecoveryConfig, env: Arc<dyn ClusterEnvironment>) -> Self {
        Self {
            config,
            env,
            history: RecoveryHistory::new(),
            history_path: None,
            vault: SecretsVault::new(),
            attempt: None,
        }
    }

    /// Check against the given earlier recoveries.
    pub fn with_history(mut self, history: RecoveryHistory) -> Self {
        self.history = history;
        self
    }

    /// Load earlier recoveries from `path` and save there after completion.
    pub fn with_history_file(mut self, path: impl Into<PathBuf>) -> TesseraResult<Self> {
        let path = path.into();
        self.history = RecoveryHistory::load(&path)?;
        self.history_path = Some(path);
        Ok(self)
    }

    /// Sealed bundles available for unseal retries with newer generations.
    pub fn with_vault(mut self, vault: SecretsVault) -> Self {
        self.vault = vault;
        self
    }

    /// Completed recoveries, including this one once it succeeds.
    pub fn history(&self) -> &RecoveryHistory {
        &self.history
    }

    /// Phase of the cluster under recovery.
    pub fn phase(&self) -> ClusterPhase {
        self.attempt
            .as_ref()
            .map_or(ClusterPhase::Opening, |a| a.cluster.phase())
    }

    /// The cluster under recovery, once public sync has assembled it.
    pub fn cluster(&self) -> Option<&Cluster> {
        self.attempt
            .as_ref()
            .filter(|a| a.public_sync.is_some())
            .map(|a| &a.cluster)
    }

    /// State of every node started by the current attempt.
    pub fn node_states(&self) -> BTreeMap<NodeId, NodeState> {
        self.attempt
            .as_ref()
            .map(|a| {
                a.started
                    .iter()
                    .map(|(id, node)| (*id, node.handle.state()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hand over the recovered cluster. Only a `FullyOpen` cluster is handed over.
    pub fn into_cluster(self) -> TesseraResult<Cluster> {
        let phase = self.phase();
        match self.attempt {
            Some(attempt) if phase == ClusterPhase::FullyOpen => Ok(attempt.cluster),
            _ => Err(TesseraError::invalid_transition(phase, "into_cluster")),
        }
    }

    // =========================================================================
    // Barrier 1: public replay
    // =========================================================================

    /// Start recovering `node_count` nodes from `snapshot`, expected to
    /// expose everything in it.
    pub async fn begin_recovery(
        &mut self,
        snapshot: LedgerSnapshot,
        node_count: usize,
    ) -> TesseraResult<()> {
        let offset = snapshot.max_index();
        self.begin_recovery_with_offset(snapshot, node_count, offset)
            .await
    }

    /// Start recovering `node_count` nodes from `snapshot`. The attempt must
    /// expose every transaction up to `offset`.
    pub async fn begin_recovery_with_offset(
        &mut self,
        snapshot: LedgerSnapshot,
        node_count: usize,
        offset: u64,
    ) -> TesseraResult<()> {
        if self.attempt.is_some() {
            return Err(TesseraError::invalid(
                "a recovery attempt is already in progress",
            ));
        }
        self.config.validate()?;
        if let Err(e) = snapshot.validate() {
            tracing::error!(error = %e, "refusing to recover from a corrupt ledger");
            return Err(e);
        }
        if offset > snapshot.max_index() {
            return Err(TesseraError::invalid(format!(
                "offset {offset} is beyond the ledger's last index {}",
                snapshot.max_index()
            )));
        }
        let tables = PublicTables::from_records(snapshot.records())?;

        let required = self.config.min_replicas.max(1);
        let first = tables.next_node_id().value();
        let mut started = BTreeMap::new();
        for node in (first..first + node_count as u64).map(NodeId::new) {
            match self.env.spawn_node(node).await {
                Ok(resources) => {
                    let replica = resources.replica.clone();
                    let controller =
                        LifecycleController::new(node, resources, self.config.replay_yield_interval);
                    started.insert(
                        node,
                        StartedNode {
                            handle: NodeHandle::new(controller),
                            replica,
                        },
                    );
                }
                Err(e) => tracing::warn!(node = %node, error = %e, "node failed to start"),
            }
        }
        if started.len() < required {
            tracing::error!(started = started.len(), required, "too few nodes to run consensus");
            return Err(TesseraError::quorum_unreachable(started.len(), required));
        }

        let snapshot = Arc::new(snapshot);
        let replays = started
            .iter()
            .map(|(node, started)| {
                let handle = started.handle.clone();
                let snapshot = snapshot.clone();
                let task = tokio::spawn(async move {
                    handle.lock().await.start_from_recovery(&snapshot).await
                });
                (*node, task)
            })
            .collect();

        tracing::info!(
            nodes = started.len(),
            records = snapshot.len(),
            offset,
            "recovery started"
        );
        self.attempt = Some(Attempt {
            offset,
            snapshot,
            tables,
            started,
            replays,
            cluster: Cluster::new(self.config.clone(), self.env.service_sealer()),
            public_sync: None,
        });
        Ok(())
    }

    /// Wait for every started node to finish public replay and agree on the
    /// committed ledger, then open the public network.
    ///
    /// Divergent or failed replicas are evicted; the attempt continues if
    /// enough remain. A fatal outcome discards the attempt so it can be
    /// started again from scratch.
    pub async fn await_public_sync(&mut self) -> TesseraResult<PublicSync> {
        let attempt = self
            .attempt
            .as_mut()
            .ok_or_else(|| TesseraError::invalid_transition(ClusterPhase::Opening, "await_public_sync"))?;
        if let Some(sync) = &attempt.public_sync {
            return Ok(sync.clone());
        }

        let result = public_sync(&self.config, attempt).await;
        match result {
            Ok(sync) => {
                attempt.public_sync = Some(sync.clone());
                Ok(sync)
            }
            Err(e) => {
                tracing::error!(error = %e, "recovery aborted during public sync");
                self.attempt = None;
                Err(e)
            }
        }
    }

    // =========================================================================
    // Governance
    // =========================================================================

    /// Propose releasing `bundle` to the recovering cluster.
    pub async fn submit_accept_recovery(
        &mut self,
        member: MemberId,
        bundle: SecretsBundle,
    ) -> TesseraResult<ProposalId> {
        let attempt = self.public_only("submit_accept_recovery")?;
        let proposal = attempt
            .cluster
            .propose(member, ProposalKind::AcceptRecovery(bundle))
            .await?;
        tracing::info!(proposal = %proposal, proposer = %member, "accept_recovery proposed");
        Ok(proposal)
    }

    /// Cast a ballot. The deciding accept of an `AcceptRecovery` proposal
    /// runs [`on_quorum_reached`](Self::on_quorum_reached) before returning.
    pub async fn vote(
        &mut self,
        member: MemberId,
        proposal: ProposalId,
        accept: bool,
    ) -> TesseraResult<VoteReceipt> {
        let attempt = self
            .attempt
            .as_mut()
            .filter(|a| a.public_sync.is_some())
            .ok_or_else(|| TesseraError::invalid_transition(ClusterPhase::Opening, "vote"))?;
        let receipt = attempt.cluster.vote(member, proposal, accept).await?;
        let is_recovery = matches!(
            attempt.cluster.governance().proposal(proposal).map(|p| &p.kind),
            Some(ProposalKind::AcceptRecovery(_))
        );
        if receipt.decided_now && receipt.outcome == ProposalOutcome::Completed && is_recovery {
            self.on_quorum_reached(proposal).await?;
        }
        Ok(receipt)
    }

    // =========================================================================
    // Barrier 2: secrets broadcast
    // =========================================================================

    /// Release the secrets of a completed `AcceptRecovery` proposal to every
    /// node and open the service once all of them are `FullyActive`.
    pub async fn on_quorum_reached(&mut self, proposal: ProposalId) -> TesseraResult<ClusterPhase> {
        if self.phase() == ClusterPhase::FullyOpen {
            return Ok(ClusterPhase::FullyOpen);
        }
        let attempt = self
            .attempt
            .as_mut()
            .filter(|a| a.cluster.phase() == ClusterPhase::PublicOnly)
            .ok_or_else(|| {
                TesseraError::invalid_transition(ClusterPhase::Opening, "on_quorum_reached")
            })?;
        let bundle = completed_bundle(attempt.cluster.governance(), proposal)?;

        // Candidates: the approved bundle, then newer generations for retries.
        let mut candidates = vec![bundle.clone()];
        candidates.extend(self.vault.newer_than(bundle.generation).cloned());
        candidates.retain(|b| self.history.check_generation(b.generation).is_ok());
        if candidates.is_empty() {
            self.history.check_generation(bundle.generation)?;
        }

        // Nodes have been handed secrets from here on; any failure discards
        // the attempt so the recovery can be started again from scratch.
        let opened =
            open_service(&self.config, attempt, &candidates, &self.vault, &self.history).await;
        let (applied, visible) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!(
                    proposal = %proposal,
                    error = %e,
                    "recovery aborted during secrets broadcast"
                );
                self.attempt = None;
                return Err(e);
            }
        };

        self.history.record(RecoveryAttempt {
            offset: attempt.offset,
            generation: applied.generation,
            committed_index: attempt.cluster.adapter().committed_index(),
            visible,
        });
        if let Some(path) = &self.history_path {
            self.history.save(path)?;
        }
        tracing::info!(
            proposal = %proposal,
            generation = applied.generation,
            nodes = attempt.cluster.node_ids().len(),
            "service recovered"
        );
        Ok(ClusterPhase::FullyOpen)
    }

    fn public_only(&mut self, operation: &str) -> TesseraResult<&mut Attempt> {
        let phase = self.phase();
        self.attempt
            .as_mut()
            .filter(|a| a.cluster.phase() == ClusterPhase::PublicOnly)
            .ok_or_else(|| TesseraError::invalid_transition(phase, operation))
    }
}

// =============================================================================
// Barrier implementations
// =============================================================================

async fn public_sync(config: &RecoveryConfig, attempt: &mut Attempt) -> TesseraResult<PublicSync> {
    let timeout = config.public_sync_timeout();
    let replays = std::mem::take(&mut attempt.replays);
    let aborts: Vec<AbortHandle> = replays.iter().map(|(_, task)| task.abort_handle()).collect();

    let joined = tokio::time::timeout(
        timeout,
        join_all(
            replays
                .into_iter()
                .map(|(node, task)| async move { (node, task.await) }),
        ),
    )
    .await;
    let results = match joined {
        Ok(results) => results,
        Err(_) => {
            aborts.iter().for_each(AbortHandle::abort);
            return Err(TesseraError::recovery_timeout(
                "public replay",
                config.public_sync_timeout_ms,
            ));
        }
    };

    let expected = (attempt.snapshot.max_index(), attempt.snapshot.digest());
    let mut survivors = Vec::new();
    let mut evicted = Vec::new();
    let mut first_error = None;
    for (node, result) in results {
        let error = match result {
            Ok(Ok(_)) => {
                let replica = &attempt.started[&node].replica;
                if (replica.committed_index(), replica.digest()) == expected {
                    survivors.push(node);
                    continue;
                }
                let error = TesseraError::divergent_replica(
                    node,
                    format!(
                        "replayed to index {} but the ledger ends at {}",
                        replica.committed_index(),
                        expected.0
                    ),
                );
                attempt.started[&node].handle.lock().await.fail(error)
            }
            Ok(Err(e)) => e,
            Err(join) => TesseraError::internal(format!("replay task for {node} ended: {join}")),
        };
        tracing::warn!(node = %node, error = %error, "evicting replica");
        evicted.push(node);
        if first_error.is_none() {
            first_error = Some(error);
        }
    }

    let required = config.min_replicas.max(1);
    if survivors.len() < required {
        return Err(first_error
            .unwrap_or_else(|| TesseraError::quorum_unreachable(survivors.len(), required)));
    }

    for node in &survivors {
        let started = &attempt.started[node];
        attempt
            .cluster
            .add_node(started.handle.clone(), started.replica.clone())?;
    }
    match attempt.cluster.adapter().commit_sync_point() {
        Some(point) if point == expected => {}
        _ => {
            return Err(TesseraError::divergent_replica(
                "cluster",
                "replicas disagree after public replay",
            ))
        }
    }

    let governance = QuorumEngine::from_tables(&attempt.tables);
    if governance.live_member_count() == 0 {
        return Err(TesseraError::recovery_failed(
            "ledger carries no governance members",
        ));
    }
    attempt.cluster.set_governance(governance);

    let retired: Vec<NodeRecord> = attempt
        .tables
        .trusted_nodes()
        .map(|record| NodeRecord {
            status: NodeStatus::Retired,
            ..record.clone()
        })
        .collect();
    for record in &retired {
        attempt.cluster.commit_node(record.clone()).await?;
    }
    for node in &survivors {
        attempt.cluster.trust_node(*node).await?;
    }
    let (committed_index, digest) = attempt.cluster.wait_for_commit_sync(timeout).await?;
    attempt.cluster.set_phase(ClusterPhase::PublicOnly);

    tracing::info!(
        committed_index,
        nodes = survivors.len(),
        evicted = evicted.len(),
        retired = retired.len(),
        "public sync reached"
    );
    Ok(PublicSync {
        committed_index,
        digest,
        nodes: survivors,
        evicted,
    })
}

fn completed_bundle(governance: &QuorumEngine, id: ProposalId) -> TesseraResult<SecretsBundle> {
    let proposal = governance
        .proposal(id)
        .ok_or_else(|| TesseraError::proposal_not_found(id))?;
    match (&proposal.kind, proposal.outcome) {
        (ProposalKind::AcceptRecovery(bundle), ProposalOutcome::Completed) => Ok(bundle.clone()),
        (ProposalKind::AcceptRecovery(_), outcome) => Err(TesseraError::invalid(format!(
            "{id} is {outcome}, not Completed"
        ))),
        (kind, _) => Err(TesseraError::invalid(format!(
            "{id} is a {} proposal, not accept_recovery",
            kind.tag()
        ))),
    }
}

/// Broadcast the secrets, check what the cluster exposes and commit the
/// reopening. Returns the applied bundle and the visible transaction set.
async fn open_service(
    config: &RecoveryConfig,
    attempt: &mut Attempt,
    candidates: &[SecretsBundle],
    vault: &SecretsVault,
    history: &RecoveryHistory,
) -> TesseraResult<(SecretsBundle, VisibleSet)> {
    let applied = broadcast_secrets(config, attempt, candidates).await?;
    let visible = verify_exposure(attempt, history).await?;

    let mut vault = vault.clone();
    if vault.get(applied.generation).is_none() {
        vault = SecretsVault::new();
        vault.push(applied.clone())?;
    }
    attempt.cluster.set_vault(vault);
    attempt
        .cluster
        .commit_governance(&[GovernanceRecord::ServiceOpened {
            generation: applied.generation,
        }])
        .await?;
    attempt.cluster.set_phase(ClusterPhase::FullyOpen);
    Ok((applied, visible))
}

/// Fan out `apply_secrets` and return the bundle the last round applied.
async fn broadcast_secrets(
    config: &RecoveryConfig,
    attempt: &Attempt,
    candidates: &[SecretsBundle],
) -> TesseraResult<SecretsBundle> {
    if candidates.is_empty() {
        return Err(TesseraError::secrets_mismatch("no usable secrets bundle"));
    }
    let timeout = config.apply_secrets_timeout();
    let handles: Vec<NodeHandle> = attempt.cluster.nodes().cloned().collect();
    let mut applied: Option<&SecretsBundle> = None;

    for round in 0..config.max_unseal_retries as usize {
        let pending: Vec<&NodeHandle> = handles
            .iter()
            .filter(|h| h.state() != NodeState::FullyActive)
            .collect();
        if pending.is_empty() {
            break;
        }
        let bundle = &candidates[round.min(candidates.len() - 1)];
        if round > 0 {
            tracing::warn!(round, generation = bundle.generation, nodes = pending.len(), "retrying unseal");
        }

        let results = tokio::time::timeout(
            timeout,
            join_all(pending.iter().map(|handle| async move {
                let mut node = handle.lock().await;
                if node.state() == NodeState::Failed {
                    if let Err(e) = node.reset_after_mismatch() {
                        return (node.node_id(), Err(e));
                    }
                }
                (node.node_id(), node.apply_secrets(bundle).await)
            })),
        )
        .await
        .map_err(|_| {
            TesseraError::recovery_timeout("apply_secrets broadcast", config.apply_secrets_timeout_ms)
        })?;

        for (node, result) in results {
            match result {
                Ok(_) => applied = Some(bundle),
                Err(TesseraError::SecretsMismatch { message }) => {
                    tracing::warn!(node = %node, generation = bundle.generation, %message, "unseal failed");
                }
                Err(e) => {
                    tracing::error!(node = %node, error = %e, "recovery aborted");
                    return Err(TesseraError::recovery_failed(format!(
                        "{node} failed to apply secrets: {e}"
                    )));
                }
            }
        }
    }

    let failed: Vec<NodeId> = handles
        .iter()
        .filter(|h| h.state() != NodeState::FullyActive)
        .map(NodeHandle::node_id)
        .collect();
    if !failed.is_empty() {
        tracing::error!(?failed, retries = config.max_unseal_retries, "recovery aborted");
        return Err(TesseraError::recovery_failed(format!(
            "{} of {} nodes could not apply ledger secrets after {} attempts",
            failed.len(),
            handles.len(),
            config.max_unseal_retries
        )));
    }
    applied
        .cloned()
        .ok_or_else(|| TesseraError::internal("no bundle was applied"))
}

/// Check the recovered transactions: every index up to the offset is
/// readable, every node exposes the same set, and nothing exposed by an
/// earlier recovery is missing or changed.
async fn verify_exposure(
    attempt: &Attempt,
    history: &RecoveryHistory,
) -> TesseraResult<BTreeMap<u64, Hash32>> {
    let cluster = &attempt.cluster;
    let leader = cluster.leader()?.node_id();
    for index in 1..=attempt.offset {
        cluster.read(leader, index).await.map_err(|e| {
            TesseraError::recovery_failed(format!("index {index} within offset is unreadable: {e}"))
        })?;
    }

    let visible = fingerprint(&cluster.visible_transactions(leader).await?);
    for node in cluster.node_ids() {
        if fingerprint(&cluster.visible_transactions(node).await?) != visible {
            return Err(TesseraError::recovery_failed(format!(
                "{node} exposes a different transaction set than {leader}"
            )));
        }
    }
    history.check_superset(&visible)?;
    Ok(visible)
}
