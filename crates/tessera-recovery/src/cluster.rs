//! Running cluster
//!
//! A [`Cluster`] is one running service instance: its nodes, the replicated
//! log they share, the governance engine and the sealed secrets the service
//! has exported so far. It is created either by [`Cluster::start_fresh`] or by
//! the recovery coordinator, and its [`ClusterPhase`] only moves forward:
//!
//! ```text
//! Opening ──▶ PublicOnly ──▶ FullyOpen
//! ```
//!
//! Governance activity and node table changes are committed as ordinary
//! public records through the same adapter as application transactions.

use crate::environment::ClusterEnvironment;
use crate::lifecycle::{LifecycleController, NodeHandle, NodeState};
use futures::future::select_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tessera_consensus::{ConsensusAdapter, ReplicaLog, ReplicatedLog};
use tessera_core::{Hash32, MemberId, NodeId, ProposalId, RecoveryConfig, TesseraError, TesseraResult};
use tessera_governance::{QuorumEngine, VoteReceipt};
use tessera_ledger::{
    GovernanceRecord, LedgerSecrets, LedgerSnapshot, Member, NodeRecord, NodeStatus,
    PendingTransaction, ProposalKind, ProposalOutcome, PublicTables, RecordDomain, SealingEffects,
    SecretsBundle, SecretsVault, Visibility,
};

/// Service-wide phase of a running cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterPhase {
    /// Nodes starting or replaying
    Opening,
    /// Public history replayed, private state still sealed
    PublicOnly,
    /// Serving everything
    FullyOpen,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterPhase::Opening => "Opening",
            ClusterPhase::PublicOnly => "PublicOnly",
            ClusterPhase::FullyOpen => "FullyOpen",
        };
        f.write_str(name)
    }
}

/// Health summary for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Service phase
    pub phase: ClusterPhase,
    /// Highest index committed on a quorum
    pub committed_index: u64,
    /// Newest exported secrets generation
    pub secrets_generation: Option<u64>,
    /// Per-node state, by node identifier
    pub nodes: BTreeMap<NodeId, NodeState>,
}

/// A running service instance.
pub struct Cluster {
    config: RecoveryConfig,
    nodes: BTreeMap<NodeId, NodeHandle>,
    log: Arc<ReplicatedLog>,
    phase: ClusterPhase,
    governance: QuorumEngine,
    sealer: Arc<dyn SealingEffects>,
    vault: SecretsVault,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("phase", &self.phase)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("committed_index", &self.log.committed_index())
            .finish()
    }
}

impl Cluster {
    /// Empty cluster in `Opening`.
    pub(crate) fn new(config: RecoveryConfig, sealer: Arc<dyn SealingEffects>) -> Self {
        Self {
            config,
            nodes: BTreeMap::new(),
            log: Arc::new(ReplicatedLog::new(Vec::new())),
            phase: ClusterPhase::Opening,
            governance: QuorumEngine::default(),
            sealer,
            vault: SecretsVault::new(),
        }
    }

    /// First-ever start of a service.
    ///
    /// Commits the member and node tables at genesis, generates generation-1
    /// ledger secrets, seals them into the vault and opens the service.
    pub async fn start_fresh(
        env: &dyn ClusterEnvironment,
        config: RecoveryConfig,
        members: Vec<Member>,
        node_count: usize,
    ) -> TesseraResult<Self> {
        config.validate()?;
        let required = config.min_replicas.max(1);
        if node_count < required {
            return Err(TesseraError::quorum_unreachable(node_count, required));
        }
        if members.is_empty() {
            return Err(TesseraError::invalid("a service needs at least one member"));
        }

        let mut cluster = Cluster::new(config, env.service_sealer());
        let secrets = LedgerSecrets::generate();
        for i in 0..node_count as u64 {
            let node = NodeId::new(i);
            let resources = env.spawn_node(node).await?;
            let replica = resources.replica.clone();
            let mut controller =
                LifecycleController::new(node, resources, cluster.config.replay_yield_interval);
            controller.start_fresh(secrets.clone())?;
            cluster.add_node(NodeHandle::new(controller), replica)?;
        }

        let genesis: Vec<GovernanceRecord> = members
            .iter()
            .map(|member| GovernanceRecord::MemberAdded {
                member: member.clone(),
            })
            .collect();
        cluster.commit_governance(&genesis).await?;
        for node in cluster.node_ids() {
            cluster.trust_node(node).await?;
        }
        cluster.governance = QuorumEngine::new(members);

        let bundle = SecretsBundle::seal(cluster.sealer.as_ref(), &secrets).await?;
        let generation = bundle.generation;
        cluster.vault.push(bundle)?;
        cluster
            .commit_governance(&[GovernanceRecord::ServiceOpened { generation }])
            .await?;
        cluster.phase = ClusterPhase::FullyOpen;
        tracing::info!(
            nodes = node_count,
            members = cluster.governance.live_member_count(),
            generation,
            "service opened"
        );
        Ok(cluster)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Service phase.
    pub fn phase(&self) -> ClusterPhase {
        self.phase
    }

    /// Configuration the cluster runs with.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Node identifiers, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Handle to one node.
    pub fn node(&self, node: NodeId) -> Option<&NodeHandle> {
        self.nodes.get(&node)
    }

    /// All node handles, by identifier.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeHandle> {
        self.nodes.values()
    }

    /// The consensus adapter shared by every node.
    pub fn adapter(&self) -> &Arc<ReplicatedLog> {
        &self.log
    }

    /// Governance engine.
    pub fn governance(&self) -> &QuorumEngine {
        &self.governance
    }

    /// Sealed secrets exported by this service, oldest first.
    pub fn export_sealed_secrets(&self) -> SecretsVault {
        self.vault.clone()
    }

    /// Current leader's handle.
    pub fn leader(&self) -> TesseraResult<&NodeHandle> {
        self.log
            .leader()
            .and_then(|id| self.nodes.get(&id))
            .ok_or_else(|| TesseraError::quorum_unreachable(0, 1))
    }

    /// Health summary.
    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            phase: self.phase,
            committed_index: self.log.committed_index(),
            secrets_generation: self.vault.latest().map(|b| b.generation),
            nodes: self
                .nodes
                .iter()
                .map(|(id, handle)| (*id, handle.state()))
                .collect(),
        }
    }

    // =========================================================================
    // Service operations
    // =========================================================================

    /// Commit an application transaction. Private payloads are encrypted
    /// under the current ledger secrets before they reach the adapter.
    pub async fn submit_transaction(
        &self,
        visibility: Visibility,
        payload: &[u8],
    ) -> TesseraResult<u64> {
        if self.phase != ClusterPhase::FullyOpen {
            return Err(TesseraError::not_serving(
                "service",
                format!("application transactions are not accepted while {}", self.phase),
            ));
        }
        let pending = {
            let leader = self.leader()?.lock().await;
            leader.accepts_application()?;
            match visibility {
                Visibility::Public => PendingTransaction::public(RecordDomain::Application, payload),
                Visibility::Private => leader.prepare_private(payload)?,
            }
        };
        self.commit(pending).await
    }

    /// Read the plaintext at `index` through `node`.
    pub async fn read(&self, node: NodeId, index: u64) -> TesseraResult<Vec<u8>> {
        self.handle(node)?.lock().await.read(index)
    }

    /// Every application transaction visible through `node`.
    pub async fn visible_transactions(&self, node: NodeId) -> TesseraResult<BTreeMap<u64, Vec<u8>>> {
        self.handle(node)?.lock().await.visible_transactions()
    }

    /// Export the committed ledger from the leader.
    pub fn export_ledger(&self) -> TesseraResult<LedgerSnapshot> {
        let leader = self.leader()?.node_id();
        let replica = self
            .log
            .replica(leader)
            .ok_or_else(|| TesseraError::internal(format!("{leader} has no replica")))?;
        Ok(replica.export())
    }

    /// Rotate the ledger secrets to a new generation on every node and
    /// export the sealed result. Older keys are chain-wrapped inside it.
    pub async fn rotate_ledger_secrets(&mut self) -> TesseraResult<u64> {
        self.check_for_service()?;
        let mut secrets = self.leader()?.lock().await.ledger_secrets()?.clone();
        let generation = secrets.rotate();
        for handle in self.nodes.values() {
            handle.lock().await.install_rotated_secrets(secrets.clone())?;
        }
        let bundle = SecretsBundle::seal(self.sealer.as_ref(), &secrets).await?;
        self.vault.push(bundle)?;
        tracing::info!(generation, "ledger secrets rotated");
        Ok(generation)
    }

    /// Wait until every replica reports the same committed index and digest.
    pub async fn wait_for_commit_sync(&self, timeout: Duration) -> TesseraResult<(u64, Hash32)> {
        let wait = async {
            loop {
                let mut receivers: Vec<_> = self
                    .log
                    .replica_ids()
                    .into_iter()
                    .filter_map(|id| self.log.replica(id))
                    .map(|replica| replica.watch_committed())
                    .collect();
                if let Some(point) = self.log.commit_sync_point() {
                    return Ok(point);
                }
                if receivers.is_empty() {
                    return Err(TesseraError::quorum_unreachable(0, 1));
                }
                let (changed, _, _) =
                    select_all(receivers.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
                if changed.is_err() {
                    return Err(TesseraError::internal("replica closed during commit sync"));
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            TesseraError::recovery_timeout("commit sync", timeout.as_millis() as u64)
        })?
    }

    /// Succeeds only when the service is open and every node is `FullyActive`.
    pub fn check_for_service(&self) -> TesseraResult<()> {
        if self.phase != ClusterPhase::FullyOpen {
            return Err(TesseraError::not_serving(
                "service",
                format!("service is {}", self.phase),
            ));
        }
        if let Some(handle) = self
            .nodes
            .values()
            .find(|h| h.state() != NodeState::FullyActive)
        {
            return Err(TesseraError::not_serving(
                handle.node_id(),
                format!("node is {}", handle.state()),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Governance
    // =========================================================================

    /// Create a proposal and commit it.
    pub async fn propose(&mut self, member: MemberId, kind: ProposalKind) -> TesseraResult<ProposalId> {
        self.leader()?.lock().await.accepts_governance()?;
        if let ProposalKind::RetireNode(node) = &kind {
            self.check_retirable(*node)?;
        }
        let receipt = self.governance.propose(member, kind)?;
        self.commit_governance(&receipt.records).await?;
        Ok(receipt.proposal)
    }

    /// Cast a ballot and commit it, with the decision if it was the deciding one.
    ///
    /// A `RetireNode` proposal is executed by the ballot that completes it.
    pub async fn vote(
        &mut self,
        member: MemberId,
        proposal: ProposalId,
        accept: bool,
    ) -> TesseraResult<VoteReceipt> {
        self.leader()?.lock().await.accepts_governance()?;
        let receipt = self.governance.vote(member, proposal, accept)?;
        self.commit_governance(&receipt.records).await?;
        if receipt.decided_now && receipt.outcome == ProposalOutcome::Completed {
            let retiring = match self.governance.proposal(proposal).map(|p| &p.kind) {
                Some(ProposalKind::RetireNode(node)) => Some(*node),
                _ => None,
            };
            if let Some(node) = retiring {
                self.retire_node(node).await?;
            }
        }
        Ok(receipt)
    }

    /// Withdraw a proposal on behalf of its proposer.
    pub async fn withdraw(
        &mut self,
        member: MemberId,
        proposal: ProposalId,
    ) -> TesseraResult<VoteReceipt> {
        self.leader()?.lock().await.accepts_governance()?;
        let receipt = self.governance.withdraw(member, proposal)?;
        self.commit_governance(&receipt.records).await?;
        Ok(receipt)
    }

    // =========================================================================
    // Crate-internal assembly
    // =========================================================================

    pub(crate) fn add_node(&mut self, handle: NodeHandle, replica: Arc<dyn ReplicaLog>) -> TesseraResult<()> {
        self.log.add_replica(replica)?;
        self.nodes.insert(handle.node_id(), handle);
        Ok(())
    }

    pub(crate) fn set_phase(&mut self, phase: ClusterPhase) {
        tracing::info!(from = %self.phase, to = %phase, "cluster phase");
        self.phase = phase;
    }

    pub(crate) fn set_governance(&mut self, governance: QuorumEngine) {
        self.governance = governance;
    }

    pub(crate) fn set_vault(&mut self, vault: SecretsVault) {
        self.vault = vault;
    }

    pub(crate) async fn commit_governance(&self, records: &[GovernanceRecord]) -> TesseraResult<u64> {
        let mut index = self.log.committed_index();
        for record in records {
            index = self.commit(record.to_pending()?).await?;
        }
        Ok(index)
    }

    /// Commit `node` as `Trusted`, joining at the next index.
    pub(crate) async fn trust_node(&self, node: NodeId) -> TesseraResult<u64> {
        self.commit_node(NodeRecord {
            id: node,
            status: NodeStatus::Trusted,
            joined_at_index: self.log.committed_index() + 1,
        })
        .await
    }

    pub(crate) async fn commit_node(&self, record: NodeRecord) -> TesseraResult<u64> {
        let index = self.commit(record.to_pending()?).await?;
        tracing::debug!(node = %record.id, status = %record.status, index, "node table updated");
        Ok(index)
    }

    /// Node table folded from the leader's log.
    fn node_table(&self) -> TesseraResult<PublicTables> {
        let leader = self.leader()?.node_id();
        let replica = self
            .log
            .replica(leader)
            .ok_or_else(|| TesseraError::internal(format!("{leader} has no replica")))?;
        PublicTables::from_records(&replica.records_from(1))
    }

    /// A node can be retired if it belongs to this cluster and enough
    /// replicas remain to run consensus without it.
    fn check_retirable(&self, node: NodeId) -> TesseraResult<()> {
        if !self.nodes.contains_key(&node) {
            return Err(TesseraError::invalid(format!(
                "{node} is not part of the cluster"
            )));
        }
        let required = self.config.min_replicas.max(1);
        if self.nodes.len() - 1 < required {
            return Err(TesseraError::invalid(format!(
                "retiring {node} would leave {} replicas, {required} required",
                self.nodes.len() - 1
            )));
        }
        Ok(())
    }

    /// Commit `node` as `Retired` and drop it from replication.
    async fn retire_node(&mut self, node: NodeId) -> TesseraResult<()> {
        self.check_retirable(node)?;
        let joined_at_index = self
            .node_table()?
            .nodes
            .get(&node)
            .map_or(self.log.committed_index(), |record| record.joined_at_index);
        self.commit_node(NodeRecord {
            id: node,
            status: NodeStatus::Retired,
            joined_at_index,
        })
        .await?;
        self.log.evict(node);
        self.nodes.remove(&node);
        tracing::info!(node = %node, remaining = self.nodes.len(), "node retired");
        Ok(())
    }

    fn handle(&self, node: NodeId) -> TesseraResult<&NodeHandle> {
        self.nodes
            .get(&node)
            .ok_or_else(|| TesseraError::not_found(format!("{node} is not part of the cluster")))
    }

    async fn commit(&self, pending: PendingTransaction) -> TesseraResult<u64> {
        let index = self.log.submit(pending).await?;
        self.log.subscribe(index).await?;
        Ok(index)
    }
}
