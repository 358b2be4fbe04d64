//! Node Lifecycle Controller
//!
//! Per-node state machine driving a node from bootstrap through public
//! replay to full operation:
//!
//! ```text
//! Uninitialized ──start_fresh──────────────────────────────────▶ FullyActive
//!       │
//!       └─start_from_recovery─▶ PublicReplay ─▶ PublicActive ─apply_secrets─▶ PrivateDecryption ─▶ FullyActive
//!                                    │               ▲                               │
//!                                    ▼               └──reset_after_mismatch──── Failed ◀┘
//!                                  Failed
//! ```
//!
//! ## Serving rules
//!
//! - `PublicActive`: public reads and governance writes only
//! - `FullyActive`: everything, including private reads and application writes
//! - every other state: nothing
//!
//! Replay and decryption take `&mut self`, so a node wrapped in a
//! [`NodeHandle`] cannot serve requests while either is running.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tessera_consensus::ReplicaLog;
use tessera_core::{NodeId, TesseraError, TesseraResult};
use tessera_ledger::{
    EncryptedPayload, LedgerSecrets, LedgerSnapshot, PendingTransaction, RecordDomain,
    SealingEffects, SecretsBundle, TransactionRecord,
};
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::environment::NodeResources;

// =============================================================================
// NODE STATE
// =============================================================================

/// Externally observable node state.
///
/// [`NodeState::as_str`] gives the stable machine-readable name used by
/// status queries; serde uses the same names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Process started, nothing loaded
    Uninitialized,
    /// Replaying a ledger snapshot
    PublicReplay,
    /// Public history replayed; part of the public network
    PublicActive,
    /// Unsealing secrets and decrypting private history
    PrivateDecryption,
    /// Part of the network, serving everything
    FullyActive,
    /// Terminal until reset
    Failed,
}

impl NodeState {
    /// Stable machine-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Uninitialized => "Uninitialized",
            NodeState::PublicReplay => "PublicReplay",
            NodeState::PublicActive => "PublicActive",
            NodeState::PrivateDecryption => "PrivateDecryption",
            NodeState::FullyActive => "FullyActive",
            NodeState::Failed => "Failed",
        }
    }

    /// Whether public reads are served.
    pub fn serves_public(self) -> bool {
        matches!(self, NodeState::PublicActive | NodeState::FullyActive)
    }

    /// Whether private reads and application writes are served.
    pub fn serves_private(self) -> bool {
        self == NodeState::FullyActive
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            NodeState::Uninitialized,
            NodeState::PublicReplay,
            NodeState::PublicActive,
            NodeState::PrivateDecryption,
            NodeState::FullyActive,
            NodeState::Failed,
        ]
        .into_iter()
        .find(|state| state.as_str() == s)
        .ok_or_else(|| TesseraError::invalid(format!("unknown node state: {s}")))
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Lifecycle of a single node.
pub struct LifecycleController {
    node: NodeId,
    replica: Arc<dyn ReplicaLog>,
    sealer: Arc<dyn SealingEffects>,
    yield_interval: usize,
    state: NodeState,
    status: watch::Sender<NodeState>,
    secrets: Option<LedgerSecrets>,
    applied_generation: Option<u64>,
    decrypted: BTreeMap<u64, Vec<u8>>,
    private_records_processed: usize,
    failure: Option<TesseraError>,
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("node", &self.node)
            .field("state", &self.state)
            .field("committed_index", &self.replica.committed_index())
            .field("applied_generation", &self.applied_generation)
            .finish()
    }
}

impl LifecycleController {
    /// Controller over a freshly spawned node.
    pub fn new(node: NodeId, resources: NodeResources, yield_interval: usize) -> Self {
        let (status, _) = watch::channel(NodeState::Uninitialized);
        Self {
            node,
            replica: resources.replica,
            sealer: resources.sealer,
            yield_interval: yield_interval.max(1),
            state: NodeState::Uninitialized,
            status,
            secrets: None,
            applied_generation: None,
            decrypted: BTreeMap::new(),
            private_records_processed: 0,
            failure: None,
        }
    }

    /// Node identifier.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Current state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.status.subscribe()
    }

    /// The node's committed log.
    pub fn replica(&self) -> &Arc<dyn ReplicaLog> {
        &self.replica
    }

    /// Error that moved the node to `Failed`, if any.
    pub fn failure(&self) -> Option<&TesseraError> {
        self.failure.as_ref()
    }

    /// Generation of the ledger secrets in use.
    pub fn applied_generation(&self) -> Option<u64> {
        self.applied_generation
    }

    /// Private records decrypted during recovery so far.
    pub fn private_records_processed(&self) -> usize {
        self.private_records_processed
    }

    /// First-ever start: empty ledger, straight to `FullyActive`.
    pub fn start_fresh(&mut self, secrets: LedgerSecrets) -> TesseraResult<NodeState> {
        self.require(NodeState::Uninitialized, "start_fresh")?;
        if self.replica.committed_index() != 0 {
            return Err(self.fail(TesseraError::invalid(format!(
                "{} cannot start fresh over a non-empty ledger",
                self.node
            ))));
        }
        self.applied_generation = Some(secrets.current_generation());
        self.secrets = Some(secrets);
        self.transition(NodeState::FullyActive);
        Ok(self.state)
    }

    /// Replay a snapshot's public history.
    ///
    /// Every record is appended to the local replica at its original index.
    /// Private records stay as opaque ciphertext placeholders until
    /// [`apply_secrets`](Self::apply_secrets). Calling again after the same
    /// snapshot has been replayed is a no-op.
    pub async fn start_from_recovery(
        &mut self,
        snapshot: &LedgerSnapshot,
    ) -> TesseraResult<NodeState> {
        if self.state == NodeState::PublicActive && self.holds(snapshot) {
            return Ok(self.state);
        }
        self.require(NodeState::Uninitialized, "start_from_recovery")?;
        self.transition(NodeState::PublicReplay);

        if let Err(e) = snapshot.validate() {
            return Err(self.fail(e));
        }
        tracing::info!(
            node = %self.node,
            records = snapshot.len(),
            "replaying public ledger"
        );

        for (replayed, record) in snapshot.records().iter().enumerate() {
            if let Err(e) = self.replica.append(record.clone()) {
                return Err(self.fail(e));
            }
            tracing::trace!(node = %self.node, index = record.index, visibility = %record.visibility, "replayed");
            if (replayed + 1) % self.yield_interval == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.transition(NodeState::PublicActive);
        Ok(self.state)
    }

    /// Unseal `bundle` and decrypt the private history in index order.
    ///
    /// Idempotent once `FullyActive`: returns the current state and does not
    /// reprocess private records. An unseal or decryption failure moves the
    /// node to `Failed` and is reported, never skipped.
    pub async fn apply_secrets(&mut self, bundle: &SecretsBundle) -> TesseraResult<NodeState> {
        if self.state == NodeState::FullyActive {
            tracing::debug!(node = %self.node, generation = bundle.generation, "secrets already applied");
            return Ok(self.state);
        }
        self.require(NodeState::PublicActive, "apply_secrets")?;
        self.transition(NodeState::PrivateDecryption);

        let secrets = match bundle.unseal(self.sealer.as_ref()).await {
            Ok(secrets) => secrets,
            Err(e) => return Err(self.fail(e)),
        };

        let private: Vec<TransactionRecord> = self
            .replica
            .records_from(1)
            .into_iter()
            .filter(TransactionRecord::is_private)
            .collect();
        let mut decrypted = BTreeMap::new();
        for (processed, record) in private.iter().enumerate() {
            match decrypt_record(&secrets, record) {
                Ok(plaintext) => {
                    decrypted.insert(record.index, plaintext);
                }
                Err(e) => return Err(self.fail(e)),
            }
            if (processed + 1) % self.yield_interval == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.private_records_processed += decrypted.len();
        self.decrypted = decrypted;
        self.applied_generation = Some(secrets.current_generation());
        self.secrets = Some(secrets);
        tracing::info!(
            node = %self.node,
            generation = bundle.generation,
            private_records = private.len(),
            "private ledger decrypted"
        );
        self.transition(NodeState::FullyActive);
        Ok(self.state)
    }

    /// Return a node that failed to unseal to `PublicActive` so another
    /// bundle can be tried. Any other failure stays terminal.
    pub fn reset_after_mismatch(&mut self) -> TesseraResult<NodeState> {
        self.require(NodeState::Failed, "reset_after_mismatch")?;
        if !matches!(self.failure, Some(TesseraError::SecretsMismatch { .. })) {
            return Err(TesseraError::invalid_transition(
                self.state,
                "reset_after_mismatch after a non-secrets failure",
            ));
        }
        self.failure = None;
        self.decrypted.clear();
        self.transition(NodeState::PublicActive);
        Ok(self.state)
    }

    /// Replace the ledger secrets after a rotation.
    pub fn install_rotated_secrets(&mut self, secrets: LedgerSecrets) -> TesseraResult<()> {
        self.require(NodeState::FullyActive, "install_rotated_secrets")?;
        let current = self.applied_generation.unwrap_or(0);
        if secrets.current_generation() <= current {
            return Err(TesseraError::invalid(format!(
                "rotated secrets generation {} is not newer than {current}",
                secrets.current_generation()
            )));
        }
        self.applied_generation = Some(secrets.current_generation());
        self.secrets = Some(secrets);
        Ok(())
    }

    /// Current ledger secrets. Only a `FullyActive` node exposes them.
    pub fn ledger_secrets(&self) -> TesseraResult<&LedgerSecrets> {
        self.require_serving(true)?;
        self.secrets
            .as_ref()
            .ok_or_else(|| TesseraError::internal(format!("{} is active without secrets", self.node)))
    }

    /// Read the plaintext payload at `index`.
    pub fn read(&self, index: u64) -> TesseraResult<Vec<u8>> {
        self.require_serving(false)?;
        let record = self
            .replica
            .get(index)
            .ok_or_else(|| TesseraError::not_found(format!("no record at index {index}")))?;
        if record.is_public() {
            return Ok(record.payload);
        }
        self.require_serving(true)?;
        if let Some(plaintext) = self.decrypted.get(&index) {
            return Ok(plaintext.clone());
        }
        decrypt_record(self.ledger_secrets()?, &record)
    }

    /// Every application record, decrypted where private.
    pub fn visible_transactions(&self) -> TesseraResult<BTreeMap<u64, Vec<u8>>> {
        self.require_serving(true)?;
        self.replica
            .records_from(1)
            .into_iter()
            .filter(|record| record.domain == RecordDomain::Application)
            .map(|record| Ok((record.index, self.read(record.index)?)))
            .collect()
    }

    /// Encrypt an application payload for submission.
    pub fn prepare_private(&self, plaintext: &[u8]) -> TesseraResult<PendingTransaction> {
        let payload = self.ledger_secrets()?.encrypt(plaintext)?;
        Ok(PendingTransaction::private(payload.to_bytes()?))
    }

    /// Check that governance transactions may go through this node.
    pub fn accepts_governance(&self) -> TesseraResult<()> {
        self.require_serving(false)
    }

    /// Check that application transactions may go through this node.
    pub fn accepts_application(&self) -> TesseraResult<()> {
        self.require_serving(true)
    }

    /// Move to `Failed`, remembering the cause.
    pub fn fail(&mut self, error: TesseraError) -> TesseraError {
        tracing::error!(node = %self.node, from = %self.state, error = %error, "node failed");
        self.failure = Some(error.clone());
        self.transition(NodeState::Failed);
        error
    }

    fn holds(&self, snapshot: &LedgerSnapshot) -> bool {
        self.replica.committed_index() == snapshot.max_index()
            && self.replica.digest() == snapshot.digest()
    }

    fn require(&self, expected: NodeState, operation: &str) -> TesseraResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TesseraError::invalid_transition(self.state, operation))
        }
    }

    fn require_serving(&self, private: bool) -> TesseraResult<()> {
        let serving = if private {
            self.state.serves_private()
        } else {
            self.state.serves_public()
        };
        if serving {
            Ok(())
        } else {
            let scope = if private { "private" } else { "public" };
            Err(TesseraError::not_serving(
                self.node,
                format!("{scope} requests are not served while {}", self.state),
            ))
        }
    }

    fn transition(&mut self, next: NodeState) {
        if self.state != next {
            tracing::info!(node = %self.node, from = %self.state, to = %next, "node state");
        }
        self.state = next;
        self.status.send_replace(next);
    }
}

fn decrypt_record(secrets: &LedgerSecrets, record: &TransactionRecord) -> TesseraResult<Vec<u8>> {
    let payload = EncryptedPayload::from_bytes(&record.payload)?;
    secrets.decrypt(&payload).map_err(|e| match e {
        TesseraError::SecretsMismatch { message } => TesseraError::secrets_mismatch(format!(
            "record {}: {message}",
            record.index
        )),
        other => other,
    })
}

// =============================================================================
// HANDLE
// =============================================================================

/// Shared handle to a node's controller.
///
/// State queries go through the watch channel and never wait on the
/// controller lock, so they keep working while the node replays.
#[derive(Clone)]
pub struct NodeHandle {
    node: NodeId,
    controller: Arc<Mutex<LifecycleController>>,
    status: watch::Receiver<NodeState>,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("node", &self.node)
            .field("state", &self.state())
            .finish()
    }
}

impl NodeHandle {
    /// Wrap a controller.
    pub fn new(controller: LifecycleController) -> Self {
        let node = controller.node_id();
        let status = controller.subscribe();
        Self {
            node,
            controller: Arc::new(Mutex::new(controller)),
            status,
        }
    }

    /// Node identifier.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Latest published state.
    pub fn state(&self) -> NodeState {
        *self.status.borrow()
    }

    /// Exclusive access to the controller.
    pub async fn lock(&self) -> MutexGuard<'_, LifecycleController> {
        self.controller.lock().await
    }

    /// Wait until the node reaches `target`.
    ///
    /// Fails early if the node enters `Failed` while waiting for another state.
    pub async fn wait_for_state(&self, target: NodeState, timeout: Duration) -> TesseraResult<()> {
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(
            timeout,
            status.wait_for(|state| *state == target || *state == NodeState::Failed),
        )
        .await;
        match waited {
            Err(_) => Err(TesseraError::recovery_timeout(
                format!("{} reaching {target}", self.node),
                timeout.as_millis() as u64,
            )),
            Ok(Err(_)) => Err(TesseraError::internal(format!(
                "{} status channel closed",
                self.node
            ))),
            Ok(Ok(state)) if *state == target => Ok(()),
            Ok(Ok(_)) => Err(TesseraError::recovery_failed(format!(
                "{} failed while waiting for {target}",
                self.node
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tessera_consensus::MemoryReplica;
    use tessera_ledger::PlatformSealer;

    fn controller(node: u64, sealer: &Arc<PlatformSealer>) -> LifecycleController {
        let resources = NodeResources {
            replica: Arc::new(MemoryReplica::new(NodeId::new(node))),
            sealer: sealer.clone(),
        };
        LifecycleController::new(NodeId::new(node), resources, 2)
    }

    async fn ledger(
        sealer: &PlatformSealer,
        secrets: &LedgerSecrets,
    ) -> (LedgerSnapshot, SecretsBundle) {
        let mut records = Vec::new();
        for i in 1..=6u64 {
            let record = if i % 2 == 0 {
                let encrypted = secrets.encrypt(format!("private-{i}").as_bytes()).unwrap();
                TransactionRecord::new(
                    i,
                    tessera_ledger::Visibility::Private,
                    RecordDomain::Application,
                    encrypted.to_bytes().unwrap(),
                )
            } else {
                TransactionRecord::public(i, format!("public-{i}").into_bytes())
            };
            records.push(record);
        }
        let bundle = SecretsBundle::seal(sealer, secrets).await.unwrap();
        (LedgerSnapshot::from_records(records).unwrap(), bundle)
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            NodeState::Uninitialized,
            NodeState::PublicActive,
            NodeState::FullyActive,
            NodeState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<NodeState>().unwrap(), state);
            assert_eq!(
                serde_json::to_string(&state).unwrap(),
                format!("\"{}\"", state.as_str())
            );
        }
        assert!("partOfNetwork".parse::<NodeState>().is_err());
    }

    #[tokio::test]
    async fn recovery_gates_private_reads_until_secrets() {
        let sealer = Arc::new(PlatformSealer::new(b"platform"));
        let secrets = LedgerSecrets::generate();
        let (snapshot, bundle) = ledger(&sealer, &secrets).await;
        let mut node = controller(1, &sealer);

        assert_matches!(node.read(1), Err(TesseraError::NotServing { .. }));
        assert_eq!(
            node.start_from_recovery(&snapshot).await.unwrap(),
            NodeState::PublicActive
        );
        assert_eq!(node.read(1).unwrap(), b"public-1");
        assert_matches!(node.read(2), Err(TesseraError::NotServing { .. }));
        assert_matches!(node.prepare_private(b"x"), Err(TesseraError::NotServing { .. }));
        node.accepts_governance().unwrap();

        assert_eq!(node.apply_secrets(&bundle).await.unwrap(), NodeState::FullyActive);
        assert_eq!(node.read(2).unwrap(), b"private-2");
        assert_eq!(node.visible_transactions().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn apply_secrets_is_idempotent() {
        let sealer = Arc::new(PlatformSealer::new(b"platform"));
        let secrets = LedgerSecrets::generate();
        let (snapshot, bundle) = ledger(&sealer, &secrets).await;
        let mut node = controller(1, &sealer);
        node.start_from_recovery(&snapshot).await.unwrap();
        // Replaying the same snapshot again is a no-op.
        node.start_from_recovery(&snapshot).await.unwrap();

        node.apply_secrets(&bundle).await.unwrap();
        let processed = node.private_records_processed();
        assert_eq!(processed, 3);
        assert_eq!(node.apply_secrets(&bundle).await.unwrap(), NodeState::FullyActive);
        assert_eq!(node.private_records_processed(), processed);
    }

    #[tokio::test]
    async fn wrong_boundary_fails_then_resets() {
        let sealer = Arc::new(PlatformSealer::new(b"platform"));
        let foreign = PlatformSealer::new(b"elsewhere");
        let secrets = LedgerSecrets::generate();
        let (snapshot, bundle) = ledger(&sealer, &secrets).await;
        let foreign_bundle = SecretsBundle::seal(&foreign, &secrets).await.unwrap();

        let mut node = controller(1, &sealer);
        let mut status = node.subscribe();
        node.start_from_recovery(&snapshot).await.unwrap();
        assert_matches!(
            node.apply_secrets(&foreign_bundle).await,
            Err(TesseraError::SecretsMismatch { .. })
        );
        assert_eq!(node.state(), NodeState::Failed);
        assert_eq!(*status.borrow_and_update(), NodeState::Failed);

        node.reset_after_mismatch().unwrap();
        assert_eq!(node.apply_secrets(&bundle).await.unwrap(), NodeState::FullyActive);
    }

    #[tokio::test]
    async fn gapped_snapshot_fails_without_becoming_active() {
        let sealer = Arc::new(PlatformSealer::new(b"platform"));
        let snapshot = LedgerSnapshot::new(vec![
            TransactionRecord::public(1, b"a".to_vec()),
            TransactionRecord::public(3, b"c".to_vec()),
        ]);
        let mut node = controller(1, &sealer);
        assert_matches!(
            node.start_from_recovery(&snapshot).await,
            Err(TesseraError::LedgerCorrupt { .. })
        );
        assert_eq!(node.state(), NodeState::Failed);
        assert_eq!(node.replica().committed_index(), 0);
        // A corrupt ledger is not a secrets problem and cannot be reset.
        assert_matches!(
            node.reset_after_mismatch(),
            Err(TesseraError::InvalidTransition { .. })
        );
    }

    #[tokio::test]
    async fn handle_waits_for_state() {
        let sealer = Arc::new(PlatformSealer::new(b"platform"));
        let handle = NodeHandle::new(controller(1, &sealer));
        assert_matches!(
            handle
                .wait_for_state(NodeState::FullyActive, Duration::from_millis(10))
                .await,
            Err(TesseraError::RecoveryTimeout { .. })
        );
        handle
            .lock()
            .await
            .start_fresh(LedgerSecrets::generate())
            .unwrap();
        handle
            .wait_for_state(NodeState::FullyActive, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(handle.state(), NodeState::FullyActive);
    }
}
