//! Consensus adapter
//!
//! Black-box agreement layer used by the recovery core. It offers exactly
//! three things: submit a transaction and learn its index, read the committed
//! index, and wait until an index is durably committed on a quorum.
//!
//! [`ReplicatedLog`] is the in-process implementation: a leader-assigned
//! index fanned out to every member replica. It is the single point of
//! serialization across visibility classes.

use crate::replica::ReplicaLog;
use async_trait::async_trait;
use futures::future::select_all;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tessera_core::{Hash32, NodeId, TesseraError, TesseraResult};
use tessera_ledger::PendingTransaction;

/// Agreement on transaction order.
#[async_trait]
pub trait ConsensusAdapter: Send + Sync {
    /// Order a transaction; returns its committed index.
    async fn submit(&self, tx: PendingTransaction) -> TesseraResult<u64>;

    /// Highest index committed on a quorum of replicas.
    fn committed_index(&self) -> u64;

    /// Resolve once `index` is durably committed on a quorum of replicas.
    async fn subscribe(&self, index: u64) -> TesseraResult<()>;
}

/// Quorum size for `n` replicas (strict majority).
pub fn replica_quorum(n: usize) -> usize {
    n / 2 + 1
}

/// In-process replicated log over a set of replica logs.
///
/// The first replica is the leader; it assigns indices. Evicted replicas stop
/// receiving records and stop counting toward the quorum.
pub struct ReplicatedLog {
    replicas: RwLock<Vec<Arc<dyn ReplicaLog>>>,
    order: Mutex<()>,
}

impl std::fmt::Debug for ReplicatedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedLog")
            .field("replicas", &self.replica_ids())
            .field("committed_index", &self.committed_index())
            .finish()
    }
}

impl ReplicatedLog {
    /// Replicated log over the given replicas, leader first.
    pub fn new(replicas: Vec<Arc<dyn ReplicaLog>>) -> Self {
        Self {
            replicas: RwLock::new(replicas),
            order: Mutex::new(()),
        }
    }

    /// Member replica identifiers, leader first.
    pub fn replica_ids(&self) -> Vec<NodeId> {
        self.replicas.read().iter().map(|r| r.node_id()).collect()
    }

    /// Number of member replicas.
    pub fn len(&self) -> usize {
        self.replicas.read().len()
    }

    /// Whether there are no member replicas.
    pub fn is_empty(&self) -> bool {
        self.replicas.read().is_empty()
    }

    /// Current leader.
    pub fn leader(&self) -> Option<NodeId> {
        self.replicas.read().first().map(|r| r.node_id())
    }

    /// Replica handle for a node.
    pub fn replica(&self, node: NodeId) -> Option<Arc<dyn ReplicaLog>> {
        self.replicas
            .read()
            .iter()
            .find(|r| r.node_id() == node)
            .cloned()
    }

    /// Add a replica. It must already hold the committed prefix.
    pub fn add_replica(&self, replica: Arc<dyn ReplicaLog>) -> TesseraResult<()> {
        let _order = self.order.lock();
        let mut replicas = self.replicas.write();
        if let Some(leader) = replicas.first() {
            if replica.committed_index() != leader.committed_index()
                || replica.digest() != leader.digest()
            {
                return Err(TesseraError::divergent_replica(
                    replica.node_id(),
                    "joining replica does not match the leader's log",
                ));
            }
        }
        replicas.push(replica);
        Ok(())
    }

    /// Remove a replica from the membership. Returns whether it was present.
    pub fn evict(&self, node: NodeId) -> bool {
        let _order = self.order.lock();
        let mut replicas = self.replicas.write();
        let before = replicas.len();
        replicas.retain(|r| r.node_id() != node);
        let evicted = replicas.len() != before;
        if evicted {
            tracing::warn!(node = %node, remaining = replicas.len(), "evicted replica");
        }
        evicted
    }

    /// Common `(committed index, digest)` if every replica agrees.
    pub fn commit_sync_point(&self) -> Option<(u64, Hash32)> {
        let replicas = self.replicas.read();
        let first = replicas.first()?;
        let point = (first.committed_index(), first.digest());
        replicas
            .iter()
            .all(|r| (r.committed_index(), r.digest()) == point)
            .then_some(point)
    }

    fn submit_ordered(&self, tx: PendingTransaction) -> TesseraResult<u64> {
        let _order = self.order.lock();
        let replicas = self.replicas.read().clone();
        let leader = replicas
            .first()
            .ok_or_else(|| TesseraError::quorum_unreachable(0, 1))?;
        let index = leader.committed_index() + 1;
        let record = tx.at_index(index);

        let mut acknowledged = 0usize;
        for replica in &replicas {
            match replica.append(record.clone()) {
                Ok(_) => acknowledged += 1,
                Err(e) => {
                    tracing::warn!(node = %replica.node_id(), index, error = %e, "replica rejected record");
                }
            }
        }

        let required = replica_quorum(replicas.len());
        if acknowledged < required {
            return Err(TesseraError::quorum_unreachable(acknowledged, required));
        }
        tracing::trace!(index, acknowledged, "record committed");
        Ok(index)
    }
}

#[async_trait]
impl ConsensusAdapter for ReplicatedLog {
    async fn submit(&self, tx: PendingTransaction) -> TesseraResult<u64> {
        self.submit_ordered(tx)
    }

    fn committed_index(&self) -> u64 {
        let replicas = self.replicas.read();
        if replicas.is_empty() {
            return 0;
        }
        let mut indices: Vec<u64> = replicas.iter().map(|r| r.committed_index()).collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices[replica_quorum(indices.len()) - 1]
    }

    async fn subscribe(&self, index: u64) -> TesseraResult<()> {
        let mut receivers: Vec<_> = self
            .replicas
            .read()
            .iter()
            .map(|r| r.watch_committed())
            .collect();
        if receivers.is_empty() {
            return Err(TesseraError::quorum_unreachable(0, 1));
        }
        let required = replica_quorum(receivers.len());

        loop {
            let reached = receivers.iter().filter(|rx| *rx.borrow() >= index).count();
            if reached >= required {
                return Ok(());
            }
            let (changed, _, _) =
                select_all(receivers.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
            if changed.is_err() {
                return Err(TesseraError::internal(format!(
                    "replica closed while waiting for index {index}"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::MemoryReplica;
    use tessera_ledger::{RecordDomain, TransactionRecord, Visibility};

    fn replicas(n: u64) -> Vec<Arc<dyn ReplicaLog>> {
        (0..n)
            .map(|i| Arc::new(MemoryReplica::new(NodeId::new(i))) as Arc<dyn ReplicaLog>)
            .collect()
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(replica_quorum(1), 1);
        assert_eq!(replica_quorum(2), 2);
        assert_eq!(replica_quorum(3), 2);
        assert_eq!(replica_quorum(4), 3);
    }

    #[tokio::test]
    async fn submit_assigns_shared_indices() {
        let log = ReplicatedLog::new(replicas(2));
        let a = log
            .submit(PendingTransaction::public(RecordDomain::Application, b"a".to_vec()))
            .await
            .unwrap();
        let b = log
            .submit(PendingTransaction::private(b"ciphertext".to_vec()))
            .await
            .unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(log.committed_index(), 2);
        let (index, _) = log.commit_sync_point().unwrap();
        assert_eq!(index, 2);
        let record = log.replica(NodeId::new(1)).unwrap().get(2).unwrap();
        assert_eq!(record.visibility, Visibility::Private);
    }

    #[tokio::test]
    async fn subscribe_waits_for_quorum() {
        let log = Arc::new(ReplicatedLog::new(replicas(3)));
        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.subscribe(1).await })
        };
        tokio::task::yield_now().await;
        log.submit(PendingTransaction::public(RecordDomain::Application, vec![1]))
            .await
            .unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lagging_replica_breaks_sync_but_not_quorum() {
        let replicas = replicas(3);
        replicas[2]
            .append(TransactionRecord::public(1, b"stray".to_vec()))
            .unwrap();
        let log = ReplicatedLog::new(replicas);
        let index = log
            .submit(PendingTransaction::public(RecordDomain::Application, vec![1]))
            .await
            .unwrap();
        assert_eq!(index, 1);
        assert!(log.commit_sync_point().is_none());

        assert!(log.evict(NodeId::new(2)));
        assert!(log.commit_sync_point().is_some());
        assert!(!log.evict(NodeId::new(2)));
    }

    #[test]
    fn add_replica_requires_matching_log() {
        let log = ReplicatedLog::new(replicas(1));
        let fresh: Arc<dyn ReplicaLog> = Arc::new(MemoryReplica::new(NodeId::new(7)));
        log.add_replica(fresh).unwrap();

        let stray = Arc::new(MemoryReplica::new(NodeId::new(8)));
        stray
            .append(TransactionRecord::public(1, b"x".to_vec()))
            .unwrap();
        assert!(log.add_replica(stray).is_err());
        assert_eq!(log.len(), 2);
    }
}
