//! Per-node replica logs
//!
//! A replica log is one node's copy of the committed ledger. It enforces the
//! shared index space: a record is accepted only at exactly the next index,
//! whichever visibility it carries. The consensus adapter and the node
//! lifecycle both write through this interface, never around it.

use parking_lot::RwLock;
use tessera_core::{Hash32, NodeId, TesseraError, TesseraResult};
use tessera_ledger::{LedgerSnapshot, TransactionRecord};
use tokio::sync::watch;

/// One node's committed log.
pub trait ReplicaLog: Send + Sync {
    /// Owning node.
    fn node_id(&self) -> NodeId;

    /// Append a record at exactly `committed_index() + 1`.
    fn append(&self, record: TransactionRecord) -> TesseraResult<u64>;

    /// Highest committed index (0 when empty).
    fn committed_index(&self) -> u64;

    /// Hash-chain tip over every committed record.
    fn digest(&self) -> Hash32;

    /// Record at a 1-based index.
    fn get(&self, index: u64) -> Option<TransactionRecord>;

    /// Records with index `>= from`, in order.
    fn records_from(&self, from: u64) -> Vec<TransactionRecord>;

    /// Watch channel carrying the committed index.
    fn watch_committed(&self) -> watch::Receiver<u64>;

    /// Export every committed record.
    fn export(&self) -> LedgerSnapshot {
        LedgerSnapshot::new(self.records_from(1))
    }
}

#[derive(Debug, Default)]
struct ReplicaState {
    records: Vec<TransactionRecord>,
    tip: Hash32,
}

/// In-memory replica log.
#[derive(Debug)]
pub struct MemoryReplica {
    node: NodeId,
    state: RwLock<ReplicaState>,
    committed: watch::Sender<u64>,
}

impl MemoryReplica {
    /// Empty replica for `node`.
    pub fn new(node: NodeId) -> Self {
        let (committed, _) = watch::channel(0);
        Self {
            node,
            state: RwLock::new(ReplicaState::default()),
            committed,
        }
    }
}

impl ReplicaLog for MemoryReplica {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn append(&self, record: TransactionRecord) -> TesseraResult<u64> {
        let mut state = self.state.write();
        let expected = state.records.len() as u64 + 1;
        if record.index != expected {
            return Err(TesseraError::divergent_replica(
                self.node,
                format!(
                    "append at index {} but next index is {expected}",
                    record.index
                ),
            ));
        }
        state.tip = record.chain_digest(&state.tip);
        state.records.push(record);
        drop(state);
        self.committed.send_replace(expected);
        tracing::trace!(node = %self.node, index = expected, "replica appended");
        Ok(expected)
    }

    fn committed_index(&self) -> u64 {
        self.state.read().records.len() as u64
    }

    fn digest(&self) -> Hash32 {
        self.state.read().tip
    }

    fn get(&self, index: u64) -> Option<TransactionRecord> {
        let position = usize::try_from(index.checked_sub(1)?).ok()?;
        self.state.read().records.get(position).cloned()
    }

    fn records_from(&self, from: u64) -> Vec<TransactionRecord> {
        let start = usize::try_from(from.saturating_sub(1)).unwrap_or(usize::MAX);
        let state = self.state.read();
        state.records.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    fn watch_committed(&self) -> watch::Receiver<u64> {
        self.committed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tessera_ledger::{RecordDomain, Visibility};

    fn record(index: u64, visibility: Visibility) -> TransactionRecord {
        TransactionRecord::new(index, visibility, RecordDomain::Application, vec![index as u8])
    }

    #[test]
    fn append_enforces_shared_index_space() {
        let replica = MemoryReplica::new(NodeId::new(1));
        replica.append(record(1, Visibility::Public)).unwrap();
        replica.append(record(2, Visibility::Private)).unwrap();
        assert_matches!(
            replica.append(record(4, Visibility::Public)),
            Err(TesseraError::DivergentReplica { .. })
        );
        assert_matches!(
            replica.append(record(2, Visibility::Public)),
            Err(TesseraError::DivergentReplica { .. })
        );
        assert_eq!(replica.committed_index(), 2);
    }

    #[test]
    fn digest_matches_snapshot_digest() {
        let replica = MemoryReplica::new(NodeId::new(1));
        for i in 1..=5 {
            replica.append(record(i, Visibility::Public)).unwrap();
        }
        let exported = replica.export();
        exported.validate().unwrap();
        assert_eq!(exported.digest(), replica.digest());
        assert_eq!(replica.records_from(4).len(), 2);
        assert!(replica.records_from(9).is_empty());
        assert_eq!(replica.get(5).map(|r| r.index), Some(5));
    }

    #[test]
    fn watch_tracks_commits() {
        let replica = MemoryReplica::new(NodeId::new(1));
        let rx = replica.watch_committed();
        replica.append(record(1, Visibility::Public)).unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
