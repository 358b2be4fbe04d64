//! Transaction generator
//!
//! Issues batches of public and private application transactions and
//! remembers every committed payload by index, so any later cluster
//! (including one recovered several crashes later) can be checked against
//! everything ever committed.

use std::collections::BTreeMap;
use tessera_core::{TesseraError, TesseraResult};
use tessera_ledger::Visibility;
use tessera_recovery::Cluster;

/// A committed application transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTx {
    /// Public or private
    pub visibility: Visibility,
    /// Plaintext payload
    pub payload: Vec<u8>,
}

/// Every application transaction issued so far, by index.
#[derive(Debug, Clone, Default)]
pub struct Txs {
    issued: BTreeMap<u64, IssuedTx>,
    next_message: u64,
}

impl Txs {
    /// Empty generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit `public` public then `private` private transactions.
    pub async fn issue(
        &mut self,
        cluster: &Cluster,
        public: usize,
        private: usize,
    ) -> TesseraResult<()> {
        let batch = std::iter::repeat(Visibility::Public)
            .take(public)
            .chain(std::iter::repeat(Visibility::Private).take(private));
        for visibility in batch {
            let payload = format!("{visibility} message {}", self.next_message).into_bytes();
            self.next_message += 1;
            let index = cluster.submit_transaction(visibility, &payload).await?;
            self.issued.insert(index, IssuedTx { visibility, payload });
        }
        tracing::debug!(public, private, total = self.issued.len(), "issued transactions");
        Ok(())
    }

    /// Check that every node of `cluster` exposes every issued transaction unchanged.
    pub async fn verify(&self, cluster: &Cluster) -> TesseraResult<()> {
        for node in cluster.node_ids() {
            for (index, tx) in &self.issued {
                let found = cluster.read(node, *index).await?;
                if found != tx.payload {
                    return Err(TesseraError::internal(format!(
                        "{node} returned a different {} payload at index {index}",
                        tx.visibility
                    )));
                }
            }
        }
        Ok(())
    }

    /// Issued transactions by index.
    pub fn issued(&self) -> &BTreeMap<u64, IssuedTx> {
        &self.issued
    }

    /// Highest index issued.
    pub fn highest_index(&self) -> u64 {
        self.issued.keys().next_back().copied().unwrap_or(0)
    }

    /// Number of issued transactions.
    pub fn len(&self) -> usize {
        self.issued.len()
    }

    /// Whether nothing was issued.
    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}
