//! Reserved internal schema
//!
//! Node and governance tables are not held as out-of-band global state. They
//! are ordinary public records in the `Nodes` and `Governance` domains, so
//! every replica sees the same tables at the same index and a recovering
//! cluster rebuilds them by replaying the ledger.
//!
//! Payloads are JSON so the tables stay readable in exported ledgers.

use crate::record::{PendingTransaction, RecordDomain, TransactionRecord};
use crate::vault::SecretsBundle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tessera_core::{MemberId, NodeId, ProposalId, TesseraError, TesseraResult};

// =============================================================================
// NODE TABLE
// =============================================================================

/// Membership status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Joined but not yet trusted
    Pending,
    /// Full replica
    Trusted,
    /// Removed from the node set
    Retired,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Trusted => "TRUSTED",
            NodeStatus::Retired => "RETIRED",
        };
        f.write_str(name)
    }
}

/// Row of the node table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node identifier
    pub id: NodeId,
    /// Status after this transition
    pub status: NodeStatus,
    /// Ledger index at which the node joined
    pub joined_at_index: u64,
}

impl NodeRecord {
    /// Encode as a pending public transaction.
    pub fn to_pending(&self) -> TesseraResult<PendingTransaction> {
        Ok(PendingTransaction::public(
            RecordDomain::Nodes,
            serde_json::to_vec(self)?,
        ))
    }

    /// Decode from a committed record; `None` for other domains.
    pub fn decode(record: &TransactionRecord) -> TesseraResult<Option<Self>> {
        decode_domain(record, RecordDomain::Nodes)
    }
}

// =============================================================================
// GOVERNANCE TABLE
// =============================================================================

/// A governance principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member identifier
    pub id: MemberId,
    /// Member's public key, hex-encoded on the wire
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
}

impl Member {
    /// Create a member.
    pub fn new(id: MemberId, public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            public_key: public_key.into(),
        }
    }
}

/// What a proposal asks the service to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalKind {
    /// Release the sealed ledger secrets to a recovering cluster
    AcceptRecovery(SecretsBundle),
    /// Retire a node from the node table
    RetireNode(NodeId),
    /// Any other governance action, opaque to the recovery core
    Custom {
        /// Action name
        name: String,
        /// Action arguments
        args: String,
    },
}

impl ProposalKind {
    /// Whether at most one identical proposal of this kind may be pending.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, ProposalKind::AcceptRecovery(_))
    }

    /// Stable kind tag for records and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            ProposalKind::AcceptRecovery(_) => "accept_recovery",
            ProposalKind::RetireNode(_) => "retire_node",
            ProposalKind::Custom { .. } => "custom",
        }
    }
}

/// Lifecycle outcome of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalOutcome {
    /// Open for votes
    Pending,
    /// Accept votes reached the threshold
    Completed,
    /// Threshold can no longer be reached
    Rejected,
    /// Withdrawn by its proposer
    Withdrawn,
}

impl ProposalOutcome {
    /// Whether the proposal is still open.
    pub fn is_pending(self) -> bool {
        self == ProposalOutcome::Pending
    }
}

impl fmt::Display for ProposalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProposalOutcome::Pending => "Pending",
            ProposalOutcome::Completed => "Completed",
            ProposalOutcome::Rejected => "Rejected",
            ProposalOutcome::Withdrawn => "Withdrawn",
        };
        f.write_str(name)
    }
}

/// Governance activity, committed as public records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GovernanceRecord {
    /// A member joined the consortium
    MemberAdded {
        /// The new member
        member: Member,
    },
    /// A proposal was created
    Proposed {
        /// Proposal identifier
        proposal: ProposalId,
        /// Creating member
        proposer: MemberId,
        /// Requested action
        kind: ProposalKind,
    },
    /// A member voted
    Voted {
        /// Target proposal
        proposal: ProposalId,
        /// Voting member
        member: MemberId,
        /// Accept or reject
        accept: bool,
    },
    /// A proposal left the pending state
    Decided {
        /// Target proposal
        proposal: ProposalId,
        /// Final outcome
        outcome: ProposalOutcome,
    },
    /// The service opened for application traffic
    ServiceOpened {
        /// Ledger secrets generation in use when the service opened
        generation: u64,
    },
}

impl GovernanceRecord {
    /// Encode as a pending public transaction.
    pub fn to_pending(&self) -> TesseraResult<PendingTransaction> {
        Ok(PendingTransaction::public(
            RecordDomain::Governance,
            serde_json::to_vec(self)?,
        ))
    }

    /// Decode from a committed record; `None` for other domains.
    pub fn decode(record: &TransactionRecord) -> TesseraResult<Option<Self>> {
        decode_domain(record, RecordDomain::Governance)
    }
}

fn decode_domain<T: for<'de> Deserialize<'de>>(
    record: &TransactionRecord,
    domain: RecordDomain,
) -> TesseraResult<Option<T>> {
    if record.domain != domain {
        return Ok(None);
    }
    if !record.is_public() {
        return Err(TesseraError::ledger_corrupt(format!(
            "internal record at index {} is not public",
            record.index
        )));
    }
    serde_json::from_slice(&record.payload)
        .map(Some)
        .map_err(|e| {
            TesseraError::ledger_corrupt(format!(
                "undecodable internal record at index {}: {e}",
                record.index
            ))
        })
}

// =============================================================================
// DERIVED TABLES
// =============================================================================

/// Node and member tables folded from the internal records of a ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicTables {
    /// Latest record per node
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    /// Consortium members
    pub members: BTreeMap<MemberId, Member>,
    /// Highest proposal identifier seen
    pub last_proposal: Option<ProposalId>,
    /// Generation recorded by the most recent `ServiceOpened`
    pub last_opened_generation: Option<u64>,
}

impl PublicTables {
    /// Fold tables from records in index order.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a TransactionRecord>,
    ) -> TesseraResult<Self> {
        let mut tables = Self::default();
        for record in records {
            tables.apply(record)?;
        }
        Ok(tables)
    }

    /// Apply one committed record.
    pub fn apply(&mut self, record: &TransactionRecord) -> TesseraResult<()> {
        if let Some(node) = NodeRecord::decode(record)? {
            self.nodes.insert(node.id, node);
        } else if let Some(governance) = GovernanceRecord::decode(record)? {
            match governance {
                GovernanceRecord::MemberAdded { member } => {
                    self.members.insert(member.id, member);
                }
                GovernanceRecord::Proposed { proposal, .. } => {
                    self.last_proposal = self.last_proposal.max(Some(proposal));
                }
                GovernanceRecord::ServiceOpened { generation } => {
                    self.last_opened_generation = Some(generation);
                }
                GovernanceRecord::Voted { .. } | GovernanceRecord::Decided { .. } => {}
            }
        }
        Ok(())
    }

    /// Nodes whose latest status is `Trusted`.
    pub fn trusted_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Trusted)
    }

    /// First node identifier not yet used by the table.
    pub fn next_node_id(&self) -> NodeId {
        self.nodes
            .keys()
            .next_back()
            .map(|id| id.next())
            .unwrap_or(NodeId::new(0))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn commit(records: &mut Vec<TransactionRecord>, pending: PendingTransaction) {
        let index = records.len() as u64 + 1;
        records.push(pending.at_index(index));
    }

    #[test]
    fn tables_fold_latest_node_status() {
        let mut records = Vec::new();
        for id in 0..2 {
            let node = NodeRecord {
                id: NodeId::new(id),
                status: NodeStatus::Trusted,
                joined_at_index: 1,
            };
            commit(&mut records, node.to_pending().unwrap());
        }
        let retired = NodeRecord {
            id: NodeId::new(0),
            status: NodeStatus::Retired,
            joined_at_index: 1,
        };
        commit(&mut records, retired.to_pending().unwrap());
        commit(
            &mut records,
            GovernanceRecord::MemberAdded {
                member: Member::new(MemberId::new(4), vec![0xab, 0xcd]),
            }
            .to_pending()
            .unwrap(),
        );
        commit(
            &mut records,
            PendingTransaction::public(RecordDomain::Application, b"app".to_vec()),
        );

        let tables = PublicTables::from_records(&records).unwrap();
        let trusted: Vec<_> = tables.trusted_nodes().map(|n| n.id).collect();
        assert_eq!(trusted, vec![NodeId::new(1)]);
        assert_eq!(tables.next_node_id(), NodeId::new(2));
        assert_eq!(tables.members[&MemberId::new(4)].public_key, vec![0xab, 0xcd]);
    }

    #[test]
    fn member_key_is_hex_on_the_wire() {
        let record = GovernanceRecord::MemberAdded {
            member: Member::new(MemberId::new(1), vec![0x01, 0xff]),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"01ff\""));
        assert!(json.contains("\"type\":\"member_added\""));
    }

    #[test]
    fn private_internal_record_is_corrupt() {
        let mut record = NodeRecord {
            id: NodeId::new(0),
            status: NodeStatus::Pending,
            joined_at_index: 0,
        }
        .to_pending()
        .unwrap()
        .at_index(1);
        record.visibility = crate::record::Visibility::Private;
        assert_matches!(
            NodeRecord::decode(&record),
            Err(TesseraError::LedgerCorrupt { .. })
        );
    }

    #[test]
    fn one_shot_kinds() {
        assert!(!ProposalKind::RetireNode(NodeId::new(1)).is_one_shot());
        assert_eq!(
            ProposalKind::Custom {
                name: "x".into(),
                args: String::new()
            }
            .tag(),
            "custom"
        );
    }
}
