//! Governance quorum engine
//!
//! Threshold voting over a fixed member set. The engine is effect-free: every
//! operation returns the governance records it produced, and the caller
//! commits them through the consensus adapter so governance activity is
//! replicated like any other transaction.
//!
//! Threshold evaluation happens inside [`QuorumEngine::vote`]; the caller of
//! the deciding vote sees the outcome transition in the returned
//! [`VoteReceipt`] with no polling step.

use crate::proposal::{quorum_threshold, Ballot, Proposal};
use std::collections::{BTreeMap, BTreeSet};
use tessera_core::{MemberId, ProposalId, TesseraError, TesseraResult};
use tessera_ledger::{GovernanceRecord, Member, ProposalKind, ProposalOutcome, PublicTables};

/// Result of creating a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalReceipt {
    /// Identifier of the new proposal
    pub proposal: ProposalId,
    /// Records to commit
    pub records: Vec<GovernanceRecord>,
}

/// Result of a vote or withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteReceipt {
    /// Target proposal
    pub proposal: ProposalId,
    /// Outcome after this ballot
    pub outcome: ProposalOutcome,
    /// Whether this ballot moved the proposal out of `Pending`
    pub decided_now: bool,
    /// Records to commit
    pub records: Vec<GovernanceRecord>,
}

/// Threshold-voting engine.
#[derive(Debug, Clone, Default)]
pub struct QuorumEngine {
    members: BTreeMap<MemberId, Member>,
    proposals: BTreeMap<ProposalId, Proposal>,
    next_id: ProposalId,
}

impl QuorumEngine {
    /// Engine over a fixed member set.
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            members: members.into_iter().map(|m| (m.id, m)).collect(),
            proposals: BTreeMap::new(),
            next_id: ProposalId::new(0),
        }
    }

    /// Engine rebuilt from ledger tables. Proposal identifiers continue after
    /// the highest one in the ledger so they never repeat across recoveries.
    pub fn from_tables(tables: &PublicTables) -> Self {
        let mut engine = Self::new(tables.members.values().cloned());
        engine.next_id = tables
            .last_proposal
            .map(ProposalId::next)
            .unwrap_or(ProposalId::new(0));
        engine
    }

    /// Members entitled to vote.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Whether `member` belongs to the member set.
    pub fn is_member(&self, member: MemberId) -> bool {
        self.members.contains_key(&member)
    }

    /// Number of members entitled to vote.
    pub fn live_member_count(&self) -> usize {
        self.members.len()
    }

    /// Accept votes currently required to complete a proposal.
    pub fn threshold(&self) -> usize {
        quorum_threshold(self.live_member_count())
    }

    /// Look up a proposal.
    pub fn proposal(&self, id: ProposalId) -> Option<&Proposal> {
        self.proposals.get(&id)
    }

    /// Proposals still open for votes.
    pub fn pending(&self) -> impl Iterator<Item = &Proposal> {
        self.proposals.values().filter(|p| p.outcome.is_pending())
    }

    /// Create a proposal. The proposer's ballot is not implied.
    pub fn propose(
        &mut self,
        member: MemberId,
        kind: ProposalKind,
    ) -> TesseraResult<ProposalReceipt> {
        self.require_member(member)?;

        if kind.is_one_shot() {
            if let Some(existing) = self.pending().find(|p| p.kind == kind) {
                return Err(TesseraError::duplicate_proposal(existing.id));
            }
        }

        let id = self.next_id;
        self.next_id = id.next();
        tracing::info!(proposal = %id, proposer = %member, kind = kind.tag(), "proposal created");

        let record = GovernanceRecord::Proposed {
            proposal: id,
            proposer: member,
            kind: kind.clone(),
        };
        self.proposals.insert(id, Proposal::new(id, member, kind));
        Ok(ProposalReceipt {
            proposal: id,
            records: vec![record],
        })
    }

    /// Cast a ballot and evaluate the threshold.
    pub fn vote(
        &mut self,
        member: MemberId,
        proposal_id: ProposalId,
        accept: bool,
    ) -> TesseraResult<VoteReceipt> {
        self.require_member(member)?;
        let live = self.live_members();
        let proposal = self
            .proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| TesseraError::proposal_not_found(proposal_id))?;

        if !proposal.outcome.is_pending() {
            return Err(TesseraError::proposal_already_decided(
                proposal_id,
                proposal.outcome,
            ));
        }
        if proposal.votes.contains_key(&member) {
            return Err(TesseraError::already_voted(member, proposal_id));
        }

        proposal.votes.insert(member, Ballot::from(accept));
        let mut records = vec![GovernanceRecord::Voted {
            proposal: proposal_id,
            member,
            accept,
        }];

        let outcome = proposal.evaluate(&live);
        let decided_now = !outcome.is_pending();
        if decided_now {
            proposal.outcome = outcome;
            records.push(GovernanceRecord::Decided {
                proposal: proposal_id,
                outcome,
            });
            tracing::info!(
                proposal = %proposal_id,
                %outcome,
                accepts = proposal.accept_count(&live),
                threshold = quorum_threshold(live.len()),
                "proposal decided"
            );
        } else {
            tracing::debug!(proposal = %proposal_id, member = %member, accept, "vote recorded");
        }

        Ok(VoteReceipt {
            proposal: proposal_id,
            outcome,
            decided_now,
            records,
        })
    }

    /// Withdraw an open proposal. Only its proposer may do so.
    pub fn withdraw(
        &mut self,
        member: MemberId,
        proposal_id: ProposalId,
    ) -> TesseraResult<VoteReceipt> {
        self.require_member(member)?;
        let proposal = self
            .proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| TesseraError::proposal_not_found(proposal_id))?;
        if proposal.proposer != member {
            return Err(TesseraError::invalid(format!(
                "{proposal_id} can only be withdrawn by proposer {}, not {member}",
                proposal.proposer
            )));
        }
        if !proposal.outcome.is_pending() {
            return Err(TesseraError::proposal_already_decided(
                proposal_id,
                proposal.outcome,
            ));
        }
        proposal.outcome = ProposalOutcome::Withdrawn;
        tracing::info!(proposal = %proposal_id, "proposal withdrawn");
        Ok(VoteReceipt {
            proposal: proposal_id,
            outcome: ProposalOutcome::Withdrawn,
            decided_now: true,
            records: vec![GovernanceRecord::Decided {
                proposal: proposal_id,
                outcome: ProposalOutcome::Withdrawn,
            }],
        })
    }

    fn require_member(&self, member: MemberId) -> TesseraResult<()> {
        if self.is_member(member) {
            Ok(())
        } else {
            Err(TesseraError::not_a_member(member))
        }
    }

    fn live_members(&self) -> BTreeSet<MemberId> {
        self.members.keys().copied().collect()
    }
}
