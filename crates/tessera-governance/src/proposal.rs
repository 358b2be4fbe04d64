//! Proposal state and threshold arithmetic.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tessera_core::{MemberId, ProposalId};
use tessera_ledger::{ProposalKind, ProposalOutcome};

/// Accept votes needed among `live_members`: `ceil((M + 1) / 2)`, a strict majority.
pub fn quorum_threshold(live_members: usize) -> usize {
    (live_members + 2) / 2
}

/// A member's ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ballot {
    /// In favour
    Accept,
    /// Against
    Reject,
}

impl From<bool> for Ballot {
    fn from(accept: bool) -> Self {
        if accept {
            Ballot::Accept
        } else {
            Ballot::Reject
        }
    }
}

/// A governance proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Proposal identifier
    pub id: ProposalId,
    /// Creating member
    pub proposer: MemberId,
    /// Requested action
    pub kind: ProposalKind,
    /// One ballot per member
    pub votes: BTreeMap<MemberId, Ballot>,
    /// Current outcome
    pub outcome: ProposalOutcome,
}

impl Proposal {
    /// New pending proposal with no votes.
    pub fn new(id: ProposalId, proposer: MemberId, kind: ProposalKind) -> Self {
        Self {
            id,
            proposer,
            kind,
            votes: BTreeMap::new(),
            outcome: ProposalOutcome::Pending,
        }
    }

    /// Accept ballots cast by live members.
    pub fn accept_count(&self, live: &BTreeSet<MemberId>) -> usize {
        self.count(live, Ballot::Accept)
    }

    /// Reject ballots cast by live members.
    pub fn reject_count(&self, live: &BTreeSet<MemberId>) -> usize {
        self.count(live, Ballot::Reject)
    }

    /// Live members that have not voted.
    pub fn undecided_count(&self, live: &BTreeSet<MemberId>) -> usize {
        live.iter().filter(|m| !self.votes.contains_key(*m)).count()
    }

    /// Outcome implied by the current ballots.
    ///
    /// `Completed` once accepts reach the threshold, `Rejected` once the
    /// threshold is out of reach even if every undecided member accepts.
    pub fn evaluate(&self, live: &BTreeSet<MemberId>) -> ProposalOutcome {
        let threshold = quorum_threshold(live.len());
        let accepts = self.accept_count(live);
        if accepts >= threshold {
            ProposalOutcome::Completed
        } else if accepts + self.undecided_count(live) < threshold {
            ProposalOutcome::Rejected
        } else {
            ProposalOutcome::Pending
        }
    }

    fn count(&self, live: &BTreeSet<MemberId>, ballot: Ballot) -> usize {
        self.votes
            .iter()
            .filter(|(member, b)| live.contains(*member) && **b == ballot)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_strict_majority() {
        let expected = [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4)];
        for (members, threshold) in expected {
            assert_eq!(quorum_threshold(members), threshold, "M = {members}");
        }
    }

    #[test]
    fn votes_from_non_live_members_do_not_count() {
        let live: BTreeSet<_> = [MemberId::new(1), MemberId::new(2), MemberId::new(3)]
            .into_iter()
            .collect();
        let mut proposal = Proposal::new(
            ProposalId::new(0),
            MemberId::new(1),
            ProposalKind::RetireNode(tessera_core::NodeId::new(0)),
        );
        proposal.votes.insert(MemberId::new(9), Ballot::Accept);
        proposal.votes.insert(MemberId::new(1), Ballot::Accept);
        assert_eq!(proposal.accept_count(&live), 1);
        assert_eq!(proposal.evaluate(&live), ProposalOutcome::Pending);
        proposal.votes.insert(MemberId::new(2), Ballot::Accept);
        assert_eq!(proposal.evaluate(&live), ProposalOutcome::Completed);
    }
}
