//! Quorum arithmetic over every vote ordering for small member sets.

use assert_matches::assert_matches;
use proptest::prelude::*;
use tessera_core::{MemberId, TesseraError};
use tessera_governance::{quorum_threshold, QuorumEngine};
use tessera_ledger::{Member, ProposalKind, ProposalOutcome, SecretsBundle};

fn engine(members: usize) -> QuorumEngine {
    QuorumEngine::new(
        (0..members as u64).map(|i| Member::new(MemberId::new(i), i.to_le_bytes().to_vec())),
    )
}

fn accept_recovery() -> ProposalKind {
    ProposalKind::AcceptRecovery(SecretsBundle {
        generation: 1,
        sealed_blob: vec![0x5e, 0xa1],
    })
}

fn permutations(items: &[u64]) -> Vec<Vec<u64>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for (i, head) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, *head);
            out.push(tail);
        }
    }
    out
}

/// Replays one ballot sequence and checks every intermediate outcome.
fn check_sequence(members: usize, order: &[u64], ballots: &[bool]) {
    let threshold = quorum_threshold(members);
    let mut gov = engine(members);
    let id = gov
        .propose(MemberId::new(order[0]), accept_recovery())
        .unwrap()
        .proposal;

    let mut accepts = 0;
    let mut cast = 0;
    for (&member, &accept) in order.iter().zip(ballots) {
        let receipt = gov.vote(MemberId::new(member), id, accept).unwrap();
        cast += 1;
        if accept {
            accepts += 1;
        }

        let expected = if accepts >= threshold {
            ProposalOutcome::Completed
        } else if accepts + (members - cast) < threshold {
            ProposalOutcome::Rejected
        } else {
            ProposalOutcome::Pending
        };
        assert_eq!(
            receipt.outcome, expected,
            "M = {members}, order = {order:?}, ballots = {ballots:?}, after {cast} votes"
        );

        if !expected.is_pending() {
            assert!(receipt.decided_now);
            if let Some(&late) = order.get(cast) {
                assert_matches!(
                    gov.vote(MemberId::new(late), id, true),
                    Err(TesseraError::ProposalAlreadyDecided { .. })
                );
            }
            return;
        }
        assert!(!receipt.decided_now);
    }
    panic!("M = {members}: every member voted and the proposal is still pending");
}

#[test]
fn every_vote_permutation_for_small_member_sets() {
    for members in 1..=5usize {
        let ids: Vec<u64> = (0..members as u64).collect();
        let orders = permutations(&ids);
        for order in &orders {
            for mask in 0..(1u32 << members) {
                let ballots: Vec<bool> = (0..members).map(|i| mask & (1 << i) != 0).collect();
                check_sequence(members, order, &ballots);
            }
        }
    }
}

#[test]
fn completion_happens_on_the_exact_threshold_vote() {
    for members in 1..=5usize {
        let threshold = quorum_threshold(members);
        let mut gov = engine(members);
        let id = gov
            .propose(MemberId::new(0), accept_recovery())
            .unwrap()
            .proposal;
        for i in 0..threshold as u64 {
            let receipt = gov.vote(MemberId::new(i), id, true).unwrap();
            let last = i as usize + 1 == threshold;
            assert_eq!(receipt.decided_now, last, "M = {members}, vote {i}");
        }
        assert_eq!(
            gov.proposal(id).map(|p| p.outcome),
            Some(ProposalOutcome::Completed)
        );
    }
}

proptest! {
    #[test]
    fn threshold_is_smallest_strict_majority(members in 1usize..64) {
        let threshold = quorum_threshold(members);
        prop_assert!(2 * threshold > members);
        prop_assert!(2 * (threshold - 1) <= members);
    }

    #[test]
    fn outcome_never_leaves_a_decided_state(
        members in 1usize..8,
        ballots in proptest::collection::vec(any::<bool>(), 8),
    ) {
        let mut gov = engine(members);
        let id = gov.propose(MemberId::new(0), accept_recovery()).unwrap().proposal;
        let mut decided = None;
        for (member, accept) in ballots.into_iter().take(members).enumerate() {
            let result = gov.vote(MemberId::new(member as u64), id, accept);
            match decided {
                None => {
                    let receipt = result.unwrap();
                    if !receipt.outcome.is_pending() {
                        decided = Some(receipt.outcome);
                    }
                }
                Some(_) => prop_assert!(result.is_err()),
            }
        }
        prop_assert_eq!(gov.proposal(id).map(|p| p.outcome), decided.or(Some(ProposalOutcome::Pending)));
    }
}
