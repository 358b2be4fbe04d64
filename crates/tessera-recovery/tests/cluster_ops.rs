//! Cluster operations outside of recovery: genesis, rotation, commit sync,
//! governance on a running service, node retirement and status reporting.

use assert_matches::assert_matches;
use std::time::Duration;
use tessera_consensus::{ConsensusAdapter, ReplicaLog};
use tessera_core::{MemberId, NodeId, RecoveryConfig, TesseraError};
use tessera_ledger::{
    GovernanceRecord, NodeStatus, ProposalKind, ProposalOutcome, PublicTables, Visibility,
};
use tessera_recovery::{Cluster, ClusterPhase, ClusterStatus, NodeState, RecoveryCoordinator};
use tessera_testkit::{
    crash, fresh_cluster, test_config, test_environment, test_members, Txs,
};

#[tokio::test]
async fn genesis_commits_members_nodes_and_opening() {
    let cluster = fresh_cluster(3, 3).await.unwrap();
    cluster.check_for_service().unwrap();

    let ledger = cluster.export_ledger().unwrap();
    ledger.validate().unwrap();
    let tables = PublicTables::from_records(ledger.records()).unwrap();
    assert_eq!(tables.members.len(), 3);
    assert_eq!(tables.trusted_nodes().count(), 3);
    assert_eq!(tables.last_opened_generation, Some(1));
    assert_eq!(tables.next_node_id(), NodeId::new(3));

    let status = cluster.status();
    assert_eq!(status.phase, ClusterPhase::FullyOpen);
    assert_eq!(status.committed_index, ledger.max_index());
    assert_eq!(status.secrets_generation, Some(1));
    assert!(status.nodes.values().all(|s| *s == NodeState::FullyActive));
    assert_eq!(cluster.governance().threshold(), 2);
}

#[tokio::test]
async fn genesis_preconditions() {
    let env = test_environment();
    let config = RecoveryConfig {
        min_replicas: 3,
        ..test_config()
    };
    assert_matches!(
        Cluster::start_fresh(env.as_ref(), config, test_members(1), 2).await,
        Err(TesseraError::QuorumUnreachable { started: 2, required: 3 })
    );
    assert_matches!(
        Cluster::start_fresh(env.as_ref(), test_config(), Vec::new(), 2).await,
        Err(TesseraError::Invalid { .. })
    );
    let bad = RecoveryConfig {
        max_unseal_retries: 0,
        ..test_config()
    };
    assert_matches!(
        Cluster::start_fresh(env.as_ref(), bad, test_members(1), 1).await,
        Err(TesseraError::Invalid { .. })
    );
}

#[tokio::test]
async fn rotation_keeps_old_transactions_readable() {
    let mut cluster = fresh_cluster(2, 1).await.unwrap();
    let mut txs = Txs::new();
    txs.issue(&cluster, 1, 2).await.unwrap();

    assert_eq!(cluster.rotate_ledger_secrets().await.unwrap(), 2);
    assert_eq!(cluster.rotate_ledger_secrets().await.unwrap(), 3);
    txs.issue(&cluster, 1, 2).await.unwrap();
    txs.verify(&cluster).await.unwrap();

    let vault = cluster.export_sealed_secrets();
    assert_eq!(vault.len(), 3);
    assert_eq!(vault.latest().map(|b| b.generation), Some(3));
    assert_eq!(cluster.status().secrets_generation, Some(3));
    for node in cluster.nodes() {
        let controller = node.lock().await;
        assert_eq!(controller.ledger_secrets().unwrap().current_generation(), 3);
    }
}

#[tokio::test]
async fn commit_sync_matches_the_exported_ledger() {
    let cluster = fresh_cluster(3, 1).await.unwrap();
    Txs::new().issue(&cluster, 3, 3).await.unwrap();

    let (index, digest) = cluster
        .wait_for_commit_sync(Duration::from_secs(1))
        .await
        .unwrap();
    let ledger = cluster.export_ledger().unwrap();
    assert_eq!(index, ledger.max_index());
    assert_eq!(digest, ledger.digest());
    assert_eq!(cluster.adapter().commit_sync_point(), Some((index, digest)));
}

#[tokio::test]
async fn governance_on_a_running_service() {
    let mut cluster = fresh_cluster(1, 3).await.unwrap();
    let custom = ProposalKind::Custom {
        name: "set_constitution".to_string(),
        args: "{}".to_string(),
    };
    let proposal = cluster.propose(MemberId::new(0), custom.clone()).await.unwrap();

    // Custom proposals may be pending side by side.
    let second = cluster.propose(MemberId::new(1), custom).await.unwrap();
    assert_ne!(proposal, second);

    assert_matches!(
        cluster.withdraw(MemberId::new(1), proposal).await,
        Err(TesseraError::Invalid { .. })
    );
    let receipt = cluster.withdraw(MemberId::new(0), proposal).await.unwrap();
    assert_eq!(receipt.outcome, ProposalOutcome::Withdrawn);
    assert_matches!(
        cluster.vote(MemberId::new(2), proposal, true).await,
        Err(TesseraError::ProposalAlreadyDecided { .. })
    );

    cluster.vote(MemberId::new(1), second, true).await.unwrap();
    assert_matches!(
        cluster.vote(MemberId::new(1), second, false).await,
        Err(TesseraError::AlreadyVoted { .. })
    );
    let receipt = cluster.vote(MemberId::new(2), second, true).await.unwrap();
    assert!(receipt.decided_now);
    assert_eq!(receipt.outcome, ProposalOutcome::Completed);

    let bundle = cluster.export_sealed_secrets().latest().cloned().unwrap();
    let recovery = cluster
        .propose(MemberId::new(0), ProposalKind::AcceptRecovery(bundle.clone()))
        .await
        .unwrap();
    assert_matches!(
        cluster
            .propose(MemberId::new(2), ProposalKind::AcceptRecovery(bundle))
            .await,
        Err(TesseraError::DuplicateProposal { .. })
    );
    assert_matches!(
        cluster.vote(MemberId::new(9), recovery, true).await,
        Err(TesseraError::NotAMember { .. })
    );

    let decided: Vec<_> = cluster
        .export_ledger()
        .unwrap()
        .records()
        .iter()
        .filter_map(|r| GovernanceRecord::decode(r).unwrap())
        .filter_map(|g| match g {
            GovernanceRecord::Decided { proposal, outcome } => Some((proposal, outcome)),
            _ => None,
        })
        .collect();
    assert_eq!(
        decided,
        vec![
            (proposal, ProposalOutcome::Withdrawn),
            (second, ProposalOutcome::Completed)
        ]
    );
}

#[tokio::test]
async fn completed_retirement_evicts_the_node() {
    let mut cluster = fresh_cluster(3, 1).await.unwrap();
    let mut txs = Txs::new();
    txs.issue(&cluster, 2, 2).await.unwrap();
    let before = PublicTables::from_records(cluster.export_ledger().unwrap().records()).unwrap();
    let retired = cluster.adapter().replica(NodeId::new(0)).unwrap();

    let proposal = cluster
        .propose(MemberId::new(0), ProposalKind::RetireNode(NodeId::new(0)))
        .await
        .unwrap();
    assert_eq!(cluster.node_ids().len(), 3);
    let receipt = cluster.vote(MemberId::new(0), proposal, true).await.unwrap();
    assert_eq!(receipt.outcome, ProposalOutcome::Completed);

    let remaining = vec![NodeId::new(1), NodeId::new(2)];
    assert_eq!(cluster.node_ids(), remaining);
    assert_eq!(cluster.adapter().replica_ids(), remaining);

    let tables = PublicTables::from_records(cluster.export_ledger().unwrap().records()).unwrap();
    let record = &tables.nodes[&NodeId::new(0)];
    assert_eq!(record.status, NodeStatus::Retired);
    assert_eq!(record.joined_at_index, before.nodes[&NodeId::new(0)].joined_at_index);
    let trusted: Vec<_> = tables.trusted_nodes().map(|n| n.id).collect();
    assert_eq!(trusted, remaining);

    // Later writes replicate to the remaining nodes only.
    let frozen = retired.committed_index();
    txs.issue(&cluster, 1, 1).await.unwrap();
    assert_eq!(retired.committed_index(), frozen);
    assert!(cluster.adapter().committed_index() > frozen);
    txs.verify(&cluster).await.unwrap();
}

#[tokio::test]
async fn retirement_requires_a_member_node_and_spare_replicas() {
    let mut cluster = fresh_cluster(2, 1).await.unwrap();
    assert_matches!(
        cluster
            .propose(MemberId::new(0), ProposalKind::RetireNode(NodeId::new(9)))
            .await,
        Err(TesseraError::Invalid { .. })
    );

    let rejected = cluster
        .propose(MemberId::new(0), ProposalKind::RetireNode(NodeId::new(1)))
        .await
        .unwrap();
    let receipt = cluster.vote(MemberId::new(0), rejected, false).await.unwrap();
    assert_eq!(receipt.outcome, ProposalOutcome::Rejected);
    assert_eq!(cluster.node_ids().len(), 2);

    let mut last = fresh_cluster(1, 1).await.unwrap();
    assert_matches!(
        last.propose(MemberId::new(0), ProposalKind::RetireNode(NodeId::new(0)))
            .await,
        Err(TesseraError::Invalid { .. })
    );
}

#[tokio::test]
async fn application_writes_wait_for_full_opening() {
    let cluster = fresh_cluster(2, 1).await.unwrap();
    Txs::new().issue(&cluster, 1, 1).await.unwrap();
    let crashed = crash(cluster).unwrap();

    let mut coordinator = RecoveryCoordinator::new(test_config(), test_environment());
    coordinator.begin_recovery(crashed.ledger.clone(), 2).await.unwrap();
    coordinator.await_public_sync().await.unwrap();
    let recovering = coordinator.cluster().unwrap();
    assert_eq!(recovering.phase(), ClusterPhase::PublicOnly);
    assert_matches!(
        recovering.submit_transaction(Visibility::Public, b"early").await,
        Err(TesseraError::NotServing { .. })
    );
    assert_matches!(
        recovering.check_for_service(),
        Err(TesseraError::NotServing { .. })
    );

    let ledger = recovering.export_ledger().unwrap();
    let tables = PublicTables::from_records(ledger.records()).unwrap();
    assert_eq!(tables.nodes[&NodeId::new(0)].status, NodeStatus::Retired);
    assert_eq!(tables.nodes[&NodeId::new(2)].status, NodeStatus::Trusted);
}

#[tokio::test]
async fn status_serializes_for_operators() {
    let cluster = fresh_cluster(2, 1).await.unwrap();
    let status = cluster.status();
    let json = serde_json::to_string_pretty(&status).unwrap();
    let parsed: ClusterStatus = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, status);
}
