//! Network partition tests for election and proposal behavior.
//!
//! A partitioned leader is never demoted for silence; it only steps down once
//! it hears of a higher term after the partition heals.


use std::time::Duration;

use mace_consensus::raft::rpc::{ProposeOutcome, ProposeRequest};
use mace_consensus::raft::{NodeId, RaftRole};
use test_harness::{assert_eventually, TestCluster, ELECTION_WAIT};
use uuid::Uuid;

/// Split the cluster so that `keep` is on the three-member side.
fn split_around(keep: NodeId) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut majority = vec![keep];
    let mut minority = Vec::new();
    for id in 1..=5u64 {
        if id == keep {
            continue;
        }
        if majority.len() < 3 {
            majority.push(id);
        } else {
            minority.push(id);
        }
    }
    (majority, minority)
}

#[tokio::test(start_paused = true)]
async fn test_isolated_leader_is_replaced() {
    let mut cluster = TestCluster::new(5).await;
    let old_leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let old_term = cluster.status(old_leader).term;

    cluster.driver.isolate(old_leader).await;

    let new_leader = cluster
        .wait_for_new_leader(old_term, ELECTION_WAIT)
        .await
        .expect("Connected members should elect a new leader");
    assert_ne!(new_leader.id, old_leader);
    assert!(new_leader.term > old_term);

    // Nothing told the old leader about the new term yet
    let stale = cluster.status(old_leader);
    assert_eq!(stale.role, RaftRole::Leader);
    assert_eq!(stale.term, old_term);

    // The coordinator follows the highest term
    let result = cluster.propose("after failover").await;
    assert!(result.committed, "{result:?}");
    assert_eq!(result.term, new_leader.term);

    cluster.assert_invariants();
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_leader_cannot_commit() {
    let mut cluster = TestCluster::new(5).await;
    let old_leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let old_term = cluster.status(old_leader).term;

    cluster.driver.isolate(old_leader).await;
    cluster
        .wait_for_new_leader(old_term, ELECTION_WAIT)
        .await
        .expect("Connected members should elect a new leader");

    // Go straight to the stale leader instead of through the coordinator
    let link = cluster.driver.network().client_link();
    let resp = link
        .propose(
            old_leader,
            ProposeRequest {
                proposal_id: Uuid::new_v4(),
                term: old_term,
                payload: b"from the past".to_vec(),
            },
        )
        .await
        .expect("client link to the stale leader is intact");

    assert_ne!(resp.outcome, ProposeOutcome::Committed);
    assert_eq!(resp.accepted_by, vec![old_leader]);

    cluster.assert_invariants();
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_leader_steps_down_after_heal() {
    let mut cluster = TestCluster::new(5).await;
    let old_leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let old_term = cluster.status(old_leader).term;

    cluster.driver.isolate(old_leader).await;
    let new_leader = cluster
        .wait_for_new_leader(old_term, ELECTION_WAIT)
        .await
        .unwrap();

    cluster.driver.heal(old_leader).await;

    assert_eventually(
        || async { cluster.status(old_leader).role == RaftRole::Follower },
        Duration::from_secs(2),
        "old leader should step down once it sees the new term",
    )
    .await;

    let status = cluster.status(old_leader);
    assert!(status.term >= new_leader.term);
    assert_eq!(cluster.count_leaders(), 1);

    cluster.assert_invariants();
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_minority_partition_cannot_elect_leader() {
    let mut cluster = TestCluster::new(5).await;
    let leader_id = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let (majority, minority) = split_around(leader_id);

    cluster.driver.partition(&majority, &minority).await;
    cluster.run_for(Duration::from_secs(3)).await;

    for id in &minority {
        assert_ne!(
            cluster.status(*id).role,
            RaftRole::Leader,
            "minority member {id} must not lead"
        );
    }
    assert_eq!(cluster.leader().map(|s| s.id), Some(leader_id));

    cluster.driver.heal_partition(&majority, &minority).await;

    assert_eventually(
        || async { cluster.count_leaders() == 1 },
        ELECTION_WAIT,
        "cluster should converge on one leader after healing",
    )
    .await;

    cluster.assert_invariants();
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_majority_partition_elects_leader() {
    let mut cluster = TestCluster::new(5).await;
    let leader_id = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();

    // Put the leader on the minority side this time
    let (rest, _) = split_around(leader_id);
    let minority: Vec<NodeId> = vec![leader_id, rest[1]];
    let majority: Vec<NodeId> = (1..=5u64).filter(|id| !minority.contains(id)).collect();

    cluster.driver.partition(&majority, &minority).await;

    let new_leader = cluster
        .wait_for_leader_in_group(&majority, ELECTION_WAIT)
        .await
        .expect("Majority partition should elect a leader");
    assert!(majority.contains(&new_leader));

    let result = cluster.propose("majority rules").await;
    assert!(result.committed, "{result:?}");

    cluster.assert_invariants();
    cluster.shutdown().await;
}
