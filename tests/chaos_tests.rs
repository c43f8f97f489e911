//! Fault injection tests: lost, duplicated and delayed messages between
//! members. Safety must hold throughout; liveness may only be slower.


use std::time::Duration;

use mace_consensus::config::FaultConfig;
use mace_consensus::coordinator::ProposalStatus;
use mace_consensus::driver::{run_scenario, ScenarioConfig};
use test_harness::{test_cluster_config, TestCluster, ELECTION_WAIT};

fn lossy(seed: u64) -> FaultConfig {
    FaultConfig {
        drop_rate: 0.2,
        duplicate_rate: 0.2,
        max_delay_ms: 20,
        seed: Some(seed),
    }
}

#[tokio::test(start_paused = true)]
async fn test_election_under_message_loss() {
    for seed in [1, 2, 3] {
        let mut cluster = TestCluster::with_faults(5, lossy(seed)).await;

        cluster
            .wait_for_leader(Duration::from_secs(30))
            .await
            .unwrap_or_else(|| panic!("seed {seed}: leader should eventually be elected"));

        cluster.run_for(Duration::from_secs(5)).await;
        cluster.assert_invariants();
        cluster.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_commits_only_in_terms_with_a_leader() {
    let mut cluster = TestCluster::with_faults(5, lossy(42)).await;
    cluster.wait_for_leader(Duration::from_secs(30)).await.unwrap();

    let mut results = Vec::new();
    for i in 0..10 {
        results.push(cluster.propose(&format!("truth-{i}")).await);
        cluster.run_for(Duration::from_millis(100)).await;
    }

    cluster.assert_invariants();
    let leader_terms: Vec<u64> = cluster
        .driver
        .monitor()
        .leaders_by_term()
        .into_iter()
        .map(|(term, _)| term)
        .collect();

    let engine = cluster.driver.engine();
    for result in results.iter().filter(|r| r.committed) {
        assert!(
            leader_terms.contains(&result.term),
            "commit in term {} without an elected leader",
            result.term
        );
        let proposal = engine.proposal(&result.proposal_id.unwrap()).await.unwrap();
        assert_eq!(proposal.status, ProposalStatus::Committed);
        assert_eq!(proposal.proposed_term, result.term);
    }
    for result in results.iter().filter(|r| !r.committed) {
        assert!(!result.reason.is_empty());
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicated_votes_do_not_double_count() {
    let faults = FaultConfig {
        duplicate_rate: 1.0,
        seed: Some(9),
        ..Default::default()
    };
    let mut cluster = TestCluster::with_faults(5, faults).await;

    cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    cluster.run_for(Duration::from_secs(2)).await;

    assert_eq!(cluster.count_leaders(), 1);
    let result = cluster.propose("said twice").await;
    assert!(result.committed, "{result:?}");

    cluster.assert_invariants();
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_flapping_leader_link() {
    let mut cluster = TestCluster::with_config(test_cluster_config(5)).await;

    for _ in 0..3 {
        let Some(leader) = cluster.leader() else {
            cluster.wait_for_leader(ELECTION_WAIT).await;
            continue;
        };
        cluster.driver.isolate(leader.id).await;
        cluster.wait_for_new_leader(leader.term, ELECTION_WAIT).await;
        cluster.driver.heal(leader.id).await;
        cluster.run_for(Duration::from_millis(500)).await;
    }

    cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let result = cluster.propose("after the storm").await;
    assert!(result.committed, "{result:?}");

    cluster.assert_invariants();
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lossy_scenario_keeps_invariants() {
    let config = ScenarioConfig {
        cluster: test_cluster_config(5).with_faults(lossy(7)),
        duration: Duration::from_secs(10),
        proposals: 6,
        proposal_timeout: Duration::from_millis(500),
        isolate_leader: true,
    };

    let report = run_scenario(config).await.unwrap();
    assert!(report.passed(), "violations: {:?}", report.violations);
    assert_eq!(report.proposals.len(), 6);
}
