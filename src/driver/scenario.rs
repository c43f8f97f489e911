use std::time::Duration;

use serde::Serialize;

use super::{ClusterDriver, InvariantViolation};
use crate::config::ClusterConfig;
use crate::coordinator::ProposalResult;
use crate::error::Result;
use crate::raft::{MemberStatus, NodeId};

/// A scripted run: elect, optionally cut the leader off halfway through the
/// proposals, then heal and let the cluster settle.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub cluster: ClusterConfig,
    /// Upper bound for each election wait, and the settle time at the end
    pub duration: Duration,
    pub proposals: usize,
    pub proposal_timeout: Duration,
    pub isolate_leader: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            duration: Duration::from_secs(2),
            proposals: 3,
            proposal_timeout: Duration::from_millis(500),
            isolate_leader: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub members: usize,
    pub first_leader: Option<NodeId>,
    pub isolated: Option<NodeId>,
    pub final_leader: Option<NodeId>,
    pub final_term: u64,
    pub statuses: Vec<MemberStatus>,
    pub proposals: Vec<ProposalResult>,
    pub committed: usize,
    pub violations: Vec<InvariantViolation>,
}

impl ScenarioReport {
    /// True when no safety property was broken during the run.
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

pub async fn run_scenario(config: ScenarioConfig) -> Result<ScenarioReport> {
    let mut driver = ClusterDriver::start(config.cluster.clone()).await?;

    let first_leader = driver.wait_for_leader(config.duration).await;
    match first_leader {
        Some(leader) => tracing::info!(leader_id = leader.id, term = leader.term, "First leader elected"),
        None => tracing::warn!(wait_ms = config.duration.as_millis() as u64, "No leader elected"),
    }

    let isolate_at = config.isolate_leader.then_some(config.proposals / 2);
    let mut isolated = None;
    let mut proposals = Vec::with_capacity(config.proposals);

    for i in 0..config.proposals {
        if isolate_at == Some(i) {
            isolated = isolate_current_leader(&driver, config.duration).await;
        }
        let result = driver
            .propose(format!("truth-{i}").into_bytes(), config.proposal_timeout)
            .await;
        tracing::info!(index = i, committed = result.committed, term = result.term, reason = %result.reason, "Proposal finished");
        proposals.push(result);
    }
    if isolated.is_none() && isolate_at.is_some() {
        isolated = isolate_current_leader(&driver, config.duration).await;
    }

    if let Some(id) = isolated {
        driver.heal(id).await;
    }
    driver.run_for(config.duration).await;

    let violations = driver.check_invariants();
    let final_leader = driver.leader();
    let report = ScenarioReport {
        members: config.cluster.members,
        first_leader: first_leader.map(|s| s.id),
        isolated,
        final_leader: final_leader.map(|s| s.id),
        final_term: driver.max_term(),
        statuses: driver.statuses(),
        committed: proposals.iter().filter(|r| r.committed).count(),
        proposals,
        violations,
    };

    driver.shutdown().await;
    Ok(report)
}

async fn isolate_current_leader(driver: &ClusterDriver, wait: Duration) -> Option<NodeId> {
    let leader = driver.leader()?;
    driver.isolate(leader.id).await;

    match driver.wait_for_leader_after(leader.term, wait).await {
        Some(next) => tracing::info!(old_leader = leader.id, leader_id = next.id, term = next.term, "Leadership moved"),
        None => tracing::warn!(old_leader = leader.id, "No replacement leader elected"),
    }
    Some(leader.id)
}
