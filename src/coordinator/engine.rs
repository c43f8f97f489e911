use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio::time::{timeout, timeout_at, Instant};
use uuid::Uuid;

use super::proposal::{Proposal, ProposalResult, ProposalStatus};
use super::registry::{Admission, ProposalRegistry};
use crate::error::{ConsensusError, Result};
use crate::link::PeerLink;
use crate::raft::rpc::{ProposeOutcome, ProposeRequest, ProposeResponse};
use crate::raft::{quorum_size, MemberStatus, NodeId, RaftRole};

const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_millis(100);

/// Ratifies payloads as cluster truth through the current leader.
///
/// The engine never touches member state. It learns roles through status
/// queries, forwards each proposal to the leader it found, and keeps its own
/// registry of outcomes.
pub struct MaceEngine {
    members: Vec<NodeId>,
    link: Arc<dyn PeerLink>,
    registry: RwLock<ProposalRegistry>,
    /// Bumped whenever a proposal settles.
    settled: watch::Sender<u64>,
    status_timeout: Duration,
}

impl MaceEngine {
    pub fn new(members: Vec<NodeId>, link: Arc<dyn PeerLink>) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            members,
            link,
            registry: RwLock::new(ProposalRegistry::new()),
            settled,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
        }
    }

    pub fn with_status_timeout(mut self, status_timeout: Duration) -> Self {
        self.status_timeout = status_timeout;
        self
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn quorum(&self) -> usize {
        quorum_size(self.members.len())
    }

    /// Query every tracked member and return the status of the leader with
    /// the highest term. Members that do not answer in time are skipped.
    pub async fn find_leader(&self) -> Result<MemberStatus> {
        self.find_leader_within(self.status_timeout).await
    }

    async fn find_leader_within(&self, limit: Duration) -> Result<MemberStatus> {
        let queries = self.members.iter().map(|&id| {
            let link = self.link.clone();
            async move {
                match timeout(limit, link.status(id)).await {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(e)) => {
                        tracing::debug!(node_id = id, error = %e, "Status query failed");
                        None
                    }
                    Err(_) => {
                        tracing::debug!(node_id = id, "Status query timed out");
                        None
                    }
                }
            }
        });
        let statuses: Vec<MemberStatus> = join_all(queries).await.into_iter().flatten().collect();

        let highest_term = statuses.iter().map(|s| s.term).max().unwrap_or(0);
        statuses
            .into_iter()
            .filter(|s| s.role == RaftRole::Leader)
            .max_by_key(|s| s.term)
            .ok_or(ConsensusError::NoLeaderAvailable { highest_term })
    }

    /// Propose `payload` and wait up to `timeout` for the cluster to ratify it.
    ///
    /// Failures are folded into the result's `reason`.
    pub async fn propose_truth(&self, payload: impl Into<Vec<u8>>, timeout: Duration) -> ProposalResult {
        match self.try_propose(payload, timeout).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(reason = e.reason(), error = %e, "Proposal failed");
                ProposalResult::failed(&e)
            }
        }
    }

    /// Propose `payload`, giving up once `limit` has passed since the call.
    /// The leader scan counts against `limit`.
    ///
    /// A payload already committed in the leader's term is answered from the
    /// registry. A payload another caller is still forwarding in that term
    /// joins that proposal instead of opening a second one.
    pub async fn try_propose(
        &self,
        payload: impl Into<Vec<u8>>,
        limit: Duration,
    ) -> Result<ProposalResult> {
        let payload = payload.into();
        let deadline = Instant::now() + limit;
        let timeout_ms = limit.as_millis() as u64;

        let leader = self
            .find_leader_within(self.status_timeout.min(limit))
            .await?;
        let term = leader.term;

        let (admission, settled) = {
            let mut registry = self.registry.write().await;
            // Subscribe under the lock so a settlement cannot slip past a joiner
            let settled = self.settled.subscribe();
            (registry.admit(payload.clone(), leader.id, term), settled)
        };

        let proposal_id = match admission {
            Admission::Committed(id) => {
                tracing::debug!(proposal_id = %id, term, "Payload already committed in this term");
                return Ok(ProposalResult::committed(id, term));
            }
            Admission::InFlight(id) => {
                tracing::debug!(proposal_id = %id, term, "Joining in-flight proposal");
                return self
                    .await_settlement(id, term, deadline, timeout_ms, settled)
                    .await;
            }
            Admission::Opened(id) => id,
        };

        tracing::info!(proposal_id = %proposal_id, leader_id = leader.id, term, "Forwarding proposal");

        let req = ProposeRequest {
            proposal_id,
            term,
            payload,
        };

        match timeout_at(deadline, self.link.propose(leader.id, req)).await {
            Err(_) => {
                self.registry.write().await.release(&proposal_id);
                tracing::warn!(proposal_id = %proposal_id, term, timeout_ms, "Proposal timed out, leaving it pending");
                Err(ConsensusError::ProposalTimeout {
                    proposal_id,
                    term,
                    timeout_ms,
                })
            }
            Ok(Err(source)) => {
                self.settle(&proposal_id, ProposalStatus::Aborted).await;
                Err(ConsensusError::LeaderUnreachable {
                    proposal_id,
                    leader_id: leader.id,
                    term,
                    source,
                })
            }
            Ok(Ok(resp)) => self.apply_response(proposal_id, term, resp).await,
        }
    }

    /// Wait for another caller's proposal to settle and report its outcome.
    async fn await_settlement(
        &self,
        proposal_id: Uuid,
        term: u64,
        deadline: Instant,
        timeout_ms: u64,
        mut settled: watch::Receiver<u64>,
    ) -> Result<ProposalResult> {
        loop {
            if let Some(proposal) = self.registry.read().await.get(&proposal_id) {
                match proposal.status {
                    ProposalStatus::Committed => {
                        return Ok(ProposalResult::committed(proposal_id, proposal.proposed_term));
                    }
                    ProposalStatus::Rejected => {
                        return Err(ConsensusError::ProposalRejected {
                            proposal_id,
                            term,
                            accepts: proposal.responses.len(),
                            quorum: self.quorum(),
                        });
                    }
                    ProposalStatus::Aborted => {
                        return Err(ConsensusError::ProposalAborted {
                            proposal_id,
                            proposed_term: term,
                            current_term: term,
                        });
                    }
                    ProposalStatus::Pending => {}
                }
            }

            if !matches!(timeout_at(deadline, settled.changed()).await, Ok(Ok(()))) {
                return Err(ConsensusError::ProposalTimeout {
                    proposal_id,
                    term,
                    timeout_ms,
                });
            }
        }
    }

    async fn settle(&self, proposal_id: &Uuid, status: ProposalStatus) -> bool {
        let settled = self.registry.write().await.settle(proposal_id, status);
        if settled {
            self.settled.send_modify(|n| *n = n.wrapping_add(1));
        }
        settled
    }

    async fn apply_response(
        &self,
        proposal_id: Uuid,
        proposed_term: u64,
        resp: ProposeResponse,
    ) -> Result<ProposalResult> {
        self.registry
            .write()
            .await
            .record_accepts(&proposal_id, resp.accepted_by.iter().copied());

        match resp.outcome {
            ProposeOutcome::Committed if resp.term == proposed_term => {
                self.settle(&proposal_id, ProposalStatus::Committed).await;
                tracing::info!(proposal_id = %proposal_id, term = proposed_term, accepts = resp.accepted_by.len(), "Proposal committed");
                Ok(ProposalResult::committed(proposal_id, proposed_term))
            }
            ProposeOutcome::Rejected => {
                self.settle(&proposal_id, ProposalStatus::Rejected).await;
                Err(ConsensusError::ProposalRejected {
                    proposal_id,
                    term: resp.term,
                    accepts: resp.accepted_by.len(),
                    quorum: self.quorum(),
                })
            }
            ProposeOutcome::Committed | ProposeOutcome::Aborted | ProposeOutcome::NotLeader { .. } => {
                self.settle(&proposal_id, ProposalStatus::Aborted).await;
                Err(ConsensusError::ProposalAborted {
                    proposal_id,
                    proposed_term,
                    current_term: resp.term,
                })
            }
        }
    }

    /// Give up on a pending proposal. Returns false if it was not pending.
    pub async fn abandon(&self, proposal_id: &Uuid) -> bool {
        let abandoned = self.settle(proposal_id, ProposalStatus::Aborted).await;
        if abandoned {
            tracing::info!(proposal_id = %proposal_id, "Proposal abandoned");
        }
        abandoned
    }

    pub async fn proposal(&self, proposal_id: &Uuid) -> Option<Proposal> {
        self.registry.read().await.get(proposal_id).cloned()
    }

    pub async fn proposals(&self) -> Vec<Proposal> {
        self.registry.read().await.list()
    }

    pub async fn committed(&self) -> usize {
        self.registry
            .read()
            .await
            .count_with(ProposalStatus::Committed)
    }
}
