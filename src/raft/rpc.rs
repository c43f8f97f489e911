//! RPC contracts between members and the pure handlers that apply them to
//! a member's [`RaftState`]. Transports carry these structs as they are.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::raft::state::{RaftRole, RaftState};
use crate::raft::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub term: u64,
    pub leader_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub term: u64,
    pub success: bool,
}

/// Leader asking a follower to accept a proposed truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub proposal_id: Uuid,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptResponse {
    pub term: u64,
    pub accepted: bool,
}

/// Coordinator forwarding a proposal to the member it believes leads `term`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub proposal_id: Uuid,
    pub term: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposeOutcome {
    Committed,
    /// Too many peers refused or stayed silent for a quorum to form.
    Rejected,
    /// The leader's term moved before quorum.
    Aborted,
    NotLeader { leader_hint: Option<NodeId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeResponse {
    pub proposal_id: Uuid,
    /// Leader's term at the time of the answer.
    pub term: u64,
    pub outcome: ProposeOutcome,
    /// Members that accepted, the leader included.
    pub accepted_by: Vec<NodeId>,
}

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: NodeId) -> VoteResponse {
    // If request term is greater, update our term and become follower
    state.observe_term(req.term);

    let vote_granted = if req.term < state.current_term {
        tracing::debug!(
            node_id = my_id,
            candidate = req.candidate_id,
            term = req.term,
            current_term = state.current_term,
            "Stale term in RequestVote, rejecting"
        );
        false
    } else {
        state.grant_vote(req.candidate_id)
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle Heartbeat RPC
pub fn handle_heartbeat(
    state: &mut RaftState,
    req: &HeartbeatRequest,
    my_id: NodeId,
) -> HeartbeatResponse {
    let success = acknowledge_leader(state, req.term, req.leader_id, my_id);
    HeartbeatResponse {
        term: state.current_term,
        success,
    }
}

/// Handle Accept RPC. A valid accept doubles as a heartbeat.
pub fn handle_accept(state: &mut RaftState, req: &AcceptRequest, my_id: NodeId) -> AcceptResponse {
    let accepted = acknowledge_leader(state, req.term, req.leader_id, my_id);
    tracing::debug!(
        node_id = my_id,
        leader_id = req.leader_id,
        proposal_id = %req.proposal_id,
        term = req.term,
        accepted,
        "Accept response"
    );
    AcceptResponse {
        term: state.current_term,
        accepted,
    }
}

/// Validate a message from a self-declared leader and follow it if the term allows.
///
/// A stale term leaves role and term untouched; the stale leader steps down
/// only once it observes the higher term in our reply.
fn acknowledge_leader(state: &mut RaftState, term: u64, leader_id: NodeId, my_id: NodeId) -> bool {
    if term < state.current_term {
        tracing::debug!(
            node_id = my_id,
            leader_id,
            term,
            current_term = state.current_term,
            "Stale term from leader, rejecting"
        );
        return false;
    }

    state.observe_term(term);

    if state.role == RaftRole::Leader {
        // Two leaders in one term would mean a broken vote count somewhere.
        tracing::error!(
            node_id = my_id,
            other_leader = leader_id,
            term,
            "Received leader traffic for a term this node leads"
        );
        return false;
    }

    match state.accept_leader(leader_id) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(node_id = my_id, error = %e, "Ignoring leader contact");
            false
        }
    }
}
