use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::NodeId;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Events that move a member between roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleEvent {
    /// Election deadline passed without hearing from a leader.
    ElectionTimeout,
    /// Votes from a quorum, self included.
    QuorumReached,
    /// Any message carried a strictly higher term.
    HigherTerm,
    /// A valid leader for the current term made contact.
    LeaderDiscovered,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal transition from {from} on {event:?}")]
pub struct IllegalTransition {
    pub from: RaftRole,
    pub event: RoleEvent,
}

impl RaftRole {
    /// The single place role changes are decided.
    pub fn transition(self, event: RoleEvent) -> Result<RaftRole, IllegalTransition> {
        use RaftRole::*;
        use RoleEvent::*;

        match (self, event) {
            (Follower | Candidate, ElectionTimeout) => Ok(Candidate),
            (Candidate, QuorumReached) => Ok(Leader),
            (_, HigherTerm) => Ok(Follower),
            (Follower | Candidate, LeaderDiscovered) => Ok(Follower),
            (from, event) => Err(IllegalTransition { from, event }),
        }
    }
}

/// Quorum size for an `n`-member cluster.
pub fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Observable snapshot of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
}

/// Election state owned by exactly one member.
///
/// # Safety invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each member grants at most one vote per term (`voted_for`, cleared only
///   when the term advances)
/// - A candidate needs votes from a quorum, itself included
///
/// ## Term Monotonicity
/// `current_term` only moves forward: `observe_term` ignores anything that is
/// not strictly higher and `become_candidate` increments by one.
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub role: RaftRole,

    // Known leader for the current term (if any)
    pub leader_id: Option<NodeId>,

    // Distinct voters in the current election (for candidates)
    pub votes_received: HashSet<NodeId>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: HashSet::new(),
        }
    }

    pub fn status(&self, my_id: NodeId) -> MemberStatus {
        MemberStatus {
            id: my_id,
            role: self.role,
            term: self.current_term,
            voted_for: self.voted_for,
            leader_id: self.leader_id,
        }
    }

    /// Adopt `term` if it is newer, demoting to follower. Returns whether it was adopted.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        // HigherTerm is legal from every role
        self.role = self
            .role
            .transition(RoleEvent::HigherTerm)
            .unwrap_or(RaftRole::Follower);
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.votes_received.clear();
        true
    }

    /// Transition to candidate state, returning the new term.
    pub fn become_candidate(&mut self, my_id: NodeId) -> Result<u64, IllegalTransition> {
        self.role = self.role.transition(RoleEvent::ElectionTimeout)?;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(my_id);
        Ok(self.current_term)
    }

    /// Count a granted vote. Returns the number of distinct voters so far.
    pub fn record_vote(&mut self, voter: NodeId) -> usize {
        self.votes_received.insert(voter);
        self.votes_received.len()
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: NodeId) -> Result<(), IllegalTransition> {
        self.role = self.role.transition(RoleEvent::QuorumReached)?;
        self.leader_id = Some(my_id);
        Ok(())
    }

    /// Follow `leader_id` for the current term.
    pub fn accept_leader(&mut self, leader_id: NodeId) -> Result<(), IllegalTransition> {
        self.role = self.role.transition(RoleEvent::LeaderDiscovered)?;
        self.leader_id = Some(leader_id);
        self.votes_received.clear();
        Ok(())
    }

    /// Grant the vote for the current term unless it already went to someone else.
    pub fn grant_vote(&mut self, candidate_id: NodeId) -> bool {
        match self.voted_for {
            None => {
                self.voted_for = Some(candidate_id);
                true
            }
            Some(existing) => existing == candidate_id,
        }
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
