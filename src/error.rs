use thiserror::Error;
use uuid::Uuid;

use crate::raft::NodeId;

/// Errors surfaced to callers of the consensus coordinator.
///
/// Role and term bookkeeping problems never show up here: members absorb
/// them locally. Every variant is an expected operating condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("No member currently holds leadership (highest term seen: {highest_term})")]
    NoLeaderAvailable { highest_term: u64 },

    #[error("Proposal {proposal_id} timed out after {timeout_ms}ms")]
    ProposalTimeout {
        proposal_id: Uuid,
        term: u64,
        timeout_ms: u64,
    },

    #[error("Proposal {proposal_id} aborted: term moved from {proposed_term} to {current_term}")]
    ProposalAborted {
        proposal_id: Uuid,
        proposed_term: u64,
        current_term: u64,
    },

    #[error("Proposal {proposal_id} rejected: {accepts} accepts, {quorum} required")]
    ProposalRejected {
        proposal_id: Uuid,
        term: u64,
        accepts: usize,
        quorum: usize,
    },

    #[error("Leader {leader_id} unreachable for proposal {proposal_id}: {source}")]
    LeaderUnreachable {
        proposal_id: Uuid,
        leader_id: NodeId,
        term: u64,
        #[source]
        source: LinkError,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsensusError {
    /// Stable reason code reported in `ProposalResult::reason`.
    pub fn reason(&self) -> &'static str {
        match self {
            ConsensusError::NoLeaderAvailable { .. } => "NoLeaderAvailable",
            ConsensusError::ProposalTimeout { .. } => "ProposalTimeout",
            ConsensusError::ProposalAborted { .. } => "ProposalAborted",
            ConsensusError::ProposalRejected { .. } => "ProposalRejected",
            ConsensusError::LeaderUnreachable { .. } => "LeaderUnreachable",
            ConsensusError::InvalidConfig(_) => "InvalidConfig",
        }
    }

    /// Term the failure refers to, 0 when none is known.
    pub fn term(&self) -> u64 {
        match self {
            ConsensusError::NoLeaderAvailable { highest_term } => *highest_term,
            ConsensusError::ProposalAborted { current_term, .. } => *current_term,
            ConsensusError::ProposalRejected { term, .. } => *term,
            ConsensusError::LeaderUnreachable { term, .. } => *term,
            ConsensusError::ProposalTimeout { term, .. } => *term,
            ConsensusError::InvalidConfig(_) => 0,
        }
    }

    /// Proposal the failure belongs to, if one was opened.
    pub fn proposal_id(&self) -> Option<Uuid> {
        match self {
            ConsensusError::ProposalTimeout { proposal_id, .. }
            | ConsensusError::ProposalAborted { proposal_id, .. }
            | ConsensusError::ProposalRejected { proposal_id, .. }
            | ConsensusError::LeaderUnreachable { proposal_id, .. } => Some(*proposal_id),
            _ => None,
        }
    }

    /// Whether the caller may simply resubmit.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConsensusError::InvalidConfig(_))
    }
}

/// Failures of a single PeerLink call. Members treat all of them as "no response".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Peer {0} is not registered on this link")]
    UnknownPeer(NodeId),

    #[error("Peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Message to or from peer {0} was lost")]
    Dropped(NodeId),

    #[error("Inbox of peer {0} is closed")]
    Closed(NodeId),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
