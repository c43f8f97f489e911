use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConsensusError;
use crate::raft::NodeId;

/// Lifecycle of a proposal. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Pending,
    Committed,
    Rejected,
    Aborted,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalStatus::Pending => write!(f, "pending"),
            ProposalStatus::Committed => write!(f, "committed"),
            ProposalStatus::Rejected => write!(f, "rejected"),
            ProposalStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// A payload submitted for ratification.
#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub id: Uuid,
    pub payload: Vec<u8>,
    /// Leader's term when the proposal was forwarded
    pub proposed_term: u64,
    pub leader_id: NodeId,
    pub status: ProposalStatus,
    /// Members that accepted, the leader included
    pub responses: BTreeSet<NodeId>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn new(payload: Vec<u8>, leader_id: NodeId, proposed_term: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            proposed_term,
            leader_id,
            status: ProposalStatus::Pending,
            responses: BTreeSet::new(),
            created_at: Utc::now(),
            settled_at: None,
        }
    }
}

/// What `propose_truth` reports: `(committed, term, reason)` plus the proposal id.
///
/// `reason` is empty on commit and otherwise one of the stable codes from
/// [`ConsensusError::reason`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResult {
    pub proposal_id: Option<Uuid>,
    pub committed: bool,
    pub term: u64,
    pub reason: String,
}

impl ProposalResult {
    pub fn committed(proposal_id: Uuid, term: u64) -> Self {
        Self {
            proposal_id: Some(proposal_id),
            committed: true,
            term,
            reason: String::new(),
        }
    }

    pub fn failed(err: &ConsensusError) -> Self {
        Self {
            proposal_id: err.proposal_id(),
            committed: false,
            term: err.term(),
            reason: err.reason().to_string(),
        }
    }
}
