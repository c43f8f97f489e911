use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use super::proposal::{Proposal, ProposalStatus};
use crate::raft::NodeId;

/// How `admit` handled a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The payload already committed in this term.
    Committed(Uuid),
    /// Another caller is forwarding the same payload in this term.
    InFlight(Uuid),
    /// A new pending proposal the caller must forward.
    Opened(Uuid),
}

/// Every proposal the coordinator opened, plus indexes by `(payload, term)`
/// of commits and of proposals still being forwarded.
#[derive(Debug, Default)]
pub struct ProposalRegistry {
    proposals: HashMap<Uuid, Proposal>,
    commits: HashMap<(Vec<u8>, u64), Uuid>,
    inflight: HashMap<(Vec<u8>, u64), Uuid>,
}

impl ProposalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pending proposal and return its id.
    pub fn open(&mut self, payload: Vec<u8>, leader_id: NodeId, proposed_term: u64) -> Uuid {
        let proposal = Proposal::new(payload, leader_id, proposed_term);
        let id = proposal.id;
        self.proposals.insert(id, proposal);
        id
    }

    /// Open a proposal unless this payload is already committed or being
    /// forwarded in `proposed_term`.
    pub fn admit(&mut self, payload: Vec<u8>, leader_id: NodeId, proposed_term: u64) -> Admission {
        let key = (payload, proposed_term);
        if let Some(id) = self.commits.get(&key) {
            return Admission::Committed(*id);
        }
        if let Some(id) = self.inflight.get(&key) {
            return Admission::InFlight(*id);
        }

        let id = self.open(key.0.clone(), leader_id, proposed_term);
        self.inflight.insert(key, id);
        Admission::Opened(id)
    }

    /// Stop routing new submissions to `id` without settling it.
    pub fn release(&mut self, id: &Uuid) {
        self.inflight.retain(|_, inflight| inflight != id);
    }

    pub fn get(&self, id: &Uuid) -> Option<&Proposal> {
        self.proposals.get(id)
    }

    /// Committed proposal for this payload in `term`, if any.
    pub fn find_commit(&self, payload: &[u8], term: u64) -> Option<&Proposal> {
        self.commits
            .get(&(payload.to_vec(), term))
            .and_then(|id| self.proposals.get(id))
    }

    pub fn record_accepts(&mut self, id: &Uuid, accepted_by: impl IntoIterator<Item = NodeId>) {
        if let Some(proposal) = self.proposals.get_mut(id) {
            if !proposal.status.is_terminal() {
                proposal.responses.extend(accepted_by);
            }
        }
    }

    /// Move a pending proposal to a terminal status.
    ///
    /// Returns false when the proposal is unknown, already terminal, or
    /// `status` is not terminal.
    pub fn settle(&mut self, id: &Uuid, status: ProposalStatus) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let Some(proposal) = self.proposals.get_mut(id) else {
            return false;
        };
        if proposal.status.is_terminal() {
            tracing::warn!(proposal_id = %id, current = %proposal.status, requested = %status, "Proposal already settled");
            return false;
        }

        proposal.status = status;
        proposal.settled_at = Some(Utc::now());

        let key = (proposal.payload.clone(), proposal.proposed_term);
        if self.inflight.get(&key) == Some(id) {
            self.inflight.remove(&key);
        }
        if status == ProposalStatus::Committed {
            self.commits.entry(key).or_insert(*id);
        }
        true
    }

    /// All proposals, oldest first.
    pub fn list(&self) -> Vec<Proposal> {
        let mut all: Vec<Proposal> = self.proposals.values().cloned().collect();
        all.sort_by_key(|p| p.created_at);
        all
    }

    pub fn count_with(&self, status: ProposalStatus) -> usize {
        self.proposals.values().filter(|p| p.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }
}
