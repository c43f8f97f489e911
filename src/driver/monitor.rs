use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::raft::{MemberEvent, NodeId, RaftRole};

/// A safety property the cluster broke.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InvariantViolation {
    #[error("Two leaders in term {term}: {first} and {second}")]
    TwoLeaders {
        term: u64,
        first: NodeId,
        second: NodeId,
    },

    #[error("Member {node} moved its term back from {from} to {to}")]
    TermRegressed { node: NodeId, from: u64, to: u64 },

    #[error("Member {voter} voted twice in term {term}: for {first} and {second}")]
    DoubleVote {
        voter: NodeId,
        term: u64,
        first: NodeId,
        second: NodeId,
    },
}

/// Checks member events against election safety, term monotonicity and
/// the single vote per term rule.
#[derive(Debug, Default)]
pub struct InvariantMonitor {
    leaders: HashMap<u64, NodeId>,
    terms: HashMap<NodeId, u64>,
    votes: HashMap<(NodeId, u64), NodeId>,
    violations: Vec<InvariantViolation>,
    observed: usize,
}

impl InvariantMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &MemberEvent) {
        self.observed += 1;

        match *event {
            MemberEvent::StatusChanged(status) => {
                let last = *self.terms.entry(status.id).or_insert(status.term);
                if status.term < last {
                    self.violate(InvariantViolation::TermRegressed {
                        node: status.id,
                        from: last,
                        to: status.term,
                    });
                } else {
                    self.terms.insert(status.id, status.term);
                }

                if status.role == RaftRole::Leader {
                    let first = *self.leaders.entry(status.term).or_insert(status.id);
                    if first != status.id {
                        self.violate(InvariantViolation::TwoLeaders {
                            term: status.term,
                            first,
                            second: status.id,
                        });
                    }
                }
            }
            MemberEvent::VoteGranted {
                voter,
                term,
                candidate,
            } => {
                let first = *self.votes.entry((voter, term)).or_insert(candidate);
                if first != candidate {
                    self.violate(InvariantViolation::DoubleVote {
                        voter,
                        term,
                        first,
                        second: candidate,
                    });
                }
            }
        }
    }

    fn violate(&mut self, violation: InvariantViolation) {
        tracing::error!(%violation, "Invariant violated");
        self.violations.push(violation);
    }

    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    pub fn check(&self) -> Result<(), InvariantViolation> {
        match self.violations.first() {
            Some(violation) => Err(violation.clone()),
            None => Ok(()),
        }
    }

    /// Number of events recorded so far.
    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Leader elected in each term seen, ordered by term.
    pub fn leaders_by_term(&self) -> Vec<(u64, NodeId)> {
        let mut leaders: Vec<(u64, NodeId)> = self.leaders.iter().map(|(t, id)| (*t, *id)).collect();
        leaders.sort_unstable();
        leaders
    }
}
