use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::LinkError;
use crate::link::PeerLink;
use crate::raft::rpc::{
    handle_accept, handle_heartbeat, handle_request_vote, AcceptRequest, AcceptResponse,
    HeartbeatRequest, HeartbeatResponse, ProposeOutcome, ProposeRequest, ProposeResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::state::{MemberStatus, RaftRole, RaftState};
use crate::raft::timer::ElectionTimer;
use crate::raft::NodeId;

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    RequestVote {
        req: VoteRequest,
        response_tx: oneshot::Sender<VoteResponse>,
    },
    Heartbeat {
        req: HeartbeatRequest,
        response_tx: oneshot::Sender<HeartbeatResponse>,
    },
    Accept {
        req: AcceptRequest,
        response_tx: oneshot::Sender<AcceptResponse>,
    },
    /// Proposal forwarded by the coordinator (leader only)
    Propose {
        req: ProposeRequest,
        response_tx: oneshot::Sender<ProposeResponse>,
    },
    GetStatus {
        response_tx: oneshot::Sender<MemberStatus>,
    },
    /// Check timers now instead of waiting for the next wakeup
    Tick,
}

/// Answers to RPCs this member sent, fed back into its own loop.
/// `None` means the peer never answered within the RPC timeout.
#[derive(Debug)]
pub enum PeerReply {
    Vote {
        election_term: u64,
        peer_id: NodeId,
        response: Option<VoteResponse>,
    },
    Heartbeat {
        peer_id: NodeId,
        response: Option<HeartbeatResponse>,
    },
    Accept {
        proposal_id: Uuid,
        peer_id: NodeId,
        response: Option<AcceptResponse>,
    },
}

/// Observations a member reports to an attached event sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    StatusChanged(MemberStatus),
    /// First grant of this voter's vote in `term`.
    VoteGranted {
        voter: NodeId,
        term: u64,
        candidate: NodeId,
    },
}

/// Receiving ends of a member's two queues.
pub struct Inbox {
    messages: mpsc::Receiver<RaftMessage>,
    replies: mpsc::Receiver<PeerReply>,
}

struct PendingProposal {
    term: u64,
    accepted_by: BTreeSet<NodeId>,
    // Refusals and silence both count here
    refused_by: BTreeSet<NodeId>,
    response_tx: oneshot::Sender<ProposeResponse>,
}

/// One cluster member.
///
/// The node exclusively owns its [`RaftState`]. All transitions happen inside
/// [`RaftNode::run`], one message at a time, so no locking is involved. Outgoing
/// RPCs run in spawned tasks and report back through the reply queue.
pub struct RaftNode {
    pub id: NodeId,
    state: RaftState,
    config: NodeConfig,
    link: Arc<dyn PeerLink>,
    timer: ElectionTimer,
    next_heartbeat_at: Instant,
    last_heartbeat_at: Option<Instant>,
    pending: HashMap<Uuid, PendingProposal>,
    message_tx: mpsc::Sender<RaftMessage>,
    reply_tx: mpsc::Sender<PeerReply>,
    status_tx: watch::Sender<MemberStatus>,
    events: Option<mpsc::UnboundedSender<MemberEvent>>,
}

impl RaftNode {
    pub fn new(config: NodeConfig, link: Arc<dyn PeerLink>) -> (Self, Inbox) {
        let (message_tx, messages) = mpsc::channel(config.inbox_capacity);
        let (reply_tx, replies) = mpsc::channel(config.inbox_capacity);

        let now = Instant::now();
        let timer = match config.initial_election_timeout_ms {
            Some(ms) => ElectionTimer::with_initial(
                config.election_timeout_min_ms,
                config.election_timeout_max_ms,
                Duration::from_millis(ms),
                now,
            ),
            None => ElectionTimer::new(
                config.election_timeout_min_ms,
                config.election_timeout_max_ms,
                now,
            ),
        };

        let state = RaftState::new();
        let (status_tx, _) = watch::channel(state.status(config.node_id));

        let node = Self {
            id: config.node_id,
            state,
            config,
            link,
            timer,
            next_heartbeat_at: now,
            last_heartbeat_at: None,
            pending: HashMap::new(),
            message_tx,
            reply_tx,
            status_tx,
            events: None,
        };

        (node, Inbox { messages, replies })
    }

    /// Report status changes and vote grants to `sink`.
    pub fn with_event_sink(mut self, sink: mpsc::UnboundedSender<MemberEvent>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    /// Watch this member's status. Stays readable after the member stops.
    pub fn subscribe_status(&self) -> watch::Receiver<MemberStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> MemberStatus {
        self.state.status(self.id)
    }

    pub fn state(&self) -> &RaftState {
        &self.state
    }

    pub fn election_deadline(&self) -> Instant {
        self.timer.deadline()
    }

    /// Run the member's loop until `shutdown` fires.
    pub async fn run(mut self, mut inbox: Inbox, shutdown: CancellationToken) {
        tracing::info!(node_id = self.id, peers = ?self.config.peers, "Member started");

        loop {
            let wake_at = self.next_wakeup();

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = self.id, term = self.state.current_term, "Member shutting down");
                    break;
                }
                Some(msg) = inbox.messages.recv() => {
                    self.handle_message(msg, Instant::now());
                }
                Some(reply) = inbox.replies.recv() => {
                    self.handle_reply(reply, Instant::now());
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    self.tick(Instant::now());
                }
            }
        }
    }

    fn next_wakeup(&self) -> Instant {
        match self.state.role {
            RaftRole::Leader => self.next_heartbeat_at,
            RaftRole::Follower | RaftRole::Candidate => self.timer.deadline(),
        }
    }

    /// Advance this member's clock to `now`.
    pub fn tick(&mut self, now: Instant) {
        match self.state.role {
            RaftRole::Leader => {
                if now >= self.next_heartbeat_at {
                    self.broadcast_heartbeats(now);
                }
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if !self.timer.expired(now) {
                    return;
                }
                if self.state.role == RaftRole::Candidate {
                    tracing::info!(
                        node_id = self.id,
                        term = self.state.current_term,
                        votes = self.state.votes_received.len(),
                        "Split vote, retrying election"
                    );
                } else {
                    tracing::info!(
                        node_id = self.id,
                        since_heartbeat_ms = ?self.last_heartbeat_at.map(|t| (now - t).as_millis() as u64),
                        "Election timeout, starting election"
                    );
                }
                self.start_election(now);
            }
        }
    }

    /// Handle one message from the inbox.
    pub fn handle_message(&mut self, msg: RaftMessage, now: Instant) {
        let before = self.status();

        match msg {
            RaftMessage::RequestVote { req, response_tx } => {
                let resp = handle_request_vote(&mut self.state, &req, self.id);
                if resp.vote_granted {
                    // Reset election timeout if we granted vote
                    self.timer.reset(now);
                    if before.term != resp.term || before.voted_for.is_none() {
                        self.emit(MemberEvent::VoteGranted {
                            voter: self.id,
                            term: resp.term,
                            candidate: req.candidate_id,
                        });
                    }
                }
                let _ = response_tx.send(resp);
            }
            RaftMessage::Heartbeat { req, response_tx } => {
                let resp = handle_heartbeat(&mut self.state, &req, self.id);
                if resp.success {
                    self.heard_from_leader(now);
                    tracing::trace!(node_id = self.id, leader_id = req.leader_id, term = req.term, "Heartbeat");
                }
                let _ = response_tx.send(resp);
            }
            RaftMessage::Accept { req, response_tx } => {
                let resp = handle_accept(&mut self.state, &req, self.id);
                if resp.accepted {
                    self.heard_from_leader(now);
                }
                let _ = response_tx.send(resp);
            }
            RaftMessage::Propose { req, response_tx } => {
                self.start_proposal(req, response_tx);
            }
            RaftMessage::GetStatus { response_tx } => {
                let _ = response_tx.send(self.status());
            }
            RaftMessage::Tick => self.tick(now),
        }

        self.after_transition(before, now);
    }

    /// Handle the answer (or silence) of a peer to one of our RPCs.
    pub fn handle_reply(&mut self, reply: PeerReply, now: Instant) {
        let before = self.status();

        match reply {
            PeerReply::Vote {
                election_term,
                peer_id,
                response,
            } => match response {
                None => {
                    tracing::debug!(node_id = self.id, peer_id, term = election_term, "No vote from peer");
                }
                Some(resp) if self.state.observe_term(resp.term) => {
                    tracing::info!(node_id = self.id, peer_id, term = resp.term, "Higher term in vote reply, stepping down");
                }
                Some(resp) => {
                    if self.state.role != RaftRole::Candidate
                        || self.state.current_term != election_term
                    {
                        tracing::trace!(node_id = self.id, peer_id, election_term, "Ignoring vote for a finished election");
                    } else if resp.vote_granted {
                        let votes = self.state.record_vote(peer_id);
                        tracing::debug!(node_id = self.id, peer_id, votes, "Received vote");
                        if votes >= self.config.quorum() {
                            self.become_leader(now);
                        }
                    }
                }
            },
            PeerReply::Heartbeat { peer_id, response } => {
                if let Some(resp) = response {
                    if self.state.observe_term(resp.term) {
                        tracing::info!(node_id = self.id, peer_id, term = resp.term, "Higher term in heartbeat reply, stepping down");
                    }
                }
            }
            PeerReply::Accept {
                proposal_id,
                peer_id,
                response,
            } => self.tally_accept(proposal_id, peer_id, response),
        }

        self.after_transition(before, now);
    }

    fn heard_from_leader(&mut self, now: Instant) {
        self.last_heartbeat_at = Some(now);
        self.timer.reset(now);
    }

    /// Start a new election
    fn start_election(&mut self, now: Instant) {
        let term = match self.state.become_candidate(self.id) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(node_id = self.id, error = %e, "Cannot start election");
                return;
            }
        };
        let timeout = self.timer.reset(now);
        self.publish();

        tracing::info!(
            node_id = self.id,
            term,
            timeout_ms = timeout.as_millis() as u64,
            "Starting election"
        );

        if self.state.votes_received.len() >= self.config.quorum() {
            self.become_leader(now);
            return;
        }

        let req = VoteRequest {
            term,
            candidate_id: self.id,
        };
        for &peer_id in &self.config.peers {
            let link = self.link.clone();
            let req = req.clone();
            self.spawn_rpc(
                peer_id,
                "request_vote",
                async move { link.request_vote(peer_id, req).await },
                move |response| PeerReply::Vote {
                    election_term: term,
                    peer_id,
                    response,
                },
            );
        }
    }

    fn become_leader(&mut self, now: Instant) {
        if let Err(e) = self.state.become_leader(self.id) {
            tracing::warn!(node_id = self.id, error = %e, "Cannot take leadership");
            return;
        }
        tracing::info!(
            node_id = self.id,
            term = self.state.current_term,
            votes = self.state.votes_received.len(),
            "Became leader"
        );
        self.publish();
        self.broadcast_heartbeats(now);
    }

    /// Send heartbeats to all followers (leader only)
    fn broadcast_heartbeats(&mut self, now: Instant) {
        self.next_heartbeat_at = now + self.config.heartbeat_interval();

        let req = HeartbeatRequest {
            term: self.state.current_term,
            leader_id: self.id,
        };
        for &peer_id in &self.config.peers {
            let link = self.link.clone();
            let req = req.clone();
            self.spawn_rpc(
                peer_id,
                "heartbeat",
                async move { link.heartbeat(peer_id, req).await },
                move |response| PeerReply::Heartbeat { peer_id, response },
            );
        }
    }

    fn start_proposal(&mut self, req: ProposeRequest, response_tx: oneshot::Sender<ProposeResponse>) {
        let term = self.state.current_term;

        if self.state.role != RaftRole::Leader {
            let _ = response_tx.send(ProposeResponse {
                proposal_id: req.proposal_id,
                term,
                outcome: ProposeOutcome::NotLeader {
                    leader_hint: self.state.leader_id,
                },
                accepted_by: Vec::new(),
            });
            return;
        }
        if req.term != term {
            tracing::debug!(node_id = self.id, proposal_id = %req.proposal_id, proposed_term = req.term, term, "Proposal for another term");
            let _ = response_tx.send(ProposeResponse {
                proposal_id: req.proposal_id,
                term,
                outcome: ProposeOutcome::Aborted,
                accepted_by: Vec::new(),
            });
            return;
        }
        if self.pending.contains_key(&req.proposal_id) {
            tracing::debug!(node_id = self.id, proposal_id = %req.proposal_id, "Duplicate proposal delivery ignored");
            return;
        }

        tracing::info!(node_id = self.id, proposal_id = %req.proposal_id, term, "Requesting accepts");

        self.pending.insert(
            req.proposal_id,
            PendingProposal {
                term,
                // Leader's implicit accept
                accepted_by: BTreeSet::from([self.id]),
                refused_by: BTreeSet::new(),
                response_tx,
            },
        );

        let accept = AcceptRequest {
            term,
            leader_id: self.id,
            proposal_id: req.proposal_id,
            payload: req.payload,
        };
        for &peer_id in &self.config.peers {
            let link = self.link.clone();
            let accept = accept.clone();
            let proposal_id = req.proposal_id;
            self.spawn_rpc(
                peer_id,
                "accept",
                async move { link.accept(peer_id, accept).await },
                move |response| PeerReply::Accept {
                    proposal_id,
                    peer_id,
                    response,
                },
            );
        }

        self.settle_proposal(req.proposal_id);
    }

    fn tally_accept(&mut self, proposal_id: Uuid, peer_id: NodeId, response: Option<AcceptResponse>) {
        if let Some(resp) = &response {
            if self.state.observe_term(resp.term) {
                tracing::info!(node_id = self.id, peer_id, term = resp.term, "Higher term in accept reply, stepping down");
                return;
            }
        }

        let Some(pending) = self.pending.get_mut(&proposal_id) else {
            tracing::trace!(node_id = self.id, proposal_id = %proposal_id, peer_id, "Accept reply for a settled proposal");
            return;
        };

        if response.map(|r| r.accepted).unwrap_or(false) {
            pending.refused_by.remove(&peer_id);
            pending.accepted_by.insert(peer_id);
        } else if !pending.accepted_by.contains(&peer_id) {
            pending.refused_by.insert(peer_id);
        }

        self.settle_proposal(proposal_id);
    }

    /// Resolve a pending proposal once its outcome is decided.
    fn settle_proposal(&mut self, proposal_id: Uuid) {
        let Some(pending) = self.pending.get(&proposal_id) else {
            return;
        };

        let quorum = self.config.quorum();
        let reachable = self.config.cluster_size() - pending.refused_by.len();

        let outcome = if self.state.role != RaftRole::Leader
            || pending.term != self.state.current_term
        {
            ProposeOutcome::Aborted
        } else if pending.accepted_by.len() >= quorum {
            ProposeOutcome::Committed
        } else if reachable < quorum {
            ProposeOutcome::Rejected
        } else {
            return;
        };

        if let Some(pending) = self.pending.remove(&proposal_id) {
            self.finish_proposal(proposal_id, pending, outcome);
        }
    }

    fn finish_proposal(&self, proposal_id: Uuid, pending: PendingProposal, outcome: ProposeOutcome) {
        if pending.response_tx.is_closed() {
            tracing::warn!(node_id = self.id, proposal_id = %proposal_id, ?outcome, "Proposer gave up, dropping outcome");
            return;
        }

        tracing::info!(
            node_id = self.id,
            proposal_id = %proposal_id,
            term = pending.term,
            accepts = pending.accepted_by.len(),
            ?outcome,
            "Proposal settled"
        );

        let _ = pending.response_tx.send(ProposeResponse {
            proposal_id,
            term: self.state.current_term,
            outcome,
            accepted_by: pending.accepted_by.into_iter().collect(),
        });
    }

    /// Publish the new status and clean up after losing leadership.
    fn after_transition(&mut self, before: MemberStatus, now: Instant) {
        if before.role == RaftRole::Leader && self.state.role != RaftRole::Leader {
            tracing::info!(
                node_id = self.id,
                old_term = before.term,
                term = self.state.current_term,
                "Stepped down from leadership"
            );
            // The timer sat idle while leading
            self.timer.reset(now);

            let ids: Vec<Uuid> = self.pending.keys().copied().collect();
            for proposal_id in ids {
                self.settle_proposal(proposal_id);
            }
        }
        self.publish();
    }

    fn publish(&mut self) {
        let status = self.status();
        if *self.status_tx.borrow() == status {
            return;
        }
        self.status_tx.send_replace(status);
        self.emit(MemberEvent::StatusChanged(status));
    }

    fn emit(&self, event: MemberEvent) {
        if let Some(sink) = &self.events {
            let _ = sink.send(event);
        }
    }

    fn spawn_rpc<T, Fut>(
        &self,
        peer_id: NodeId,
        rpc: &'static str,
        call: Fut,
        into_reply: impl FnOnce(Option<T>) -> PeerReply + Send + 'static,
    ) where
        T: Send + 'static,
        Fut: Future<Output = Result<T, LinkError>> + Send + 'static,
    {
        let reply_tx = self.reply_tx.clone();
        let rpc_timeout = self.config.rpc_timeout();
        let node_id = self.id;

        tokio::spawn(async move {
            let response = match timeout(rpc_timeout, call).await {
                Ok(Ok(resp)) => Some(resp),
                Ok(Err(e)) => {
                    tracing::trace!(node_id, peer_id, rpc, error = %e, "RPC failed");
                    None
                }
                Err(_) => {
                    tracing::trace!(node_id, peer_id, rpc, "RPC timed out");
                    None
                }
            };
            let _ = reply_tx.send(into_reply(response)).await;
        });
    }
}
