//! RPC handling of a single running member, driven over the local network.

use std::sync::Arc;

use mace_consensus::config::{FaultConfig, NodeConfig};
use mace_consensus::link::{LocalNetwork, PeerLink};
use mace_consensus::raft::rpc::{
    AcceptRequest, HeartbeatRequest, ProposeOutcome, ProposeRequest, VoteRequest,
};
use mace_consensus::raft::{MemberEvent, RaftNode, RaftRole};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct SoloMember {
    link: Arc<dyn PeerLink>,
    events: mpsc::UnboundedReceiver<MemberEvent>,
    shutdown: CancellationToken,
}

impl SoloMember {
    /// Member 1 with peers 2 and 3 that never exist, and a timeout far away.
    async fn start() -> Self {
        let network = LocalNetwork::new(FaultConfig::default()).unwrap();
        let config = NodeConfig::new(1)
            .with_peer(2)
            .with_peer(3)
            .with_initial_election_timeout(60_000);

        let (events_tx, events) = mpsc::unbounded_channel();
        let (node, inbox) = RaftNode::new(config, network.link_for(1));
        let node = node.with_event_sink(events_tx);
        network.register(1, node.message_sender()).await;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { node.run(inbox, token).await });

        Self {
            link: network.client_link(),
            events,
            shutdown,
        }
    }

    async fn vote(&self, term: u64, candidate_id: u64) -> bool {
        self.link
            .request_vote(1, VoteRequest { term, candidate_id })
            .await
            .unwrap()
            .vote_granted
    }

    fn vote_events(&mut self) -> Vec<(u64, u64)> {
        let mut grants = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let MemberEvent::VoteGranted { term, candidate, .. } = event {
                grants.push((term, candidate));
            }
        }
        grants
    }
}

impl Drop for SoloMember {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_vote_per_term() {
    let mut member = SoloMember::start().await;

    assert!(member.vote(5, 2).await);
    assert!(!member.vote(5, 3).await, "second candidate in the same term");
    assert!(member.vote(5, 2).await, "same candidate may ask again");
    assert!(member.vote(6, 3).await, "new term frees the vote");

    // Re-granting to the same candidate is not a second vote
    assert_eq!(member.vote_events(), vec![(5, 2), (6, 3)]);

    let status = member.link.status(1).await.unwrap();
    assert_eq!(status.term, 6);
    assert_eq!(status.voted_for, Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_stale_heartbeat_rejected() {
    let member = SoloMember::start().await;
    assert!(member.vote(3, 2).await);

    let resp = member
        .link
        .heartbeat(
            1,
            HeartbeatRequest {
                term: 2,
                leader_id: 3,
            },
        )
        .await
        .unwrap();

    assert!(!resp.success);
    assert_eq!(resp.term, 3);

    let status = member.link.status(1).await.unwrap();
    assert_eq!(status.term, 3);
    assert_eq!(status.role, RaftRole::Follower);
    assert_eq!(status.leader_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_installs_leader_and_higher_term() {
    let member = SoloMember::start().await;

    let resp = member
        .link
        .heartbeat(
            1,
            HeartbeatRequest {
                term: 4,
                leader_id: 2,
            },
        )
        .await
        .unwrap();

    assert!(resp.success);
    assert_eq!(resp.term, 4);

    let status = member.link.status(1).await.unwrap();
    assert_eq!(status.term, 4);
    assert_eq!(status.leader_id, Some(2));
    assert_eq!(status.voted_for, None);
}

#[tokio::test(start_paused = true)]
async fn test_stale_vote_request_rejected() {
    let member = SoloMember::start().await;
    assert!(member.vote(7, 2).await);

    let resp = member
        .link
        .request_vote(
            1,
            VoteRequest {
                term: 6,
                candidate_id: 3,
            },
        )
        .await
        .unwrap();

    assert!(!resp.vote_granted);
    assert_eq!(resp.term, 7);
}

#[tokio::test(start_paused = true)]
async fn test_accept_from_current_leader() {
    let member = SoloMember::start().await;

    let resp = member
        .link
        .accept(
            1,
            AcceptRequest {
                term: 2,
                leader_id: 3,
                proposal_id: Uuid::new_v4(),
                payload: b"truth".to_vec(),
            },
        )
        .await
        .unwrap();

    assert!(resp.accepted);
    assert_eq!(member.link.status(1).await.unwrap().leader_id, Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_follower_redirects_proposals() {
    let member = SoloMember::start().await;
    member
        .link
        .heartbeat(
            1,
            HeartbeatRequest {
                term: 1,
                leader_id: 2,
            },
        )
        .await
        .unwrap();

    let resp = member
        .link
        .propose(
            1,
            ProposeRequest {
                proposal_id: Uuid::new_v4(),
                term: 1,
                payload: b"truth".to_vec(),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        resp.outcome,
        ProposeOutcome::NotLeader {
            leader_hint: Some(2)
        }
    );
    assert!(resp.accepted_by.is_empty());
}
