//! RPC boundary between members, and between the coordinator and members.
//!
//! Calls may be lost, duplicated, delayed or reordered by an implementation;
//! the protocol only relies on a call either answering or failing.

pub mod local;

use async_trait::async_trait;

use crate::error::LinkError;
use crate::raft::rpc::{
    AcceptRequest, AcceptResponse, HeartbeatRequest, HeartbeatResponse, ProposeRequest,
    ProposeResponse, VoteRequest, VoteResponse,
};
use crate::raft::{MemberStatus, NodeId};

pub use local::{LocalLink, LocalNetwork};

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn request_vote(&self, target: NodeId, req: VoteRequest)
        -> Result<VoteResponse, LinkError>;

    async fn heartbeat(
        &self,
        target: NodeId,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, LinkError>;

    async fn accept(&self, target: NodeId, req: AcceptRequest)
        -> Result<AcceptResponse, LinkError>;

    async fn propose(
        &self,
        target: NodeId,
        req: ProposeRequest,
    ) -> Result<ProposeResponse, LinkError>;

    async fn status(&self, target: NodeId) -> Result<MemberStatus, LinkError>;
}
