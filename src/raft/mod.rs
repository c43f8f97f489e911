pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use node::{Inbox, MemberEvent, RaftMessage, RaftNode};
pub use state::{quorum_size, MemberStatus, RaftRole, RaftState, RoleEvent};

/// Identifier of a cluster member. Fixed for the member's lifetime.
pub type NodeId = u64;
