pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod link;
pub mod raft;
pub mod shutdown;

pub use config::{ClusterConfig, FaultConfig, NodeConfig};
pub use coordinator::{MaceEngine, ProposalResult};
pub use driver::ClusterDriver;
pub use error::{ConsensusError, LinkError};
pub use raft::NodeId;
