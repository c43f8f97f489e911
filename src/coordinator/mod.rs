pub mod engine;
pub mod proposal;
pub mod registry;

pub use engine::MaceEngine;
pub use proposal::{Proposal, ProposalResult, ProposalStatus};
pub use registry::{Admission, ProposalRegistry};
