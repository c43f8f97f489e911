use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ConsensusError, Result};
use crate::raft::NodeId;

/// Configuration for a single cluster member.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub peers: Vec<NodeId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Upper bound for any single outgoing RPC. No answer within it counts as "no".
    pub rpc_timeout_ms: u64,
    pub inbox_capacity: usize,
    /// Overrides the first election deadline only. Later deadlines are always
    /// drawn from the randomized range.
    pub initial_election_timeout_ms: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            inbox_capacity: 100,
            initial_election_timeout_ms: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId) -> Self {
        self.peers.push(node_id);
        self
    }

    pub fn with_initial_election_timeout(mut self, timeout_ms: u64) -> Self {
        self.initial_election_timeout_ms = Some(timeout_ms);
        self
    }

    /// Number of members including this one.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum(&self) -> usize {
        crate::raft::quorum_size(self.cluster_size())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Reject timing combinations that would keep a healthy leader from being stable.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(ConsensusError::InvalidConfig(format!(
                "election timeout min {}ms exceeds max {}ms",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(ConsensusError::InvalidConfig(format!(
                "heartbeat interval {}ms must be non-zero and below election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "rpc timeout must be non-zero".to_string(),
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(ConsensusError::InvalidConfig(
                "inbox capacity must be non-zero".to_string(),
            ));
        }
        if self.peers.contains(&self.node_id) {
            return Err(ConsensusError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        Ok(())
    }
}

/// Fault injection applied by the in-process network.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability that a request, or independently its response, is lost.
    pub drop_rate: f64,
    /// Probability that a delivered request is delivered a second time.
    pub duplicate_rate: f64,
    /// Each delivery is delayed by a uniform random amount up to this bound.
    pub max_delay_ms: u64,
    pub seed: Option<u64>,
}

impl FaultConfig {
    pub fn is_noop(&self) -> bool {
        self.drop_rate == 0.0 && self.duplicate_rate == 0.0 && self.max_delay_ms == 0
    }

    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("drop rate", self.drop_rate),
            ("duplicate rate", self.duplicate_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConsensusError::InvalidConfig(format!(
                    "{name} {rate} must be within [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for a whole in-process cluster. Members get ids `1..=members`.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub members: usize,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub inbox_capacity: usize,
    pub faults: FaultConfig,
    pub initial_election_timeouts: HashMap<NodeId, u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            members: 3,
            election_timeout_min_ms: node.election_timeout_min_ms,
            election_timeout_max_ms: node.election_timeout_max_ms,
            heartbeat_interval_ms: node.heartbeat_interval_ms,
            rpc_timeout_ms: node.rpc_timeout_ms,
            inbox_capacity: node.inbox_capacity,
            faults: FaultConfig::default(),
            initial_election_timeouts: HashMap::new(),
        }
    }
}

impl ClusterConfig {
    pub fn new(members: usize) -> Self {
        Self {
            members,
            ..Default::default()
        }
    }

    pub fn with_faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_initial_election_timeout(mut self, node_id: NodeId, timeout_ms: u64) -> Self {
        self.initial_election_timeouts.insert(node_id, timeout_ms);
        self
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        (1..=self.members as NodeId).collect()
    }

    /// Member configuration with every other member as a peer.
    pub fn node_config(&self, node_id: NodeId) -> NodeConfig {
        NodeConfig {
            node_id,
            peers: self
                .member_ids()
                .into_iter()
                .filter(|id| *id != node_id)
                .collect(),
            election_timeout_min_ms: self.election_timeout_min_ms,
            election_timeout_max_ms: self.election_timeout_max_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            rpc_timeout_ms: self.rpc_timeout_ms,
            inbox_capacity: self.inbox_capacity,
            initial_election_timeout_ms: self.initial_election_timeouts.get(&node_id).copied(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.members == 0 {
            return Err(ConsensusError::InvalidConfig(
                "cluster needs at least one member".to_string(),
            ));
        }
        if let Some(unknown) = self
            .initial_election_timeouts
            .keys()
            .find(|id| **id == 0 || **id > self.members as NodeId)
        {
            return Err(ConsensusError::InvalidConfig(format!(
                "initial election timeout given for unknown member {unknown}"
            )));
        }
        self.faults.validate()?;
        self.node_config(1).validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.election_timeout_min_ms, 150);
        assert_eq!(cfg.election_timeout_max_ms, 300);
        assert_eq!(cfg.heartbeat_interval_ms, 50);
        assert_eq!(cfg.rpc_timeout_ms, 100);
        assert!(cfg.initial_election_timeout_ms.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn node_config_with_peer() {
        let cfg = NodeConfig::new(1).with_peer(2).with_peer(3);
        assert_eq!(cfg.peers, vec![2, 3]);
        assert_eq!(cfg.cluster_size(), 3);
        assert_eq!(cfg.quorum(), 2);
    }

    #[test]
    fn node_config_rejects_inverted_timeout_range() {
        let cfg = NodeConfig {
            election_timeout_min_ms: 400,
            election_timeout_max_ms: 300,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConsensusError::InvalidConfig(_))));
    }

    #[test]
    fn node_config_rejects_slow_heartbeat() {
        let cfg = NodeConfig {
            heartbeat_interval_ms: 150,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn node_config_rejects_self_peer() {
        let cfg = NodeConfig::new(4).with_peer(4);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fault_config_rates_must_be_probabilities() {
        let faults = FaultConfig {
            drop_rate: 1.5,
            ..Default::default()
        };
        assert!(faults.validate().is_err());
        assert!(FaultConfig::default().is_noop());
    }

    #[test]
    fn cluster_config_builds_full_mesh() {
        let cfg = ClusterConfig::new(5).with_initial_election_timeout(3, 0);
        assert_eq!(cfg.member_ids(), vec![1, 2, 3, 4, 5]);

        let node = cfg.node_config(3);
        assert_eq!(node.peers, vec![1, 2, 4, 5]);
        assert_eq!(node.initial_election_timeout_ms, Some(0));
        assert_eq!(cfg.node_config(1).initial_election_timeout_ms, None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn cluster_config_rejects_unknown_override() {
        let cfg = ClusterConfig::new(3).with_initial_election_timeout(9, 0);
        assert!(cfg.validate().is_err());
        assert!(ClusterConfig::new(0).validate().is_err());
    }
}
