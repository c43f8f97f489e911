//! In-process cluster: members on a [`LocalNetwork`], a coordinator tracking
//! all of them, and an invariant monitor fed by member events.

pub mod monitor;
pub mod scenario;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::coordinator::{MaceEngine, ProposalResult};
use crate::error::Result;
use crate::link::LocalNetwork;
use crate::raft::{MemberEvent, MemberStatus, NodeId, RaftMessage, RaftNode, RaftRole};

pub use monitor::{InvariantMonitor, InvariantViolation};
pub use scenario::{run_scenario, ScenarioConfig, ScenarioReport};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a running member task.
struct MemberHandle {
    sender: mpsc::Sender<RaftMessage>,
    status_rx: watch::Receiver<MemberStatus>,
    handle: JoinHandle<()>,
}

pub struct ClusterDriver {
    config: ClusterConfig,
    network: LocalNetwork,
    members: BTreeMap<NodeId, MemberHandle>,
    engine: Arc<MaceEngine>,
    monitor: InvariantMonitor,
    events: mpsc::UnboundedReceiver<MemberEvent>,
    shutdown: CancellationToken,
}

impl ClusterDriver {
    /// Bootstrap every member of `config` and start their loops.
    pub async fn start(config: ClusterConfig) -> Result<Self> {
        config.validate()?;

        let network = LocalNetwork::new(config.faults.clone())?;
        let shutdown = CancellationToken::new();
        let (events_tx, events) = mpsc::unbounded_channel();

        let mut members = BTreeMap::new();
        for id in config.member_ids() {
            let node_config = config.node_config(id);
            node_config.validate()?;

            let (node, inbox) = RaftNode::new(node_config, network.link_for(id));
            let node = node.with_event_sink(events_tx.clone());
            let sender = node.message_sender();
            let status_rx = node.subscribe_status();
            network.register(id, sender.clone()).await;

            let token = shutdown.clone();
            let handle = tokio::spawn(async move {
                node.run(inbox, token).await;
            });

            members.insert(
                id,
                MemberHandle {
                    sender,
                    status_rx,
                    handle,
                },
            );
        }

        let engine = Arc::new(
            MaceEngine::new(config.member_ids(), network.client_link())
                .with_status_timeout(Duration::from_millis(config.rpc_timeout_ms)),
        );

        tracing::info!(members = config.members, "Cluster started");

        Ok(Self {
            config,
            network,
            members,
            engine,
            monitor: InvariantMonitor::new(),
            events,
            shutdown,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Ids of members that have not crashed.
    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.keys().copied().collect()
    }

    pub fn status(&self, id: NodeId) -> Option<MemberStatus> {
        self.members.get(&id).map(|m| *m.status_rx.borrow())
    }

    pub fn statuses(&self) -> Vec<MemberStatus> {
        self.members.values().map(|m| *m.status_rx.borrow()).collect()
    }

    /// Live member that leads the highest term, if any.
    pub fn leader(&self) -> Option<MemberStatus> {
        self.statuses()
            .into_iter()
            .filter(|s| s.role == RaftRole::Leader)
            .max_by_key(|s| s.term)
    }

    /// Highest term any live member has reached.
    pub fn max_term(&self) -> u64 {
        self.statuses().iter().map(|s| s.term).max().unwrap_or(0)
    }

    /// Ask every live member to check its timers now.
    pub fn tick_all(&self) {
        for (id, member) in &self.members {
            if let Err(e) = member.sender.try_send(RaftMessage::Tick) {
                tracing::debug!(node_id = id, error = %e, "Tick not delivered");
            }
        }
    }

    /// Let the cluster run for `duration`, then fold pending member events
    /// into the monitor.
    pub async fn run_for(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await;
        self.drain_events();
    }

    /// Wait until some live member leads, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<MemberStatus> {
        if wait_for(|| async { self.leader().is_some() }, timeout, POLL_INTERVAL).await {
            self.leader()
        } else {
            None
        }
    }

    /// Wait for a live leader whose term is above `term`.
    pub async fn wait_for_leader_after(&self, term: u64, timeout: Duration) -> Option<MemberStatus> {
        let found = wait_for(
            || async { self.leader().map(|l| l.term > term).unwrap_or(false) },
            timeout,
            POLL_INTERVAL,
        )
        .await;
        if found {
            self.leader()
        } else {
            None
        }
    }

    pub async fn propose(&self, payload: impl Into<Vec<u8>>, timeout: Duration) -> ProposalResult {
        self.engine.propose_truth(payload, timeout).await
    }

    pub fn engine(&self) -> Arc<MaceEngine> {
        self.engine.clone()
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// Stop a member abruptly. Its inbox goes away with it.
    pub async fn crash(&mut self, id: NodeId) -> bool {
        let Some(member) = self.members.remove(&id) else {
            return false;
        };
        member.handle.abort();
        self.network.unregister(id).await;
        tracing::info!(node_id = id, "Member crashed");
        true
    }

    /// Cut every link to and from `id`.
    pub async fn isolate(&self, id: NodeId) {
        tracing::info!(node_id = id, "Isolating member");
        self.network.isolate(id).await;
    }

    pub async fn heal(&self, id: NodeId) {
        tracing::info!(node_id = id, "Healing member");
        self.network.heal(id).await;
    }

    pub async fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        tracing::info!(?group_a, ?group_b, "Partitioning cluster");
        self.network.partition(group_a, group_b).await;
    }

    pub async fn heal_partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        tracing::info!(?group_a, ?group_b, "Healing partition");
        self.network.heal_partition(group_a, group_b).await;
    }

    /// Violations seen in every event reported so far.
    pub fn check_invariants(&mut self) -> Vec<InvariantViolation> {
        self.drain_events();
        self.monitor.violations().to_vec()
    }

    pub fn monitor(&self) -> &InvariantMonitor {
        &self.monitor
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.monitor.record(&event);
        }
    }

    /// Stop all members and wait for their loops to exit.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        for (id, member) in std::mem::take(&mut self.members) {
            if let Err(e) = member.handle.await {
                tracing::warn!(node_id = id, error = %e, "Member task ended abnormally");
            }
        }
        self.drain_events();
        tracing::info!("Cluster stopped");
    }
}

impl Drop for ClusterDriver {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for member in self.members.values() {
            member.handle.abort();
        }
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    condition().await
}
