use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::config::FaultConfig;
use crate::error::{LinkError, Result};
use crate::link::PeerLink;
use crate::raft::rpc::{
    AcceptRequest, AcceptResponse, HeartbeatRequest, HeartbeatResponse, ProposeRequest,
    ProposeResponse, VoteRequest, VoteResponse,
};
use crate::raft::{MemberStatus, NodeId, RaftMessage};

/// In-process transport: one inbox per member, addressed by id.
///
/// Links between members are subject to the configured [`FaultConfig`] and to
/// severed directions (partitions). Client links used by the coordinator are
/// never severed and never faulty.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    mailboxes: RwLock<HashMap<NodeId, mpsc::Sender<RaftMessage>>>,
    // (from, to) pairs that cannot deliver
    severed: RwLock<HashSet<(NodeId, NodeId)>>,
    faults: RwLock<FaultConfig>,
    rng: Mutex<StdRng>,
}

#[derive(Debug, Default)]
struct Delivery {
    drop_request: bool,
    drop_response: bool,
    duplicate: bool,
    delay: Duration,
}

impl LocalNetwork {
    pub fn new(faults: FaultConfig) -> Result<Self> {
        faults.validate()?;
        let rng = match faults.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                mailboxes: RwLock::new(HashMap::new()),
                severed: RwLock::new(HashSet::new()),
                faults: RwLock::new(faults),
                rng: Mutex::new(rng),
            }),
        })
    }

    /// Make `id` reachable through `sender`.
    pub async fn register(&self, id: NodeId, sender: mpsc::Sender<RaftMessage>) {
        self.inner.mailboxes.write().await.insert(id, sender);
    }

    /// Forget `id`; calls to it fail from now on.
    pub async fn unregister(&self, id: NodeId) -> bool {
        self.inner.mailboxes.write().await.remove(&id).is_some()
    }

    pub async fn members(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.inner.mailboxes.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Link used by member `from` to reach its peers.
    pub fn link_for(&self, from: NodeId) -> Arc<dyn PeerLink> {
        Arc::new(LocalLink {
            from: Some(from),
            network: self.clone(),
        })
    }

    /// Link for callers outside the member set, such as the coordinator.
    pub fn client_link(&self) -> Arc<dyn PeerLink> {
        Arc::new(LocalLink {
            from: None,
            network: self.clone(),
        })
    }

    pub async fn set_faults(&self, faults: FaultConfig) -> Result<()> {
        faults.validate()?;
        if let Some(seed) = faults.seed {
            *self.inner.rng.lock().await = StdRng::seed_from_u64(seed);
        }
        *self.inner.faults.write().await = faults;
        Ok(())
    }

    /// Stop delivery from `from` to `to` only.
    pub async fn sever(&self, from: NodeId, to: NodeId) {
        self.inner.severed.write().await.insert((from, to));
    }

    /// Cut both directions between `a` and `b`.
    pub async fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut severed = self.inner.severed.write().await;
        severed.insert((a, b));
        severed.insert((b, a));
    }

    pub async fn reconnect(&self, a: NodeId, b: NodeId) {
        let mut severed = self.inner.severed.write().await;
        severed.remove(&(a, b));
        severed.remove(&(b, a));
    }

    /// Partition the members into `group_a` and `group_b`.
    pub async fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        for &a in group_a {
            for &b in group_b {
                self.disconnect(a, b).await;
            }
        }
    }

    pub async fn heal_partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        for &a in group_a {
            for &b in group_b {
                self.reconnect(a, b).await;
            }
        }
    }

    /// Cut `id` off from every other registered member.
    pub async fn isolate(&self, id: NodeId) {
        let others: Vec<NodeId> = self.members().await.into_iter().filter(|m| *m != id).collect();
        self.partition(&[id], &others).await;
    }

    pub async fn heal(&self, id: NodeId) {
        let others: Vec<NodeId> = self.members().await.into_iter().filter(|m| *m != id).collect();
        self.heal_partition(&[id], &others).await;
    }

    pub async fn heal_all(&self) {
        self.inner.severed.write().await.clear();
    }

    pub async fn is_severed(&self, from: NodeId, to: NodeId) -> bool {
        self.inner.severed.read().await.contains(&(from, to))
    }

    async fn roll(&self) -> Delivery {
        let faults = self.inner.faults.read().await.clone();
        if faults.is_noop() {
            return Delivery::default();
        }

        let mut rng = self.inner.rng.lock().await;
        let delay_ms = if faults.max_delay_ms > 0 {
            rng.gen_range(0..=faults.max_delay_ms)
        } else {
            0
        };
        Delivery {
            drop_request: rng.gen_bool(faults.drop_rate),
            drop_response: rng.gen_bool(faults.drop_rate),
            duplicate: rng.gen_bool(faults.duplicate_rate),
            delay: Duration::from_millis(delay_ms),
        }
    }

    async fn deliver<R, F>(
        &self,
        from: Option<NodeId>,
        target: NodeId,
        build: F,
    ) -> std::result::Result<R, LinkError>
    where
        R: Send,
        F: Fn(oneshot::Sender<R>) -> RaftMessage + Send,
    {
        if let Some(from) = from {
            if self.is_severed(from, target).await {
                return Err(LinkError::Unreachable(target));
            }
        }

        let sender = self
            .inner
            .mailboxes
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or(LinkError::UnknownPeer(target))?;

        let plan = match from {
            Some(_) => self.roll().await,
            None => Delivery::default(),
        };

        if !plan.delay.is_zero() {
            tokio::time::sleep(plan.delay).await;
        }
        if plan.drop_request {
            return Err(LinkError::Dropped(target));
        }

        let (response_tx, response_rx) = oneshot::channel();
        sender
            .send(build(response_tx))
            .await
            .map_err(|_| LinkError::Closed(target))?;

        if plan.duplicate {
            // The copy's answer goes nowhere
            let (copy_tx, _) = oneshot::channel();
            let _ = sender.send(build(copy_tx)).await;
        }

        let response = response_rx.await.map_err(|_| LinkError::Dropped(target))?;

        if let Some(from) = from {
            if plan.drop_response || self.is_severed(target, from).await {
                return Err(LinkError::Dropped(target));
            }
        }
        Ok(response)
    }
}

/// A [`LocalNetwork`] endpoint, optionally bound to a sending member.
pub struct LocalLink {
    from: Option<NodeId>,
    network: LocalNetwork,
}

#[async_trait]
impl PeerLink for LocalLink {
    async fn request_vote(
        &self,
        target: NodeId,
        req: VoteRequest,
    ) -> std::result::Result<VoteResponse, LinkError> {
        self.network
            .deliver(self.from, target, |response_tx| RaftMessage::RequestVote {
                req: req.clone(),
                response_tx,
            })
            .await
    }

    async fn heartbeat(
        &self,
        target: NodeId,
        req: HeartbeatRequest,
    ) -> std::result::Result<HeartbeatResponse, LinkError> {
        self.network
            .deliver(self.from, target, |response_tx| RaftMessage::Heartbeat {
                req: req.clone(),
                response_tx,
            })
            .await
    }

    async fn accept(
        &self,
        target: NodeId,
        req: AcceptRequest,
    ) -> std::result::Result<AcceptResponse, LinkError> {
        self.network
            .deliver(self.from, target, |response_tx| RaftMessage::Accept {
                req: req.clone(),
                response_tx,
            })
            .await
    }

    async fn propose(
        &self,
        target: NodeId,
        req: ProposeRequest,
    ) -> std::result::Result<ProposeResponse, LinkError> {
        self.network
            .deliver(self.from, target, |response_tx| RaftMessage::Propose {
                req: req.clone(),
                response_tx,
            })
            .await
    }

    async fn status(&self, target: NodeId) -> std::result::Result<MemberStatus, LinkError> {
        self.network
            .deliver(self.from, target, |response_tx| RaftMessage::GetStatus {
                response_tx,
            })
            .await
    }
}
