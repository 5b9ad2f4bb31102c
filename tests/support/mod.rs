//! In-memory transport and signaling harness for scenario tests.
//!
//! A `Switchboard` plays the role a real WebRTC stack would: every
//! `MockTransportDriver::send` looks up the registered inbox for the
//! counterparty and pushes bytes straight into it, so two
//! `mesh_core::facade::Mesh` instances can exchange frames without any
//! network I/O. `SignalingBroker` does the same for the rendezvous
//! layer — joins register an inbox, offers/answers/candidates are
//! relayed point-to-point, and `peer-list` pushes go out to everyone
//! already joined. Grounded in the substrate network crate's in-memory
//! test transport (`other_examples` pack) generalized to this crate's
//! driver/factory/connector seams.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use mesh_core::error::MeshError;
use mesh_core::signaling::{LocalDiscovery, SignalingConnector, SignalingFrame, SignalingLink};
use mesh_core::transport::{Transport, TransportDriver, TransportFactory};
use mesh_core::wire::NodeId;

const CHANNEL_CAPACITY: usize = 256;

/// Shared in-memory "ether" every mock transport driver sends through.
#[derive(Default)]
pub struct Switchboard {
    inboxes: Mutex<HashMap<(NodeId, NodeId), mpsc::Sender<Vec<u8>>>>,
    /// Nodes whose outbound sends are silently dropped — simulates a
    /// severed link without tearing down the registered driver.
    partitioned: Mutex<std::collections::HashSet<(NodeId, NodeId)>>,
}

impl Switchboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, from: NodeId, to: NodeId, tx: mpsc::Sender<Vec<u8>>) {
        self.inboxes.lock().insert((from, to), tx);
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, bytes: Vec<u8>) {
        if self
            .partitioned
            .lock()
            .contains(&(from.clone(), to.clone()))
        {
            return;
        }
        let tx = self.inboxes.lock().get(&(to.clone(), from.clone())).cloned();
        if let Some(tx) = tx {
            let _ = tx.try_send(bytes);
        }
    }

    /// Sever `a -> b` (one direction) without affecting `b -> a`. Call
    /// twice to fully partition a pair.
    pub fn partition(&self, a: &str, b: &str) {
        self.partitioned
            .lock()
            .insert((a.to_string(), b.to_string()));
    }

    pub fn heal(&self, a: &str, b: &str) {
        self.partitioned
            .lock()
            .remove(&(a.to_string(), b.to_string()));
    }
}

pub struct MockTransportDriver {
    self_id: NodeId,
    peer: NodeId,
    switchboard: Arc<Switchboard>,
    open: AtomicBool,
    latency_ms: AtomicU32,
    /// `0` reported back through `latency_ms()` as "no measurement yet".
    has_latency: AtomicBool,
}

#[async_trait]
impl TransportDriver for MockTransportDriver {
    async fn create_offer(&self) -> Result<Vec<u8>, MeshError> {
        Ok(b"offer".to_vec())
    }

    async fn create_answer(&self, _remote_offer: &[u8]) -> Result<Vec<u8>, MeshError> {
        Ok(b"answer".to_vec())
    }

    async fn apply_remote_answer(&self, _answer: &[u8]) -> Result<(), MeshError> {
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: &[u8]) -> Result<(), MeshError> {
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), MeshError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(MeshError::TransportOpenFailed {
                peer: self.peer.clone(),
                reason: "driver closed".into(),
            });
        }
        self.switchboard
            .deliver(&self.self_id, &self.peer, frame.to_vec());
        Ok(())
    }

    fn is_data_channel_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn latency_ms(&self) -> Option<u32> {
        if self.has_latency.load(Ordering::SeqCst) {
            Some(self.latency_ms.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl MockTransportDriver {
    pub fn set_latency(&self, latency_ms: u32) {
        self.latency_ms.store(latency_ms, Ordering::SeqCst);
        self.has_latency.store(true, Ordering::SeqCst);
    }

    pub fn force_close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

pub struct MockTransportFactory {
    self_id: NodeId,
    switchboard: Arc<Switchboard>,
    /// Every driver this factory has ever minted, keyed by the remote
    /// peer id, so scenario tests can reach in and force a specific
    /// connection closed (simulating a driver-level failure) without
    /// the pool exposing its internals.
    drivers: Mutex<HashMap<NodeId, Arc<MockTransportDriver>>>,
}

impl MockTransportFactory {
    pub fn new(self_id: NodeId, switchboard: Arc<Switchboard>) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            switchboard,
            drivers: Mutex::new(HashMap::new()),
        })
    }

    /// The driver this node uses to talk to `peer`, if a connection to
    /// it has been created.
    pub fn driver_for(&self, peer: &str) -> Option<Arc<MockTransportDriver>> {
        self.drivers.lock().get(peer).cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        peer: &NodeId,
        _transport: Transport,
    ) -> Result<(Arc<dyn TransportDriver>, mpsc::Receiver<Vec<u8>>), MeshError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.switchboard
            .register(peer.clone(), self.self_id.clone(), tx);
        let driver = Arc::new(MockTransportDriver {
            self_id: self.self_id.clone(),
            peer: peer.clone(),
            switchboard: self.switchboard.clone(),
            open: AtomicBool::new(true),
            latency_ms: AtomicU32::new(0),
            has_latency: AtomicBool::new(false),
        });
        self.drivers.lock().insert(peer.clone(), driver.clone());
        Ok((driver, rx))
    }
}

/// Shared in-memory rendezvous broker for [`MockSignalingConnector`].
#[derive(Default)]
pub struct SignalingBroker {
    members: Mutex<HashMap<NodeId, mpsc::Sender<SignalingFrame>>>,
}

impl SignalingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn join(&self, id: NodeId, tx: mpsc::Sender<SignalingFrame>) {
        let mut members = self.members.lock();
        let peers: Vec<NodeId> = members.keys().cloned().collect();
        members.insert(id.clone(), tx.clone());
        let _ = tx.try_send(SignalingFrame::PeerList { peers });
        for (other_id, other_tx) in members.iter() {
            if *other_id != id {
                let _ = other_tx.try_send(SignalingFrame::PeerList {
                    peers: members.keys().cloned().collect(),
                });
            }
        }
    }

    fn relay(&self, frame: SignalingFrame) {
        let target = match &frame {
            SignalingFrame::Offer { target, .. }
            | SignalingFrame::Answer { target, .. }
            | SignalingFrame::IceCandidate { target, .. } => target.clone(),
            _ => return,
        };
        if let Some(tx) = self.members.lock().get(&target).cloned() {
            let _ = tx.try_send(frame);
        }
    }
}

struct MockSignalingLink {
    broker: Arc<SignalingBroker>,
}

#[async_trait]
impl SignalingLink for MockSignalingLink {
    async fn send(&self, frame: SignalingFrame) -> Result<(), MeshError> {
        if matches!(frame, SignalingFrame::Join { .. }) {
            return Ok(()); // join is handled at connect() time in this mock
        }
        self.broker.relay(frame);
        Ok(())
    }

    async fn close(&self) {}
}

/// Per-node signaling connector: the mock broker needs to know which
/// node id a connection belongs to before `Join` arrives on the wire,
/// since it routes purely in-memory rather than over a socket.
pub struct NodeSignalingConnector {
    node_id: NodeId,
    broker: Arc<SignalingBroker>,
    pub fail: Arc<AtomicBool>,
}

impl NodeSignalingConnector {
    pub fn new(node_id: NodeId, broker: Arc<SignalingBroker>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            broker,
            fail: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl SignalingConnector for NodeSignalingConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Arc<dyn SignalingLink>, mpsc::Receiver<SignalingFrame>), MeshError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MeshError::SignalingUnavailable);
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.broker.join(self.node_id.clone(), tx);
        let link = Arc::new(MockSignalingLink {
            broker: self.broker.clone(),
        });
        Ok((link, rx))
    }
}

/// Local-discovery fallback that never finds anyone — used to exercise
/// the "every URL failed, no discovery either" error path without a
/// real local-discovery implementation.
pub struct NoLocalDiscovery;

#[async_trait]
impl LocalDiscovery for NoLocalDiscovery {
    async fn announce(&self, _id: &NodeId) {}

    fn subscribe(&self) -> mpsc::Receiver<NodeId> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }
}

/// A rendezvous that only ever introduces explicitly-wired adjacent
/// nodes to each other, instead of [`SignalingBroker`]'s "everyone meets
/// everyone". Lets scenario tests pin down a specific mesh topology
/// (e.g. a three-node line) since the peer-connection manager otherwise
/// dials out to every peer-list entry it's handed.
#[derive(Default)]
pub struct TopologyBroker {
    adjacency: Mutex<HashMap<NodeId, std::collections::HashSet<NodeId>>>,
    members: Mutex<HashMap<NodeId, mpsc::Sender<SignalingFrame>>>,
}

impl TopologyBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wire `a` and `b` as neighbours. If both are already joined, each
    /// is immediately told about the other (models a link opening at
    /// runtime, e.g. the partition-healing scenario).
    pub fn add_edge(&self, a: &str, b: &str) {
        self.adjacency
            .lock()
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.adjacency
            .lock()
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
        self.notify_if_both_online(a, b);
        self.notify_if_both_online(b, a);
    }

    fn notify_if_both_online(&self, id: &str, new_neighbor: &str) {
        let members = self.members.lock();
        if let Some(tx) = members.get(id) {
            if members.contains_key(new_neighbor) {
                let _ = tx.try_send(SignalingFrame::PeerList {
                    peers: vec![new_neighbor.to_string()],
                });
            }
        }
    }

    fn join(&self, id: NodeId, tx: mpsc::Sender<SignalingFrame>) {
        let online_neighbors: Vec<NodeId> = {
            let adjacency = self.adjacency.lock();
            let members = self.members.lock();
            adjacency
                .get(&id)
                .map(|set| {
                    set.iter()
                        .filter(|p| members.contains_key(*p))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        self.members.lock().insert(id.clone(), tx.clone());
        let _ = tx.try_send(SignalingFrame::PeerList {
            peers: online_neighbors,
        });

        let neighbors: Vec<NodeId> = self
            .adjacency
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();
        let members = self.members.lock();
        for neighbor in neighbors {
            if let Some(ntx) = members.get(&neighbor) {
                let _ = ntx.try_send(SignalingFrame::PeerList {
                    peers: vec![id.clone()],
                });
            }
        }
    }

    fn relay(&self, frame: SignalingFrame) {
        let target = match &frame {
            SignalingFrame::Offer { target, .. }
            | SignalingFrame::Answer { target, .. }
            | SignalingFrame::IceCandidate { target, .. } => target.clone(),
            _ => return,
        };
        if let Some(tx) = self.members.lock().get(&target).cloned() {
            let _ = tx.try_send(frame);
        }
    }
}

struct TopologyLink {
    broker: Arc<TopologyBroker>,
}

#[async_trait]
impl SignalingLink for TopologyLink {
    async fn send(&self, frame: SignalingFrame) -> Result<(), MeshError> {
        if matches!(frame, SignalingFrame::Join { .. }) {
            return Ok(());
        }
        self.broker.relay(frame);
        Ok(())
    }

    async fn close(&self) {}
}

pub struct TopologyConnector {
    node_id: NodeId,
    broker: Arc<TopologyBroker>,
}

impl TopologyConnector {
    pub fn new(node_id: NodeId, broker: Arc<TopologyBroker>) -> Arc<Self> {
        Arc::new(Self { node_id, broker })
    }
}

#[async_trait]
impl SignalingConnector for TopologyConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Arc<dyn SignalingLink>, mpsc::Receiver<SignalingFrame>), MeshError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.broker.join(self.node_id.clone(), tx);
        let link = Arc::new(TopologyLink {
            broker: self.broker.clone(),
        });
        Ok((link, rx))
    }
}

/// Poll `predicate` against a fresh snapshot (built by `poll`) until it
/// returns `true` or `timeout` real wall-clock time elapses. Scenario
/// tests run under real (unpaused) tokio time so connection-handshake
/// tasks spawned by the actor actually get scheduled; this bridges
/// "event-driven" mesh state into a plain `assert!`.
pub async fn wait_until<F, Fut>(timeout: std::time::Duration, mut poll: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if poll().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
