//! Three-node in-process demo: A—B—C, A sends a unicast to C across the
//! reactive route discovery, then B broadcasts. Not a production
//! transport — a minimal in-memory driver wired the same way
//! `tests/support/mod.rs` wires its mocks, just inlined here since a
//! binary target can't depend on the crate's `tests/` module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use mesh_core::error::MeshError;
use mesh_core::facade::Mesh;
use mesh_core::signaling::{LocalDiscovery, SignalingConnector, SignalingFrame, SignalingLink};
use mesh_core::transport::{Transport, TransportDriver, TransportFactory};
use mesh_core::wire::{MessageKind, NodeId};
use mesh_core::MeshConfig;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct Ether {
    inboxes: Mutex<HashMap<(NodeId, NodeId), mpsc::Sender<Vec<u8>>>>,
}

impl Ether {
    fn register(&self, from: NodeId, to: NodeId, tx: mpsc::Sender<Vec<u8>>) {
        self.inboxes.lock().insert((from, to), tx);
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, bytes: Vec<u8>) {
        if let Some(tx) = self.inboxes.lock().get(&(to.clone(), from.clone())).cloned() {
            let _ = tx.try_send(bytes);
        }
    }
}

struct DemoDriver {
    self_id: NodeId,
    peer: NodeId,
    ether: Arc<Ether>,
    open: AtomicBool,
}

#[async_trait]
impl TransportDriver for DemoDriver {
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
        self.ether.deliver(&self.self_id, &self.peer, frame.to_vec());
        Ok(())
    }

    fn is_data_channel_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn latency_ms(&self) -> Option<u32> {
        Some(5)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

struct DemoFactory {
    self_id: NodeId,
    ether: Arc<Ether>,
}

#[async_trait]
impl TransportFactory for DemoFactory {
    async fn create(
        &self,
        peer: &NodeId,
        _transport: Transport,
    ) -> Result<(Arc<dyn TransportDriver>, mpsc::Receiver<Vec<u8>>), MeshError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.ether.register(peer.clone(), self.self_id.clone(), tx);
        let driver = Arc::new(DemoDriver {
            self_id: self.self_id.clone(),
            peer: peer.clone(),
            ether: self.ether.clone(),
            open: AtomicBool::new(true),
        });
        Ok((driver, rx))
    }
}

#[derive(Default)]
struct Rendezvous {
    members: Mutex<HashMap<NodeId, mpsc::Sender<SignalingFrame>>>,
}

impl Rendezvous {
    fn join(&self, id: NodeId, tx: mpsc::Sender<SignalingFrame>) {
        let mut members = self.members.lock();
        for (other_id, other_tx) in members.iter() {
            if *other_id != id {
                let _ = other_tx.try_send(SignalingFrame::PeerList {
                    peers: members.keys().chain([&id]).cloned().collect(),
                });
            }
        }
        let peers: Vec<NodeId> = members.keys().cloned().collect();
        members.insert(id, tx.clone());
        let _ = tx.try_send(SignalingFrame::PeerList { peers });
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

struct DemoLink {
    rendezvous: Arc<Rendezvous>,
}

#[async_trait]
impl SignalingLink for DemoLink {
    async fn send(&self, frame: SignalingFrame) -> Result<(), MeshError> {
        if matches!(frame, SignalingFrame::Join { .. }) {
            return Ok(());
        }
        self.rendezvous.relay(frame);
        Ok(())
    }

    async fn close(&self) {}
}

struct DemoConnector {
    node_id: NodeId,
    rendezvous: Arc<Rendezvous>,
}

#[async_trait]
impl SignalingConnector for DemoConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Arc<dyn SignalingLink>, mpsc::Receiver<SignalingFrame>), MeshError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.rendezvous.join(self.node_id.clone(), tx);
        Ok((Arc::new(DemoLink { rendezvous: self.rendezvous.clone() }), rx))
    }
}

struct NoDiscovery;

#[async_trait]
impl LocalDiscovery for NoDiscovery {
    async fn announce(&self, _id: &NodeId) {}

    fn subscribe(&self) -> mpsc::Receiver<NodeId> {
        mpsc::channel(1).1
    }
}

async fn spawn_node(id: &str, rendezvous: Arc<Rendezvous>, ether: Arc<Ether>) -> Mesh {
    let node_id = id.to_string();
    let config = MeshConfig::new(
        vec!["demo://rendezvous".into()],
        Arc::new(DemoFactory { self_id: node_id.clone(), ether }),
        Arc::new(DemoConnector { node_id: node_id.clone(), rendezvous }),
    )
    .with_node_id(node_id)
    .with_local_discovery(Arc::new(NoDiscovery));

    Mesh::initialize(config)
        .await
        .expect("demo signaling never fails both paths")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mesh_core=info".parse().unwrap()))
        .init();

    let rendezvous = Arc::new(Rendezvous::default());
    let ether = Arc::new(Ether::default());

    let a = spawn_node("node-a", rendezvous.clone(), ether.clone()).await;
    let b = spawn_node("node-b", rendezvous.clone(), ether.clone()).await;
    let c = spawn_node("node-c", rendezvous.clone(), ether.clone()).await;

    let mut a_events = a.subscribe();
    let mut c_events = c.subscribe();

    // Give the discovery/peer-list fan-out a moment to settle.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tracing::info!(peers = ?a.connected_peers().await, "node-a sees");
    tracing::info!(peers = ?b.connected_peers().await, "node-b sees");
    tracing::info!(peers = ?c.connected_peers().await, "node-c sees");

    a.send("node-c", b"hello from a".to_vec(), MessageKind::Text);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    while let Ok(event) = c_events.try_recv() {
        tracing::info!(?event, "node-c observed");
    }

    b.broadcast(b"hi everyone".to_vec(), MessageKind::Text);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    while let Ok(event) = a_events.try_recv() {
        tracing::info!(?event, "node-a observed");
    }

    tracing::info!(status = ?a.network_status().await, "final status for node-a");

    a.shutdown();
    b.shutdown();
    c.shutdown();
}
