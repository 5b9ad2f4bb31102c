//! Bounded connection pool (§4.5).
//!
//! Owns every live [`PeerConnection`], enforces `max_connections` via LRU
//! eviction, and runs the periodic idle-eviction and health-check passes.
//! Grounded in `freeq-server::server::SharedState`'s single-writer map of
//! live sessions, with the health-scoring and transport-preference rules
//! added per this spec's §4.5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::peer::{ConnectedPeer, PeerConnection, PeerConnector, PeerStatus};
use crate::transport::Transport;
use crate::wire::NodeId;

pub const DEFAULT_MAX_CONNECTIONS: usize = 20;
const IDLE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// §4.5 health check: a ping that goes unanswered forces closure below
/// this reliability floor.
const PING_FAILURE_CLOSURE_FLOOR: u8 = 50;
/// §4.5 health check: a driver-level exception (data channel reporting
/// closed under us) forces closure below this lower floor.
const DRIVER_EXCEPTION_CLOSURE_FLOOR: u8 = 30;

/// One raw application frame read off a connection's driver channel,
/// tagged with where it came from so the actor loop can hand it to the
/// routing engine.
#[derive(Debug)]
pub struct InboundFrame {
    pub peer: NodeId,
    pub transport: Transport,
    pub bytes: Vec<u8>,
}

/// Something the pool did that the caller (the facade actor) needs to
/// turn into a [`crate::event::MeshEvent`] or routing-engine call.
#[derive(Debug, Clone)]
pub enum PoolOutcome {
    Connected { peer: NodeId, transport: Transport },
    Disconnected { peer: NodeId, transport: Transport },
    ConnectFailed {
        peer: NodeId,
        transport: Transport,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolMetrics {
    pub active: usize,
    pub idle: usize,
    pub avg_latency_ms: Option<u32>,
    pub total_sent: u64,
    pub total_received: u64,
    pub battery_impact_estimate: f64,
}

/// Bounded map of live peer connections plus the machinery to grow,
/// shrink, and score it.
pub struct Pool {
    max_connections: usize,
    connector: Arc<PeerConnector>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    connections: HashMap<(NodeId, Transport), PeerConnection>,
}

impl Pool {
    pub fn new(
        connector: Arc<PeerConnector>,
        max_connections: usize,
        inbound_tx: mpsc::Sender<InboundFrame>,
    ) -> Self {
        Self {
            max_connections,
            connector,
            inbound_tx,
            connections: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, peer: &NodeId, transport: Transport) -> Option<&PeerConnection> {
        self.connections.get(&(peer.clone(), transport))
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.connections
            .values()
            .any(|c| &c.peer_id == peer && c.data_channel_open)
    }

    /// All peers with at least one open connection.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .connections
            .values()
            .filter(|c| c.data_channel_open)
            .map(|c| c.peer_id.clone())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// The best-scoring open connection to `peer`, if any (§4.5
    /// transport preference).
    pub fn best_transport(&self, peer: &NodeId) -> Option<Transport> {
        self.connections
            .values()
            .filter(|c| &c.peer_id == peer && c.data_channel_open)
            .max_by(|a, b| {
                a.preference_score()
                    .partial_cmp(&b.preference_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|c| c.transport)
    }

    /// Ensure a connection to `(peer, transport)` exists, dialing out
    /// and evicting the least-recently-used entry first if the pool is
    /// at capacity. Returns `Connected` on success (new or already
    /// present) or `ConnectFailed` otherwise.
    pub async fn acquire(
        &mut self,
        peer: &NodeId,
        transport: Transport,
        now: Instant,
    ) -> PoolOutcome {
        let key = (peer.clone(), transport);
        if let Some(existing) = self.connections.get_mut(&key) {
            existing.last_used = now;
            return PoolOutcome::Connected {
                peer: peer.clone(),
                transport,
            };
        }

        if self.connections.len() >= self.max_connections {
            self.evict_least_recently_used();
        }

        match self.connector.connect_outbound(peer, transport, now).await {
            Ok(connected) => {
                self.install(peer.clone(), connected, now);
                PoolOutcome::Connected {
                    peer: peer.clone(),
                    transport,
                }
            }
            Err(e) => PoolOutcome::ConnectFailed {
                peer: peer.clone(),
                transport,
                reason: e.to_string(),
            },
        }
    }

    /// Register a connection whose handshake already completed (either
    /// `acquire`'s outbound path or a remote-initiated offer the
    /// peer-connection manager answered) and spawn the task that pumps
    /// its inbound frames into `inbound_tx`.
    pub fn install(&mut self, peer: NodeId, connected: ConnectedPeer, now: Instant) {
        let transport = connected.transport;
        let conn = PeerConnection {
            peer_id: peer.clone(),
            transport,
            driver: connected.driver,
            status: PeerStatus::Connected,
            data_channel_open: true,
            last_used: now,
            created_at: now,
            latency_ms: None,
            reliability: 100,
            sent: 0,
            received: 0,
        };
        self.connections.insert((peer.clone(), transport), conn);

        let mut rx = connected.rx;
        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if tx
                    .send(InboundFrame {
                        peer: peer.clone(),
                        transport,
                        bytes,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    fn evict_least_recently_used(&mut self) {
        if let Some(key) = self
            .connections
            .iter()
            .min_by_key(|(_, c)| c.last_used)
            .map(|(k, _)| k.clone())
        {
            info!(peer = %key.0, transport = %key.1, "evicting least-recently-used connection at capacity");
            if let Some(conn) = self.connections.remove(&key) {
                let driver = conn.driver;
                tokio::spawn(async move { driver.close().await });
            }
        }
    }

    pub fn record_sent(&mut self, peer: &NodeId, transport: Transport, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&(peer.clone(), transport)) {
            conn.sent += 1;
            conn.last_used = now;
        }
    }

    pub fn record_received(&mut self, peer: &NodeId, transport: Transport, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&(peer.clone(), transport)) {
            conn.received += 1;
            conn.last_used = now;
        }
    }

    /// Record a round-trip latency sample from an application-level
    /// ping/pong exchange (§4.2).
    pub fn record_latency(&mut self, peer: &NodeId, transport: Transport, latency_ms: u32) {
        if let Some(conn) = self.connections.get_mut(&(peer.clone(), transport)) {
            conn.latency_ms = Some(latency_ms);
        }
    }

    /// Every currently open connection, for sends that don't need the
    /// preference ranking (e.g. a liveness ping to every peer).
    pub fn open_connections(&self) -> impl Iterator<Item = (&NodeId, Transport)> {
        self.connections
            .values()
            .filter(|c| c.data_channel_open)
            .map(|c| (&c.peer_id, c.transport))
    }

    pub fn driver_for(&self, peer: &NodeId, transport: Transport) -> Option<Arc<dyn crate::transport::TransportDriver>> {
        self.connections
            .get(&(peer.clone(), transport))
            .map(|c| c.driver.clone())
    }

    /// Remove every connection to `peer` (e.g. after a fatal transport
    /// error) and return the outcomes for event emission.
    pub fn drop_peer(&mut self, peer: &NodeId) -> Vec<PoolOutcome> {
        let keys: Vec<(NodeId, Transport)> = self
            .connections
            .keys()
            .filter(|(p, _)| p == peer)
            .cloned()
            .collect();
        let mut outcomes = Vec::new();
        for key in keys {
            if let Some(conn) = self.connections.remove(&key) {
                let driver = conn.driver;
                tokio::spawn(async move { driver.close().await });
                outcomes.push(PoolOutcome::Disconnected {
                    peer: key.0,
                    transport: key.1,
                });
            }
        }
        outcomes
    }

    /// Close every connection idle past the 5-minute threshold (§4.5
    /// periodic maintenance, every 30s).
    pub fn evict_idle(&mut self, now: Instant) -> Vec<PoolOutcome> {
        let doomed: Vec<(NodeId, Transport)> = self
            .connections
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_used) >= IDLE_THRESHOLD)
            .map(|(k, _)| k.clone())
            .collect();
        let mut outcomes = Vec::new();
        for key in doomed {
            if let Some(conn) = self.connections.remove(&key) {
                let driver = conn.driver;
                tokio::spawn(async move { driver.close().await });
                outcomes.push(PoolOutcome::Disconnected {
                    peer: key.0.clone(),
                    transport: key.1,
                });
            }
        }
        outcomes
    }

    /// Sample driver health and adjust reliability scores (§4.5, every
    /// 60s): `+1` on a healthy measured ping, `-10` when the data
    /// channel is open but latency is unmeasurable (a missed ping),
    /// `-15` when the data channel has closed under us. Any connection
    /// whose reliability drops below 30 is force-closed.
    pub fn health_check(&mut self, now: Instant) -> Vec<PoolOutcome> {
        let _ = now;
        let mut doomed = Vec::new();
        for (key, conn) in self.connections.iter_mut() {
            if !conn.driver.is_data_channel_open() {
                conn.data_channel_open = false;
                conn.reliability = conn.reliability.saturating_sub(15);
                if conn.reliability < DRIVER_EXCEPTION_CLOSURE_FLOOR {
                    doomed.push(key.clone());
                }
                continue;
            }
            match conn.driver.latency_ms() {
                Some(latency) => {
                    conn.latency_ms = Some(latency);
                    conn.reliability = conn.reliability.saturating_add(1).min(100);
                }
                None => {
                    conn.reliability = conn.reliability.saturating_sub(10);
                    if conn.reliability < PING_FAILURE_CLOSURE_FLOOR {
                        doomed.push(key.clone());
                    }
                }
            }
        }

        let mut outcomes = Vec::new();
        for key in doomed {
            if let Some(conn) = self.connections.remove(&key) {
                warn!(peer = %key.0, transport = %key.1, reliability = conn.reliability, "force-closing unhealthy connection");
                let driver = conn.driver;
                tokio::spawn(async move { driver.close().await });
                outcomes.push(PoolOutcome::Disconnected {
                    peer: key.0.clone(),
                    transport: key.1,
                });
            }
        }
        outcomes
    }

    /// Connections quieter than this are counted as idle in
    /// [`PoolMetrics`], well before they become eligible for
    /// [`Self::evict_idle`].
    const METRICS_IDLE_THRESHOLD: Duration = Duration::from_secs(60);

    pub fn metrics(&self, now: Instant) -> PoolMetrics {
        let is_idle = |c: &PeerConnection| {
            now.saturating_duration_since(c.last_used) >= Self::METRICS_IDLE_THRESHOLD
        };
        let active = self.connections.values().filter(|c| !is_idle(c)).count();
        let idle = self.connections.values().filter(|c| is_idle(c)).count();
        let latencies: Vec<u32> = self.connections.values().filter_map(|c| c.latency_ms).collect();
        let avg_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some((latencies.iter().map(|&l| l as u64).sum::<u64>() / latencies.len() as u64) as u32)
        };
        let total_sent = self.connections.values().map(|c| c.sent).sum();
        let total_received = self.connections.values().map(|c| c.received).sum();
        let battery_impact_estimate = self
            .connections
            .values()
            .map(|c| c.transport.battery_impact())
            .sum();
        PoolMetrics {
            active,
            idle,
            avg_latency_ms,
            total_sent,
            total_received,
            battery_impact_estimate,
        }
    }
}
