//! The public facade (§6): a `Clone`-able handle backed by one actor
//! task that owns every piece of mutable mesh state.
//!
//! Grounded in `freeq-sdk::client::ClientHandle`'s command-channel-plus-
//! event-subscription shape: the handle is cheap to clone and share, all
//! mutation happens inside the single task draining the command channel,
//! and the caller observes state changes only through
//! [`MeshEvent`]s — never through a callback or shared lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::event::MeshEvent;
use crate::outbound::{OutboundQueue, OutboundRequest};
use crate::peer::{ConnectedPeer, PeerConnector};
use crate::pool::Pool;
use crate::routing::RoutingEngine;
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::transport::Transport;
use crate::wire::{DataChannelFrame, MessageKind, NodeId};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 256;
const SIGNALING_EVENT_CAPACITY: usize = 256;
const INBOUND_FRAME_CAPACITY: usize = 256;
const INTERNAL_CHANNEL_CAPACITY: usize = 256;

/// Coarse network quality bucket derived every 5 s (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkQuality {
    Disconnected,
    Poor,
    Good,
    Excellent,
}

/// §6 `network_status()` — no field here should drift from the spec's
/// `{ connected, peer_count, local_id, quality, last_activity }` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
    pub peer_count: usize,
    pub local_id: NodeId,
    pub quality: NetworkQuality,
    /// Wall-clock milliseconds of the last inbound frame or outbound
    /// send, or `None` if there has been no traffic yet.
    pub last_activity: Option<u64>,
}

/// §6: "poor if no activity in 30 s".
const ACTIVITY_WINDOW_MS: u64 = 30_000;

impl NetworkStatus {
    /// §6 quality ladder, applied in order: `disconnected` if no peers;
    /// `poor` if no activity in 30 s; `excellent` if `peer_count >= 3`;
    /// `good` otherwise.
    fn derive(
        peer_count: usize,
        local_id: NodeId,
        last_activity: Option<u64>,
        now_millis: u64,
    ) -> Self {
        let quality = if peer_count == 0 {
            NetworkQuality::Disconnected
        } else if !last_activity.is_some_and(|t| now_millis.saturating_sub(t) < ACTIVITY_WINDOW_MS)
        {
            NetworkQuality::Poor
        } else if peer_count >= 3 {
            NetworkQuality::Excellent
        } else {
            NetworkQuality::Good
        };
        Self {
            connected: peer_count > 0,
            peer_count,
            local_id,
            quality,
            last_activity,
        }
    }
}

enum Command {
    Send {
        destination: NodeId,
        content: Vec<u8>,
        kind: MessageKind,
    },
    Broadcast {
        content: Vec<u8>,
        kind: MessageKind,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    NetworkStatus {
        reply: oneshot::Sender<NetworkStatus>,
    },
    Shutdown,
}

/// Results of background I/O the actor spawned off but must apply to
/// its own state — kept off the hot `tokio::select!` path so a slow
/// handshake never blocks command/frame processing.
enum Internal {
    OutboundConnect {
        peer: NodeId,
        transport: Transport,
        result: Result<ConnectedPeer, MeshError>,
    },
    InboundConnect {
        peer: NodeId,
        transport: Transport,
        result: Result<ConnectedPeer, MeshError>,
    },
}

/// A `Clone`-able handle to a running mesh instance. Every method sends
/// a command to the single owning actor task and is safe to call from
/// anywhere, concurrently (§5).
#[derive(Clone)]
pub struct Mesh {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<MeshEvent>,
    local_id: NodeId,
}

impl Mesh {
    /// Bring up signaling, the routing engine, and the connection pool,
    /// and spawn the actor task that owns them (§4.1, §6). Returns
    /// [`MeshError::SignalingUnavailable`] only if every signaling URL
    /// failed and no local-discovery fallback was configured — the one
    /// disposition in §7's table that surfaces synchronously.
    pub async fn initialize(config: MeshConfig) -> Result<Self, MeshError> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (signaling_tx, signaling_rx) = mpsc::channel(SIGNALING_EVENT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_FRAME_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);

        let signaling = Arc::new(SignalingClient::new(
            config.node_id.clone(),
            config.signaling_urls.clone(),
            config.signaling_connector.clone(),
            config.local_discovery.clone(),
            config.clock.clone(),
        ));
        signaling.clone().start(signaling_tx).await?;

        let connector = Arc::new(PeerConnector::new(
            config.transport_factory.clone(),
            signaling.clone(),
            config.clock.clone(),
        ));
        let pool = Pool::new(connector.clone(), config.max_connections, inbound_tx);
        let routing = RoutingEngine::new(
            config.node_id.clone(),
            config.dedup_capacity,
            config.route_ttl,
            config.rreq_validity,
            config.hop_limit,
        );
        let outbound = OutboundQueue::new(config.outbound_capacity);

        let actor = Actor {
            self_id: config.node_id.clone(),
            clock: config.clock.clone(),
            connector,
            pool,
            routing,
            outbound,
            connecting: HashSet::new(),
            pending_pings: std::collections::HashMap::new(),
            events: events_tx.clone(),
            last_activity: None,
            cached_status: NetworkStatus::derive(0, config.node_id.clone(), None, 0),
            maintenance_interval: config.maintenance_interval,
            idle_eviction_interval: config.idle_eviction_interval,
            health_check_interval: config.health_check_interval,
            quality_reassessment_interval: config.quality_reassessment_interval,
        };

        tokio::spawn(actor.run(commands_rx, signaling_rx, inbound_rx, internal_tx, internal_rx));

        info!(node_id = %config.node_id, "mesh initialized");
        Ok(Self {
            commands: commands_tx,
            events: events_tx,
            local_id: config.node_id,
        })
    }

    /// Unicast send (§4.6). Never blocks, never returns an error to the
    /// caller — a full command channel (the backpressure limit) simply
    /// drops the request, matching the "a send never blocks" rule (§5).
    pub fn send(&self, destination: impl Into<NodeId>, content: Vec<u8>, kind: MessageKind) {
        let cmd = Command::Send {
            destination: destination.into(),
            content,
            kind,
        };
        if self.commands.try_send(cmd).is_err() {
            warn!("command channel full, dropping send");
        }
    }

    /// Broadcast send (§4.6).
    pub fn broadcast(&self, content: Vec<u8>, kind: MessageKind) {
        let cmd = Command::Broadcast { content, kind };
        if self.commands.try_send(cmd).is_err() {
            warn!("command channel full, dropping broadcast");
        }
    }

    pub async fn connected_peers(&self) -> Vec<NodeId> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::ConnectedPeers { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn network_status(&self) -> NetworkStatus {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::NetworkStatus { reply })
            .await
            .is_err()
        {
            return NetworkStatus::derive(0, self.local_id.clone(), None, 0);
        }
        rx.await
            .unwrap_or_else(|_| NetworkStatus::derive(0, self.local_id.clone(), None, 0))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Idempotent: shutting down an already-shut-down mesh is a no-op.
    pub fn shutdown(&self) {
        let _ = self.commands.try_send(Command::Shutdown);
    }
}

struct Actor {
    self_id: NodeId,
    clock: crate::clock::SharedClock,
    connector: Arc<PeerConnector>,
    pool: Pool,
    routing: RoutingEngine,
    outbound: OutboundQueue,
    connecting: HashSet<(NodeId, Transport)>,
    pending_pings: std::collections::HashMap<(NodeId, Transport), Instant>,
    events: broadcast::Sender<MeshEvent>,
    /// Wall-clock ms of the last inbound frame or outbound send (§6
    /// "no activity in 30 s" quality rule).
    last_activity: Option<u64>,
    cached_status: NetworkStatus,
    maintenance_interval: Duration,
    idle_eviction_interval: Duration,
    health_check_interval: Duration,
    quality_reassessment_interval: Duration,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signaling_events: mpsc::Receiver<SignalingEvent>,
        mut inbound_frames: mpsc::Receiver<crate::pool::InboundFrame>,
        internal_tx: mpsc::Sender<Internal>,
        mut internal: mpsc::Receiver<Internal>,
    ) {
        let mut maintenance_tick = tokio::time::interval(self.maintenance_interval);
        let mut idle_tick = tokio::time::interval(self.idle_eviction_interval);
        let mut health_tick = tokio::time::interval(self.health_check_interval);
        let mut quality_tick = tokio::time::interval(self.quality_reassessment_interval);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        // every `Mesh` handle was dropped — nothing left to serve.
                        None => break,
                        Some(cmd) if self.handle_command(cmd).await => break,
                        Some(_) => {}
                    }
                }
                event = signaling_events.recv() => {
                    match event {
                        Some(event) => self.handle_signaling_event(event, internal_tx.clone()).await,
                        None => break,
                    }
                }
                frame = inbound_frames.recv() => {
                    match frame {
                        Some(frame) => self.handle_inbound_frame(frame).await,
                        None => break,
                    }
                }
                msg = internal.recv() => {
                    match msg {
                        Some(msg) => self.handle_internal(msg).await,
                        None => break,
                    }
                }
                _ = maintenance_tick.tick() => {
                    let now = self.clock.now();
                    for action in self.routing.run_maintenance(now) {
                        self.execute_action(action).await;
                    }
                }
                _ = idle_tick.tick() => {
                    let now = self.clock.now();
                    for outcome in self.pool.evict_idle(now) {
                        self.apply_pool_outcome(outcome);
                    }
                }
                _ = health_tick.tick() => {
                    self.run_health_check().await;
                }
                _ = quality_tick.tick() => {
                    self.refresh_cached_status();
                }
                else => break,
            }
        }
        info!(node_id = %self.self_id, "mesh actor shut down");
    }

    /// Returns `true` if the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        let now = self.clock.now();
        let now_millis = self.clock.now_millis();
        match cmd {
            Command::Send {
                destination,
                content,
                kind,
            } => {
                if self.pool.is_empty() {
                    self.outbound.push(OutboundRequest::Unicast {
                        destination,
                        content,
                        kind,
                    });
                    return false;
                }
                let actions = self.routing.send_unicast(&destination, content, kind, now, now_millis);
                for action in actions {
                    self.execute_action(action).await;
                }
            }
            Command::Broadcast { content, kind } => {
                if self.pool.is_empty() {
                    self.outbound.push(OutboundRequest::Broadcast { content, kind });
                    return false;
                }
                let actions = self.routing.send_broadcast(content, kind, now_millis);
                for action in actions {
                    self.execute_action(action).await;
                }
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.pool.connected_peers());
            }
            Command::NetworkStatus { reply } => {
                self.refresh_cached_status();
                let _ = reply.send(self.cached_status.clone());
            }
            Command::Shutdown => {
                info!(node_id = %self.self_id, "mesh shutdown requested");
                return true;
            }
        }
        false
    }

    async fn handle_signaling_event(
        &mut self,
        event: SignalingEvent,
        internal_tx: mpsc::Sender<Internal>,
    ) {
        match event {
            SignalingEvent::Joined => debug!("joined signaling server"),
            SignalingEvent::LocalDiscoveryActive => debug!("running on local discovery"),
            SignalingEvent::Disconnected => {
                debug!("signaling link dropped, reconnecting in background")
            }
            SignalingEvent::PeerList(peers) => {
                for peer in peers {
                    self.maybe_connect(peer, internal_tx.clone());
                }
            }
            SignalingEvent::PeerDiscovered(peer) => {
                self.maybe_connect(peer, internal_tx.clone());
            }
            SignalingEvent::Offer { from, offer } => {
                let key = (from.clone(), Transport::Direct);
                if self.connecting.contains(&key) || self.pool.is_connected(&from) {
                    return;
                }
                self.connecting.insert(key);
                let connector = self.connector.clone();
                tokio::spawn(async move {
                    let result = connector.handle_offer(&from, offer, Transport::Direct).await;
                    let _ = internal_tx
                        .send(Internal::InboundConnect {
                            peer: from,
                            transport: Transport::Direct,
                            result,
                        })
                        .await;
                });
            }
            SignalingEvent::Answer { from, answer } => {
                self.connector.handle_answer(&from, answer).await;
            }
            SignalingEvent::Candidate { from, candidate } => {
                let now = self.clock.now();
                self.connector.handle_candidate(&from, candidate, now).await;
            }
        }
    }

    fn maybe_connect(&mut self, peer: NodeId, internal_tx: mpsc::Sender<Internal>) {
        if peer == self.self_id {
            return;
        }
        let key = (peer.clone(), Transport::Direct);
        if self.connecting.contains(&key) || self.pool.is_connected(&peer) {
            return;
        }
        self.connecting.insert(key);
        let connector = self.connector.clone();
        let now = self.clock.now();
        tokio::spawn(async move {
            let result = connector.connect_outbound(&peer, Transport::Direct, now).await;
            let _ = internal_tx
                .send(Internal::OutboundConnect {
                    peer,
                    transport: Transport::Direct,
                    result,
                })
                .await;
        });
    }

    async fn handle_internal(&mut self, msg: Internal) {
        let now = self.clock.now();
        let (peer, transport, result) = match msg {
            Internal::OutboundConnect {
                peer,
                transport,
                result,
            } => (peer, transport, result),
            Internal::InboundConnect {
                peer,
                transport,
                result,
            } => (peer, transport, result),
        };
        self.connecting.remove(&(peer.clone(), transport));

        match result {
            Ok(connected) => {
                let was_empty = self.pool.is_empty();
                self.pool.install(peer.clone(), connected, now);
                self.routing.on_peer_connected(&peer);
                let _ = self.events.send(MeshEvent::PeerConnected {
                    peer: peer.clone(),
                    transport,
                });
                if was_empty {
                    self.drain_outbound().await;
                }
            }
            Err(e) => {
                warn!(peer = %peer, transport = %transport, "connection attempt failed: {e}");
                let _ = self.events.send(MeshEvent::ConnectionFailed {
                    peer,
                    transport,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn drain_outbound(&mut self) {
        let now = self.clock.now();
        let now_millis = self.clock.now_millis();
        for request in self.outbound.drain() {
            let actions = match request {
                OutboundRequest::Unicast {
                    destination,
                    content,
                    kind,
                } => self
                    .routing
                    .send_unicast(&destination, content, kind, now, now_millis),
                OutboundRequest::Broadcast { content, kind } => {
                    self.routing.send_broadcast(content, kind, now_millis)
                }
            };
            for action in actions {
                self.execute_action(action).await;
            }
        }
    }

    async fn handle_inbound_frame(&mut self, frame: crate::pool::InboundFrame) {
        let now = self.clock.now();
        self.last_activity = Some(self.clock.now_millis());
        self.pool.record_received(&frame.peer, frame.transport, now);

        let decoded: DataChannelFrame = match serde_json::from_slice(&frame.bytes) {
            Ok(f) => f,
            Err(e) => {
                debug!(peer = %frame.peer, "dropping unparseable frame: {e}");
                return;
            }
        };

        match decoded {
            DataChannelFrame::Ping => {
                self.send_frame_to(&frame.peer, frame.transport, &DataChannelFrame::Pong)
                    .await;
            }
            DataChannelFrame::Pong => {
                if let Some(sent_at) = self.pending_pings.remove(&(frame.peer.clone(), frame.transport)) {
                    let latency_ms = now.saturating_duration_since(sent_at).as_millis() as u32;
                    self.pool.record_latency(&frame.peer, frame.transport, latency_ms);
                }
            }
            DataChannelFrame::Message(msg) => {
                let now_millis = self.clock.now_millis();
                let actions = self
                    .routing
                    .handle_inbound_message(msg, &frame.peer, now, now_millis);
                for action in actions {
                    self.execute_action(action).await;
                }
            }
            DataChannelFrame::RouteRequest(rreq) => {
                let now_millis = self.clock.now_millis();
                let actions = self
                    .routing
                    .handle_route_request(rreq, &frame.peer, now, now_millis);
                for action in actions {
                    self.execute_action(action).await;
                }
            }
            DataChannelFrame::RouteReply(rrep) => {
                let actions = self.routing.handle_route_reply(rrep, &frame.peer, now);
                for action in actions {
                    self.execute_action(action).await;
                }
            }
        }
    }

    async fn execute_action(&mut self, action: crate::routing::Action) {
        use crate::routing::Action;
        match action {
            Action::SendTo { peer, frame } => {
                if let Some(transport) = self.pool.best_transport(&peer) {
                    self.send_frame_to(&peer, transport, &frame).await;
                } else {
                    debug!(peer = %peer, "no open connection to forward to");
                }
            }
            Action::BroadcastExcept { except, frame } => {
                let targets: Vec<(NodeId, Transport)> = self
                    .pool
                    .open_connections()
                    .filter(|(peer, _)| Some(*peer) != except.as_ref())
                    .map(|(peer, transport)| (peer.clone(), transport))
                    .collect();
                for (peer, transport) in targets {
                    self.send_frame_to(&peer, transport, &frame).await;
                }
            }
            // The corresponding `MeshEvent::MessageReceived` (always
            // emitted alongside this action) is the actual delivery
            // path subscribers observe; nothing further to do here.
            Action::DeliverLocal(_) => {}
            Action::Emit(event) => {
                let _ = self.events.send(event);
            }
        }
    }

    async fn send_frame_to(&mut self, peer: &NodeId, transport: Transport, frame: &DataChannelFrame) {
        let Some(driver) = self.pool.driver_for(peer, transport) else {
            return;
        };
        let bytes = match serde_json::to_vec(frame) {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to serialize outbound frame: {e}");
                return;
            }
        };
        if let Err(e) = driver.send(&bytes).await {
            warn!(peer = %peer, "send failed: {e}");
            return;
        }
        let now = self.clock.now();
        self.pool.record_sent(peer, transport, now);
        self.last_activity = Some(self.clock.now_millis());
    }

    async fn run_health_check(&mut self) {
        let now = self.clock.now();

        let targets: Vec<(NodeId, Transport)> = self
            .pool
            .open_connections()
            .map(|(peer, transport)| (peer.clone(), transport))
            .collect();
        for (peer, transport) in &targets {
            self.pending_pings.insert((peer.clone(), *transport), now);
            self.send_frame_to(peer, *transport, &DataChannelFrame::Ping).await;
        }

        for outcome in self.pool.health_check(now) {
            self.apply_pool_outcome(outcome);
        }
    }

    fn apply_pool_outcome(&mut self, outcome: crate::pool::PoolOutcome) {
        use crate::pool::PoolOutcome;
        match outcome {
            PoolOutcome::Disconnected { peer, transport } => {
                if !self.pool.is_connected(&peer) {
                    let now = self.clock.now();
                    for action in self.routing.on_peer_lost(&peer, now) {
                        // these are all `Action::Emit(RouteRemoved)`, no I/O needed.
                        if let crate::routing::Action::Emit(event) = action {
                            let _ = self.events.send(event);
                        }
                    }
                }
                self.pending_pings.remove(&(peer.clone(), transport));
                let _ = self.events.send(MeshEvent::PeerDisconnected { peer: peer.clone() });
            }
            PoolOutcome::Connected { .. } | PoolOutcome::ConnectFailed { .. } => {}
        }
    }

    fn refresh_cached_status(&mut self) {
        let peers = self.pool.connected_peers().len();
        let now_millis = self.clock.now_millis();
        self.cached_status = NetworkStatus::derive(
            peers,
            self.self_id.clone(),
            self.last_activity,
            now_millis,
        );
    }
}
