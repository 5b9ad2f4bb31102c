//! Reactive mesh routing engine — the protocol at the heart of the
//! system (§4.3).
//!
//! The engine never touches a transport directly. It takes inbound
//! frames (tagged with the peer they arrived from, so nothing needs a
//! hidden thread-local to know where a message came from) and returns a
//! list of
//! [`Action`]s for the caller (the mesh actor, see [`crate::facade`])
//! to carry out — send a frame to one peer, broadcast to all peers
//! except one, deliver a message locally, or emit a [`MeshEvent`].
//! Grounded in `s2s.rs`'s "origin tracking prevents loops" forwarding
//! discipline and `connection/routing.rs`'s local-then-relay ordering,
//! generalized from IRC nick routing to AODV destination routing.

pub mod table;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::dedup::DuplicateCache;
use crate::event::MeshEvent;
use crate::wire::{
    DataChannelFrame, MeshMessage, MessageKind, NodeId, RouteReply, RouteRequest, BROADCAST,
};
use table::{RouteTable, UpdateOutcome};

/// A queued unicast awaiting route discovery, plus when the discovery
/// started (for the 30 s RREQ-expiry purge, §4.3 periodic maintenance).
struct PendingDiscovery {
    issued_at: Instant,
    messages: Vec<MeshMessage>,
}

/// One thing the caller must now do as a result of feeding a frame or
/// command into the engine.
#[derive(Debug, Clone)]
pub enum Action {
    SendTo {
        peer: NodeId,
        frame: DataChannelFrame,
    },
    /// Broadcast to every currently-connected peer except `except`
    /// (split-horizon, when `except` is `Some`).
    BroadcastExcept {
        except: Option<NodeId>,
        frame: DataChannelFrame,
    },
    DeliverLocal(MeshMessage),
    Emit(MeshEvent),
}

pub struct RoutingEngine {
    self_id: NodeId,
    table: RouteTable,
    dedup: DuplicateCache,
    connected: HashSet<NodeId>,
    pending: HashMap<NodeId, PendingDiscovery>,
    next_seq: u64,
    rreq_validity: Duration,
    hop_limit: u32,
}

impl RoutingEngine {
    pub fn new(
        self_id: NodeId,
        dedup_capacity: usize,
        route_ttl: Duration,
        rreq_validity: Duration,
        hop_limit: u32,
    ) -> Self {
        Self {
            self_id,
            table: RouteTable::new(route_ttl),
            dedup: DuplicateCache::new(dedup_capacity),
            connected: HashSet::new(),
            pending: HashMap::new(),
            next_seq: 0,
            rreq_validity,
            hop_limit,
        }
    }

    fn next_sequence_number(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn generate_control_id(&mut self, now_millis: u64) -> String {
        let seq = self.next_sequence_number();
        format!("{}-{}-{}", self.self_id, seq, now_millis)
    }

    pub fn route_to(&self, destination: &str) -> Option<&table::RouteEntry> {
        self.table.get(destination)
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &NodeId> {
        self.connected.iter()
    }

    // ── peer lifecycle ──────────────────────────────────────────

    pub fn on_peer_connected(&mut self, peer: &NodeId) {
        self.connected.insert(peer.clone());
    }

    /// Peer-loss handling (§4.3): drop every route whose `next_hop` is
    /// this peer and emit `RouteRemoved` per affected destination. No
    /// proactive error upstream — subsequent sends trigger fresh
    /// discoveries.
    pub fn on_peer_lost(&mut self, peer: &NodeId, _now: Instant) -> Vec<Action> {
        self.connected.remove(peer);
        self.table
            .remove_routes_via(peer)
            .into_iter()
            .map(|destination| Action::Emit(MeshEvent::RouteRemoved { destination }))
            .collect()
    }

    // ── application-facing sends ────────────────────────────────

    /// `send(content, destination, kind)` when `destination != broadcast`
    /// (§4.6, §4.3 unicast forwarding step 4). Never blocks, never
    /// errors to the caller (§5 backpressure).
    pub fn send_unicast(
        &mut self,
        destination: &str,
        content: Vec<u8>,
        kind: MessageKind,
        now: Instant,
        now_millis: u64,
    ) -> Vec<Action> {
        let seq = self.next_sequence_number();
        let msg = MeshMessage {
            id: format!("{}-{}-{}", self.self_id, seq, now_millis),
            sender: self.self_id.clone(),
            destination: destination.to_string(),
            content,
            kind,
            timestamp: now_millis,
            hop_count: 0,
            sequence_number: seq,
        };
        // Our own application message is its own dedup origin; record it
        // so a copy that loops back to us is dropped as a duplicate.
        self.dedup.check_and_insert(&msg.dedup_key());
        self.route_or_discover(msg, now, now_millis)
    }

    /// `broadcast(content, kind)` (§4.6). The originator's own message.
    pub fn send_broadcast(
        &mut self,
        content: Vec<u8>,
        kind: MessageKind,
        now_millis: u64,
    ) -> Vec<Action> {
        let seq = self.next_sequence_number();
        let msg = MeshMessage {
            id: format!("{}-{}-{}", self.self_id, seq, now_millis),
            sender: self.self_id.clone(),
            destination: BROADCAST.to_string(),
            content,
            kind,
            timestamp: now_millis,
            hop_count: 0,
            sequence_number: seq,
        };
        self.dedup.check_and_insert(&msg.dedup_key());
        vec![Action::BroadcastExcept {
            except: None,
            frame: DataChannelFrame::Message(msg),
        }]
    }

    /// Shared by unicast application sends and the forward-path route
    /// miss (§4.3 step 4): if a route exists, forward; otherwise queue
    /// behind route discovery, issuing a fresh RREQ only if one isn't
    /// already in flight for this destination.
    fn route_or_discover(
        &mut self,
        msg: MeshMessage,
        now: Instant,
        now_millis: u64,
    ) -> Vec<Action> {
        if let Some(route) = self.table.get(&msg.destination) {
            let next_hop = route.next_hop.clone();
            return vec![Action::SendTo {
                peer: next_hop,
                frame: DataChannelFrame::Message(msg.forwarded()),
            }];
        }

        let destination = msg.destination.clone();
        let already_in_flight = self.pending.contains_key(&destination);
        self.pending
            .entry(destination.clone())
            .or_insert_with(|| PendingDiscovery {
                issued_at: now,
                messages: Vec::new(),
            })
            .messages
            .push(msg);

        if already_in_flight {
            return Vec::new();
        }

        let seq = self.next_sequence_number();
        let rreq = RouteRequest {
            id: format!("{}-{}-{}", self.self_id, seq, now_millis),
            source: self.self_id.clone(),
            destination,
            hop_count: 0,
            sequence_number: seq,
            timestamp: now_millis,
        };
        vec![Action::BroadcastExcept {
            except: None,
            frame: DataChannelFrame::RouteRequest(rreq),
        }]
    }

    // ── inbound application messages ────────────────────────────

    /// Unicast/broadcast forwarding decision for an inbound application
    /// message (§4.3 unicast forwarding).
    pub fn handle_inbound_message(
        &mut self,
        msg: MeshMessage,
        from_peer: &str,
        now: Instant,
        now_millis: u64,
    ) -> Vec<Action> {
        if msg.hop_count >= self.hop_limit {
            debug!(id = %msg.id, "dropping message: hop limit exceeded");
            return Vec::new();
        }

        if !self.dedup.check_and_insert(&msg.dedup_key()) {
            debug!(id = %msg.id, "dropping message: duplicate");
            return Vec::new();
        }

        if msg.destination == self.self_id {
            let event = MeshEvent::MessageReceived {
                message: msg.clone(),
                from: from_peer.to_string(),
            };
            return vec![Action::DeliverLocal(msg), Action::Emit(event)];
        }

        if msg.is_broadcast() {
            let event = MeshEvent::MessageReceived {
                message: msg.clone(),
                from: from_peer.to_string(),
            };
            return vec![
                Action::DeliverLocal(msg.clone()),
                Action::Emit(event),
                Action::BroadcastExcept {
                    except: Some(from_peer.to_string()),
                    frame: DataChannelFrame::Message(msg.forwarded()),
                },
            ];
        }

        self.route_or_discover(msg, now, now_millis)
    }

    // ── RREQ / RREP handling ─────────────────────────────────────

    /// §4.3 "RREQ handling", steps 1–5.
    pub fn handle_route_request(
        &mut self,
        rreq: RouteRequest,
        from_peer: &str,
        now: Instant,
        now_millis: u64,
    ) -> Vec<Action> {
        if rreq.hop_count >= self.hop_limit {
            debug!(id = %rreq.id, "dropping RREQ: hop limit exceeded");
            return Vec::new();
        }

        if !self.dedup.check_and_insert(&rreq.id) {
            debug!(id = %rreq.id, "dropping RREQ: duplicate");
            return Vec::new();
        }

        let mut actions = Vec::new();

        let outcome = self.table.offer(
            &rreq.source,
            from_peer,
            rreq.sequence_number,
            rreq.hop_count + 1,
            now,
        );
        if outcome == UpdateOutcome::Installed {
            actions.push(Action::Emit(MeshEvent::RouteUpdated {
                destination: rreq.source.clone(),
                next_hop: from_peer.to_string(),
                hop_count: rreq.hop_count + 1,
            }));
        }

        if rreq.destination == self.self_id {
            let seq = self.next_sequence_number();
            let rrep = RouteReply {
                id: format!("{}-{}-{}", self.self_id, seq, now_millis),
                source: rreq.source,
                destination: self.self_id.clone(),
                hop_count: 0,
                sequence_number: seq,
                timestamp: now_millis,
            };
            actions.push(Action::SendTo {
                peer: from_peer.to_string(),
                frame: DataChannelFrame::RouteReply(rrep),
            });
            return actions;
        }

        let still_fresh = now_millis.saturating_sub(rreq.timestamp) < self.rreq_validity.as_millis() as u64;
        if still_fresh && rreq.hop_count < self.hop_limit {
            actions.push(Action::BroadcastExcept {
                except: Some(from_peer.to_string()),
                frame: DataChannelFrame::RouteRequest(rreq.forwarded()),
            });
        }

        actions
    }

    /// §4.3 "RREP handling".
    pub fn handle_route_reply(
        &mut self,
        rrep: RouteReply,
        from_peer: &str,
        now: Instant,
    ) -> Vec<Action> {
        if rrep.hop_count >= self.hop_limit {
            debug!(id = %rrep.id, "dropping RREP: hop limit exceeded");
            return Vec::new();
        }

        let mut actions = Vec::new();

        let outcome = self.table.offer(
            &rrep.destination,
            from_peer,
            rrep.sequence_number,
            rrep.hop_count + 1,
            now,
        );
        if outcome == UpdateOutcome::Installed {
            actions.push(Action::Emit(MeshEvent::RouteUpdated {
                destination: rrep.destination.clone(),
                next_hop: from_peer.to_string(),
                hop_count: rrep.hop_count + 1,
            }));
        }

        if self.self_id == rrep.source {
            // Route established — release anything queued behind this
            // discovery.
            if let Some(pending) = self.pending.remove(&rrep.destination) {
                for msg in pending.messages {
                    if let Some(route) = self.table.get(&msg.destination) {
                        actions.push(Action::SendTo {
                            peer: route.next_hop.clone(),
                            frame: DataChannelFrame::Message(msg.forwarded()),
                        });
                    }
                }
            }
            return actions;
        }

        if let Some(reverse) = self.table.get(&rrep.source) {
            actions.push(Action::SendTo {
                peer: reverse.next_hop.clone(),
                frame: DataChannelFrame::RouteReply(rrep.forwarded()),
            });
        }

        actions
    }

    // ── periodic maintenance (§4.3, every 60 s) ─────────────────

    pub fn run_maintenance(&mut self, now: Instant) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .table
            .evict_expired(now)
            .into_iter()
            .map(|destination| Action::Emit(MeshEvent::RouteRemoved { destination }))
            .collect();

        self.dedup.trim_to_eighty_percent();

        self.pending
            .retain(|_, pending| now.saturating_duration_since(pending.issued_at) < self.rreq_validity);

        actions
    }

    /// Test/debug helper: any route whose `next_hop` isn't currently
    /// connected is a bug.
    pub fn locality_violations(&self) -> Vec<NodeId> {
        self.table
            .violates_locality(&self.connected)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn route_table(&self) -> &RouteTable {
        &self.table
    }
}
