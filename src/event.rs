//! Events the mesh core emits to whatever application sits above it.
//!
//! A small enumerated type delivered through a bounded channel, the way
//! `freeq-sdk::event::Event` replaces a dynamic event-emitter for the
//! IRC client — generalized here per SPEC_FULL §9's design note mapping
//! the source's variadic-listener event emitter onto a closed Rust enum.

use crate::transport::Transport;
use crate::wire::{MeshMessage, NodeId};

#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerConnected {
        peer: NodeId,
        transport: Transport,
    },
    PeerDisconnected {
        peer: NodeId,
    },
    MessageReceived {
        message: MeshMessage,
        from: NodeId,
    },
    RouteUpdated {
        destination: NodeId,
        next_hop: NodeId,
        hop_count: u32,
    },
    RouteRemoved {
        destination: NodeId,
    },
    ConnectionFailed {
        peer: NodeId,
        transport: Transport,
        error: String,
    },
}
