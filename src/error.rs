//! Typed error model (§7).
//!
//! Only [`Mesh::initialize`](crate::facade::Mesh::initialize) returns one
//! of these to its caller. Every other disposition in §7's table is
//! handled internally — dropped, logged, enqueued, or turned into a
//! [`crate::event::MeshEvent`] — and never surfaces as an `Err` from
//! `send`/`broadcast`.

use crate::wire::NodeId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MeshError {
    /// All configured signaling URLs failed and local discovery also
    /// refused to start. Fatal to `initialize`.
    #[error("no signaling endpoint reachable and local discovery unavailable")]
    SignalingUnavailable,

    /// The transport driver could not establish a connection to a peer.
    #[error("transport open failed for peer {peer}: {reason}")]
    TransportOpenFailed { peer: NodeId, reason: String },

    /// Malformed JSON or a missing required field on an inbound frame.
    #[error("invalid frame from {from}: {reason}")]
    InvalidFrame { from: NodeId, reason: String },

    /// Unicast send with no route and discovery already in flight.
    #[error("no route to {destination}")]
    NoRoute { destination: NodeId },

    /// `hop_count >= 10` on an inbound or to-be-forwarded frame.
    #[error("hop limit exceeded")]
    HopLimitExceeded,

    /// The frame's dedup key was already seen.
    #[error("duplicate frame")]
    DuplicateFrame,

    /// A peer's data channel closed or its transport driver failed.
    #[error("peer lost: {peer}")]
    PeerLost { peer: NodeId },
}
