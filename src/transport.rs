//! Transport driver interface.
//!
//! The core never speaks to a concrete transport — direct peer-to-peer
//! data channel, signalling-server fallback relay, or short-range radio.
//! It drives an opaque [`TransportDriver`] handle through the
//! offer/answer/candidate dance and then through open/send/close, and
//! reads inbound application frames from a channel the driver was
//! constructed with. This mirrors how `iroh.rs` wraps a QUIC connection
//! behind the same `AsyncRead + AsyncWrite` shape the generic IRC
//! handler expects — generalized here to an explicit trait object so any
//! embedder (a real WebRTC data channel, a signalling relay, a LoRa
//! radio) can plug in. SDP/ICE content itself stays opaque `Vec<u8>`
//! blobs relayed by [`crate::signaling::SignalingClient`]; this crate
//! never parses them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MeshError;
use crate::wire::NodeId;

/// Which physical medium a [`crate::pool::Pool`] connection rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Direct peer-to-peer data channel (e.g. WebRTC).
    Direct,
    /// Routed through the signalling server as a fallback relay.
    Relay,
    /// Short-range radio (e.g. BLE, LoRa).
    ShortRange,
}

impl Transport {
    /// Battery-impact proxy used by pool metrics (§4.5).
    pub fn battery_impact(self) -> f64 {
        match self {
            Transport::ShortRange => 0.3,
            Transport::Direct => 0.2,
            Transport::Relay => 0.1,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Transport::Direct => "direct",
            Transport::Relay => "relay",
            Transport::ShortRange => "short-range",
        };
        f.write_str(s)
    }
}

/// A handle to one peer connection's driver-managed channel, from the
/// moment it is created (possibly before the remote description is
/// applied) through teardown.
///
/// The offer/answer/candidate methods carry opaque blobs — this crate
/// relays them via signaling but never inspects their contents, per the
/// NAT-traversal-is-a-driver-concern non-goal.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Generate a local offer to send to the remote peer.
    async fn create_offer(&self) -> Result<Vec<u8>, MeshError>;

    /// Accept a remote offer and generate an answer to send back.
    async fn create_answer(&self, remote_offer: &[u8]) -> Result<Vec<u8>, MeshError>;

    /// Apply a remote answer to a driver we created an offer on.
    async fn apply_remote_answer(&self, answer: &[u8]) -> Result<(), MeshError>;

    /// Apply a remote ICE (or equivalent) candidate. Callers buffer
    /// candidates that arrive before the remote description exists;
    /// the driver only ever sees candidates it can apply immediately.
    async fn add_remote_candidate(&self, candidate: &[u8]) -> Result<(), MeshError>;

    /// Send one opaque application frame (a serialized
    /// [`crate::wire::DataChannelFrame`]) once the data channel is open.
    async fn send(&self, frame: &[u8]) -> Result<(), MeshError>;

    /// Is the data channel currently open for application traffic?
    fn is_data_channel_open(&self) -> bool;

    /// Current round-trip latency estimate, if known.
    fn latency_ms(&self) -> Option<u32>;

    /// Close the connection. Best-effort; never panics.
    async fn close(&self);
}

/// Constructs driver-managed channels for a given peer/transport pair.
///
/// This is the seam an embedder plugs a real WebRTC/relay/radio stack
/// into. `create` returns a not-yet-connected driver plus the channel
/// the driver will push inbound application frame bytes into once the
/// data channel opens.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer: &NodeId,
        transport: Transport,
    ) -> Result<(Arc<dyn TransportDriver>, mpsc::Receiver<Vec<u8>>), MeshError>;
}
