//! Wire types: message/route-control envelopes and identifiers.
//!
//! Everything here is `serde`-derived and travels verbatim as JSON on a
//! peer's data channel, the same way `S2sMessage` travels as
//! newline-delimited JSON over an S2S link.

use serde::{Deserialize, Serialize};

/// Reserved destination meaning "every connected peer".
pub const BROADCAST: &str = "broadcast";

/// Hard hop cap shared by messages and route-control frames (§3, §4.3).
pub const HOP_LIMIT: u32 = 10;

/// RREQ validity window, in milliseconds (§4.3).
pub const RREQ_VALIDITY_MS: u64 = 30_000;

/// An opaque, stable, globally-unique (with overwhelming probability)
/// node identifier. `NodeId::broadcast()` and the empty string are the
/// two reserved values — the empty string is never a valid node.
pub type NodeId = String;

/// Generate a process-stable node id: 48 bits of wall-clock milliseconds
/// followed by 80 bits of randomness, Crockford base32 encoded — the
/// same ULID shape `msgid::generate()` uses for message ids, reused here
/// because it already gives time-sortable, collision-resistant,
/// dependency-free unique identifiers.
pub fn generate_node_id() -> NodeId {
    const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
    use rand::Rng;

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut rng = rand::thread_rng();
    let rand_hi: u16 = rng.r#gen();
    let rand_lo: u64 = rng.r#gen();

    let mut buf = [0u8; 26];
    let mut ts = now_ms;
    for i in (0..10).rev() {
        buf[i] = CROCKFORD[(ts & 0x1F) as usize];
        ts >>= 5;
    }
    let mut r = rand_hi as u128 | ((rand_lo as u128) << 16);
    for i in (10..26).rev() {
        buf[i] = CROCKFORD[(r & 0x1F) as usize];
        r >>= 5;
    }
    // SAFETY: every byte came from the CROCKFORD alphabet, which is ASCII.
    unsafe { String::from_utf8_unchecked(buf.to_vec()) }
}

/// Is this a structurally valid node id (non-empty)? Does not check
/// uniqueness — that's a property of the generator, not the type.
pub fn is_valid_node_id(id: &str) -> bool {
    !id.is_empty()
}

/// Application message kind, carried in [`MeshMessage::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Voice,
    RouteRequest,
    RouteReply,
}

/// A mesh-wide message, unicast or broadcast.
///
/// `content` carries opaque bytes; voice payloads are base64-encoded on
/// the wire via `#[serde(with = "base64_bytes")]` so the JSON frame stays
/// text-safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshMessage {
    pub id: String,
    pub sender: NodeId,
    pub destination: NodeId,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub kind: MessageKind,
    pub timestamp: u64,
    pub hop_count: u32,
    pub sequence_number: u64,
}

impl MeshMessage {
    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST
    }

    /// Dedup key for this message, per §3: `sender:sequence_number`.
    /// Never `sender:timestamp` — see SPEC_FULL §9 Open Questions.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.sender, self.sequence_number)
    }

    pub fn exceeds_hop_limit(&self) -> bool {
        self.hop_count >= HOP_LIMIT
    }

    /// Return a copy forwarded one hop further. The `sender` field is
    /// never rewritten on forward (§3 invariant).
    pub fn forwarded(&self) -> Self {
        let mut next = self.clone();
        next.hop_count += 1;
        next
    }
}

/// Route request control frame (RREQ).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub id: String,
    pub source: NodeId,
    pub destination: NodeId,
    pub hop_count: u32,
    pub sequence_number: u64,
    pub timestamp: u64,
}

impl RouteRequest {
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.timestamp) >= RREQ_VALIDITY_MS
    }

    pub fn exceeds_hop_limit(&self) -> bool {
        self.hop_count >= HOP_LIMIT
    }

    pub fn forwarded(&self) -> Self {
        let mut next = self.clone();
        next.hop_count += 1;
        next
    }
}

/// Route reply control frame (RREP).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteReply {
    pub id: String,
    pub source: NodeId,
    pub destination: NodeId,
    pub hop_count: u32,
    pub sequence_number: u64,
    pub timestamp: u64,
}

impl RouteReply {
    pub fn forwarded(&self) -> Self {
        let mut next = self.clone();
        next.hop_count += 1;
        next
    }
}

/// A frame carried on a peer's data channel: either an application
/// message or one half of the route-discovery handshake. Distinguished
/// by an explicit tag rather than by `MeshMessage::kind` alone, so
/// control frames don't need to fake an application `content` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame")]
pub enum DataChannelFrame {
    #[serde(rename = "message")]
    Message(MeshMessage),
    #[serde(rename = "route_request")]
    RouteRequest(RouteRequest),
    #[serde(rename = "route_reply")]
    RouteReply(RouteReply),
    /// Application-level liveness probe (§4.2) — not itself a MeshMessage,
    /// never forwarded, never dedup-checked.
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
