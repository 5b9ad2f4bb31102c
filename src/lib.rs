//! Peer-to-peer mesh communication core for off-grid voice-and-text
//! radio.
//!
//! Three pieces compose into the public [`facade::Mesh`] handle:
//!
//! - [`peer`] — the offer/answer/candidate handshake and fatal-failure
//!   suppression for a single connection.
//! - [`routing`] — the reactive, AODV-style distance-vector protocol
//!   that decides where a message goes.
//! - [`pool`] — the bounded, scored, LRU-evicting map of live
//!   connections everything else is built on.
//!
//! Everything else — [`wire`], [`signaling`], [`transport`], [`dedup`],
//! [`outbound`], [`clock`] — is plumbing those three depend on. Only
//! [`facade`], [`config`], [`event`], and [`error`] are public; an
//! embedder drives the mesh entirely through [`facade::Mesh`] and never
//! touches the routing table or connection pool directly.

pub mod clock;
pub mod config;
pub(crate) mod dedup;
pub mod error;
pub mod event;
pub mod facade;
pub(crate) mod outbound;
pub(crate) mod peer;
pub(crate) mod pool;
pub(crate) mod routing;
pub mod signaling;
pub mod transport;
pub mod wire;

pub use config::MeshConfig;
pub use error::MeshError;
pub use event::MeshEvent;
pub use facade::{Mesh, NetworkQuality, NetworkStatus};
