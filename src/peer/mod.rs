//! Peer-connection lifecycle manager (§4.2).
//!
//! Owns the offer/answer/candidate dance and the fatal-condition
//! suppression rule; the resulting [`PeerConnection`] records are handed
//! off to [`crate::pool::Pool`], which is the sole long-term owner of
//! connection state (§3 "Ownership"). Grounded in `s2s.rs`'s
//! generation-counter pattern for racing connects/disconnects safely,
//! adapted from its duplicate-S2S-link tie-break to this spec's
//! offer/answer handshake.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::MeshError;
use crate::signaling::SignalingClient;
use crate::transport::{Transport, TransportDriver, TransportFactory};
use crate::wire::NodeId;

/// How long a candidate is buffered waiting for the remote description
/// before it's dropped (§4.2).
const CANDIDATE_BUFFER_TTL: Duration = Duration::from_secs(30);

/// How long `connect_outbound` waits for an answer before giving up.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Three consecutive failures within this window mark the peer failed.
const FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// ...and suppress further attempts for this long.
const FAILURE_SUPPRESSION: Duration = Duration::from_secs(60);

/// State-machine status of a [`PeerConnection`] (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// A single transport connection to a peer, owned exclusively by the
/// pool once established (§3).
pub struct PeerConnection {
    pub peer_id: NodeId,
    pub transport: Transport,
    pub driver: Arc<dyn TransportDriver>,
    pub status: PeerStatus,
    pub data_channel_open: bool,
    pub last_used: Instant,
    pub created_at: Instant,
    pub latency_ms: Option<u32>,
    pub reliability: u8,
    pub sent: u64,
    pub received: u64,
}

impl PeerConnection {
    /// Transport-preference score (§4.5): `(100 - latency) *
    /// (reliability / 100)`. Missing latency is treated as 0 (best
    /// case) so a never-measured fresh connection isn't penalized.
    pub fn preference_score(&self) -> f64 {
        let latency = self.latency_ms.unwrap_or(0).min(100) as f64;
        (100.0 - latency) * (self.reliability as f64 / 100.0)
    }
}

/// The successful outcome of an offer/answer handshake: a connected
/// driver plus the channel it will push inbound application frames into.
pub struct ConnectedPeer {
    pub driver: Arc<dyn TransportDriver>,
    pub rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    pub transport: Transport,
}

struct PendingLink {
    driver: Arc<dyn TransportDriver>,
    remote_set: bool,
    buffer: Vec<(Vec<u8>, Instant)>,
}

#[derive(Default)]
struct FailureRecord {
    attempts: VecDeque<Instant>,
    suppressed_until: Option<Instant>,
}

/// Orchestrates offer/answer/candidate exchange for one mesh instance.
pub struct PeerConnector {
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<SignalingClient>,
    clock: SharedClock,
    pending_links: AsyncMutex<HashMap<NodeId, PendingLink>>,
    pending_answers: AsyncMutex<HashMap<NodeId, oneshot::Sender<Vec<u8>>>>,
    failures: AsyncMutex<HashMap<NodeId, FailureRecord>>,
}

impl PeerConnector {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<SignalingClient>,
        clock: SharedClock,
    ) -> Self {
        Self {
            factory,
            signaling,
            clock,
            pending_links: AsyncMutex::new(HashMap::new()),
            pending_answers: AsyncMutex::new(HashMap::new()),
            failures: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Local-initiated connect (§4.2): create a driver-managed channel,
    /// generate an offer, relay it via signaling, await the answer,
    /// apply it, flush any buffered candidates.
    pub async fn connect_outbound(
        &self,
        peer: &NodeId,
        transport: Transport,
        now: Instant,
    ) -> Result<ConnectedPeer, MeshError> {
        if self.is_suppressed(peer, now).await {
            return Err(MeshError::TransportOpenFailed {
                peer: peer.clone(),
                reason: "peer in fatal-failure cooldown".into(),
            });
        }

        match self.try_connect_outbound(peer, transport).await {
            Ok(connected) => {
                self.record_success(peer).await;
                Ok(connected)
            }
            Err(e) => {
                self.record_failure(peer, now).await;
                self.pending_links.lock().await.remove(peer);
                self.pending_answers.lock().await.remove(peer);
                Err(e)
            }
        }
    }

    async fn try_connect_outbound(
        &self,
        peer: &NodeId,
        transport: Transport,
    ) -> Result<ConnectedPeer, MeshError> {
        let (driver, rx) = self.factory.create(peer, transport).await?;

        let (answer_tx, answer_rx) = oneshot::channel();
        self.pending_answers
            .lock()
            .await
            .insert(peer.clone(), answer_tx);
        self.pending_links.lock().await.insert(
            peer.clone(),
            PendingLink {
                driver: driver.clone(),
                remote_set: false,
                buffer: Vec::new(),
            },
        );

        let offer = driver.create_offer().await?;
        self.signaling.send_offer(peer, offer).await?;

        let answer = tokio::time::timeout(ANSWER_TIMEOUT, answer_rx)
            .await
            .map_err(|_| MeshError::TransportOpenFailed {
                peer: peer.clone(),
                reason: "timed out waiting for answer".into(),
            })?
            .map_err(|_| MeshError::TransportOpenFailed {
                peer: peer.clone(),
                reason: "answer channel closed".into(),
            })?;

        driver.apply_remote_answer(&answer).await?;
        self.mark_remote_set_and_flush(peer, &driver).await;

        if !driver.is_data_channel_open() {
            return Err(MeshError::TransportOpenFailed {
                peer: peer.clone(),
                reason: "data channel did not open".into(),
            });
        }

        self.pending_links.lock().await.remove(peer);
        Ok(ConnectedPeer {
            driver,
            rx,
            transport,
        })
    }

    /// Remote-initiated connect (§4.2): on offer receipt, create a
    /// matching channel and answer.
    pub async fn handle_offer(
        &self,
        from: &NodeId,
        offer: Vec<u8>,
        transport: Transport,
    ) -> Result<ConnectedPeer, MeshError> {
        let (driver, rx) = self.factory.create(from, transport).await?;
        self.pending_links.lock().await.insert(
            from.clone(),
            PendingLink {
                driver: driver.clone(),
                remote_set: true, // we received the remote offer directly
                buffer: Vec::new(),
            },
        );

        let answer = driver.create_answer(&offer).await?;
        self.signaling.send_answer(from, answer).await?;
        self.mark_remote_set_and_flush(from, &driver).await;
        self.pending_links.lock().await.remove(from);

        if !driver.is_data_channel_open() {
            return Err(MeshError::TransportOpenFailed {
                peer: from.clone(),
                reason: "data channel did not open".into(),
            });
        }

        Ok(ConnectedPeer {
            driver,
            rx,
            transport,
        })
    }

    pub async fn handle_answer(&self, from: &NodeId, answer: Vec<u8>) {
        if let Some(tx) = self.pending_answers.lock().await.remove(from) {
            let _ = tx.send(answer);
        } else {
            debug!(peer = %from, "answer received with no pending offer");
        }
    }

    /// Candidates may arrive before or after the answer (§4.2). Apply
    /// immediately if the remote description is already set, otherwise
    /// buffer (dropped after 30 s).
    pub async fn handle_candidate(&self, from: &NodeId, candidate: Vec<u8>, now: Instant) {
        let mut links = self.pending_links.lock().await;
        let Some(link) = links.get_mut(from) else {
            debug!(peer = %from, "candidate received with no pending link");
            return;
        };
        if link.remote_set {
            let driver = link.driver.clone();
            drop(links);
            let _ = driver.add_remote_candidate(&candidate).await;
        } else {
            link.buffer.push((candidate, now));
        }
    }

    async fn mark_remote_set_and_flush(&self, peer: &NodeId, driver: &Arc<dyn TransportDriver>) {
        let buffered = {
            let mut links = self.pending_links.lock().await;
            match links.get_mut(peer) {
                Some(link) => {
                    link.remote_set = true;
                    std::mem::take(&mut link.buffer)
                }
                None => Vec::new(),
            }
        };
        let now = self.clock.now();
        for (candidate, queued_at) in buffered {
            if now.saturating_duration_since(queued_at) >= CANDIDATE_BUFFER_TTL {
                debug!(peer = %peer, "dropping candidate buffered past TTL");
                continue;
            }
            let _ = driver.add_remote_candidate(&candidate).await;
        }
    }

    async fn is_suppressed(&self, peer: &NodeId, now: Instant) -> bool {
        self.failures
            .lock()
            .await
            .get(peer)
            .and_then(|r| r.suppressed_until)
            .is_some_and(|until| now < until)
    }

    async fn record_failure(&self, peer: &NodeId, now: Instant) {
        let mut failures = self.failures.lock().await;
        let record = failures.entry(peer.clone()).or_default();
        record.attempts.push_back(now);
        while let Some(&front) = record.attempts.front() {
            if now.saturating_duration_since(front) > FAILURE_WINDOW {
                record.attempts.pop_front();
            } else {
                break;
            }
        }
        if record.attempts.len() >= 3 {
            warn!(peer = %peer, "three setup failures within 30s, suppressing reattempts for 60s");
            record.suppressed_until = Some(now + FAILURE_SUPPRESSION);
            record.attempts.clear();
        }
    }

    async fn record_success(&self, peer: &NodeId) {
        self.failures.lock().await.remove(peer);
        info!(peer = %peer, "peer connection established");
    }
}
