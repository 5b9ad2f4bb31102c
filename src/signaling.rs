//! Signaling client: rendezvous, offer/answer/candidate relay, and the
//! local-discovery fallback (§4.1).
//!
//! Grounded in `s2s.rs::connect_peer_with_retry`'s backoff shape and
//! `freeq-sdk::client`'s documented "the SDK does not reconnect for you,
//! listen for the Disconnected event" stance — here the crate *does* own
//! reconnection, but the event-driven shape is the same: every
//! transition is observable, nothing blocks the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::MeshError;
use crate::wire::NodeId;

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Wire frames exchanged with the signaling server (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingFrame {
    #[serde(rename = "join")]
    Join { id: NodeId },
    #[serde(rename = "peer-list")]
    PeerList { peers: Vec<NodeId> },
    #[serde(rename = "offer")]
    Offer {
        from: NodeId,
        target: NodeId,
        offer: String,
    },
    #[serde(rename = "answer")]
    Answer {
        from: NodeId,
        target: NodeId,
        answer: String,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        from: NodeId,
        target: NodeId,
        candidate: String,
    },
}

/// Events the signaling client surfaces to the mesh actor. Distinct from
/// [`SignalingFrame`] because local discovery produces `PeerDiscovered`
/// without ever having a wire frame at all.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Joined,
    PeerList(Vec<NodeId>),
    Offer { from: NodeId, offer: Vec<u8> },
    Answer { from: NodeId, answer: Vec<u8> },
    Candidate { from: NodeId, candidate: Vec<u8> },
    /// Local-discovery-only: a peer announced itself. Never produced by
    /// the signaling-server path.
    PeerDiscovered(NodeId),
    Disconnected,
    /// Entered local-discovery mode because every signaling URL failed.
    LocalDiscoveryActive,
}

/// One live connection to a signaling server: a bidirectional text-frame
/// channel (§4.1).
#[async_trait]
pub trait SignalingLink: Send + Sync {
    async fn send(&self, frame: SignalingFrame) -> Result<(), MeshError>;
    async fn close(&self);
}

/// Opens [`SignalingLink`]s to a URL, handing back inbound frames on a
/// channel. The seam a real websocket/TCP implementation plugs into.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn SignalingLink>, mpsc::Receiver<SignalingFrame>), MeshError>;
}

/// Side-channel local discovery: "announce self, receive peer ids"
/// (§4.1). Never yields offers/answers itself.
#[async_trait]
pub trait LocalDiscovery: Send + Sync {
    async fn announce(&self, id: &NodeId);
    fn subscribe(&self) -> mpsc::Receiver<NodeId>;
}

enum Mode {
    Connected {
        link: Arc<dyn SignalingLink>,
    },
    LocalDiscovery,
    Disconnected,
}

/// Manages rendezvous: tries each configured URL, falls back to local
/// discovery, reconnects with exponential backoff, and relays
/// offer/answer/candidate frames for the peer-connection manager.
pub struct SignalingClient {
    node_id: NodeId,
    urls: Vec<String>,
    connector: Arc<dyn SignalingConnector>,
    local_discovery: Option<Arc<dyn LocalDiscovery>>,
    clock: SharedClock,
    mode: parking_lot::Mutex<Mode>,
}

impl SignalingClient {
    pub fn new(
        node_id: NodeId,
        urls: Vec<String>,
        connector: Arc<dyn SignalingConnector>,
        local_discovery: Option<Arc<dyn LocalDiscovery>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            node_id,
            urls,
            connector,
            local_discovery,
            clock,
            mode: parking_lot::Mutex::new(Mode::Disconnected),
        }
    }

    /// Try every URL in order with a 5 s connect deadline each. On
    /// success, joins and spawns a forwarding task that feeds
    /// [`SignalingEvent`]s into `events_tx` and reconnects with backoff
    /// on disconnect. On total failure, falls back to local discovery if
    /// configured; if neither path works, returns
    /// [`MeshError::SignalingUnavailable`].
    pub async fn start(
        self: Arc<Self>,
        events_tx: mpsc::Sender<SignalingEvent>,
    ) -> Result<(), MeshError> {
        if let Some(link_and_rx) = self.try_all_urls().await {
            let (link, rx) = link_and_rx;
            *self.mode.lock() = Mode::Connected { link: link.clone() };
            link.send(SignalingFrame::Join {
                id: self.node_id.clone(),
            })
            .await?;
            let _ = events_tx.send(SignalingEvent::Joined).await;
            let me = Arc::clone(&self);
            tokio::spawn(async move {
                me.run_link(link, rx, events_tx).await;
            });
            return Ok(());
        }

        if let Some(discovery) = self.local_discovery.clone() {
            info!("no signaling endpoint reachable, entering local-discovery mode");
            *self.mode.lock() = Mode::LocalDiscovery;
            discovery.announce(&self.node_id).await;
            let mut rx = discovery.subscribe();
            let _ = events_tx
                .send(SignalingEvent::LocalDiscoveryActive)
                .await;
            tokio::spawn(async move {
                while let Some(peer) = rx.recv().await {
                    if events_tx
                        .send(SignalingEvent::PeerDiscovered(peer))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
            return Ok(());
        }

        Err(MeshError::SignalingUnavailable)
    }

    async fn try_all_urls(
        &self,
    ) -> Option<(Arc<dyn SignalingLink>, mpsc::Receiver<SignalingFrame>)> {
        for url in &self.urls {
            debug!(url, "attempting signaling connection");
            match tokio::time::timeout(CONNECT_DEADLINE, self.connector.connect(url)).await {
                Ok(Ok(pair)) => {
                    info!(url, "signaling connected");
                    return Some(pair);
                }
                Ok(Err(e)) => warn!(url, "signaling connect failed: {e}"),
                Err(_) => warn!(url, "signaling connect timed out after {CONNECT_DEADLINE:?}"),
            }
        }
        None
    }

    /// Drives one established link until it disconnects, then reconnects
    /// with exponential backoff (5s → 60s cap) forever. Peer sessions
    /// survive signaling loss — only signaling-level state is flushed.
    async fn run_link(
        self: Arc<Self>,
        mut link: Arc<dyn SignalingLink>,
        mut rx: mpsc::Receiver<SignalingFrame>,
        events_tx: mpsc::Sender<SignalingEvent>,
    ) {
        loop {
            while let Some(frame) = rx.recv().await {
                if let Some(event) = Self::translate(frame) {
                    if events_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }

            warn!("signaling link disconnected");
            *self.mode.lock() = Mode::Disconnected;
            if events_tx.send(SignalingEvent::Disconnected).await.is_err() {
                return;
            }

            let mut backoff = INITIAL_BACKOFF;
            loop {
                tokio::time::sleep(backoff).await;
                if let Some((new_link, new_rx)) = self.try_all_urls().await {
                    *self.mode.lock() = Mode::Connected {
                        link: new_link.clone(),
                    };
                    if new_link
                        .send(SignalingFrame::Join {
                            id: self.node_id.clone(),
                        })
                        .await
                        .is_err()
                    {
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                    let _ = events_tx.send(SignalingEvent::Joined).await;
                    link = new_link;
                    rx = new_rx;
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    fn translate(frame: SignalingFrame) -> Option<SignalingEvent> {
        match frame {
            SignalingFrame::Join { .. } => None, // client→server only
            SignalingFrame::PeerList { peers } => Some(SignalingEvent::PeerList(peers)),
            SignalingFrame::Offer { from, offer, .. } => Some(SignalingEvent::Offer {
                from,
                offer: offer.into_bytes(),
            }),
            SignalingFrame::Answer { from, answer, .. } => Some(SignalingEvent::Answer {
                from,
                answer: answer.into_bytes(),
            }),
            SignalingFrame::IceCandidate {
                from, candidate, ..
            } => Some(SignalingEvent::Candidate {
                from,
                candidate: candidate.into_bytes(),
            }),
        }
    }

    /// Relay an offer to `target` via the currently-active link, if any.
    pub async fn send_offer(&self, target: &NodeId, offer: Vec<u8>) -> Result<(), MeshError> {
        self.send_frame(SignalingFrame::Offer {
            from: self.node_id.clone(),
            target: target.clone(),
            offer: String::from_utf8_lossy(&offer).into_owned(),
        })
        .await
    }

    pub async fn send_answer(&self, target: &NodeId, answer: Vec<u8>) -> Result<(), MeshError> {
        self.send_frame(SignalingFrame::Answer {
            from: self.node_id.clone(),
            target: target.clone(),
            answer: String::from_utf8_lossy(&answer).into_owned(),
        })
        .await
    }

    pub async fn send_candidate(
        &self,
        target: &NodeId,
        candidate: Vec<u8>,
    ) -> Result<(), MeshError> {
        self.send_frame(SignalingFrame::IceCandidate {
            from: self.node_id.clone(),
            target: target.clone(),
            candidate: String::from_utf8_lossy(&candidate).into_owned(),
        })
        .await
    }

    async fn send_frame(&self, frame: SignalingFrame) -> Result<(), MeshError> {
        let link = match &*self.mode.lock() {
            Mode::Connected { link } => link.clone(),
            _ => {
                return Err(MeshError::TransportOpenFailed {
                    peer: String::new(),
                    reason: "no active signaling link".into(),
                });
            }
        };
        link.send(frame).await
    }

    /// Is a live signaling link currently connected (not local-discovery,
    /// not disconnected)?
    pub fn is_connected(&self) -> bool {
        matches!(&*self.mode.lock(), Mode::Connected { .. })
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingLink {
        sent: StdMutex<Vec<SignalingFrame>>,
    }

    #[async_trait]
    impl SignalingLink for RecordingLink {
        async fn send(&self, frame: SignalingFrame) -> Result<(), MeshError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
        async fn close(&self) {}
    }

    /// Connects successfully only for URLs in `good_urls`, recording
    /// every attempted URL in call order.
    struct ScriptedConnector {
        good_urls: Vec<String>,
        attempts: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl SignalingConnector for ScriptedConnector {
        async fn connect(
            &self,
            url: &str,
        ) -> Result<(Arc<dyn SignalingLink>, mpsc::Receiver<SignalingFrame>), MeshError> {
            self.attempts.lock().unwrap().push(url.to_string());
            if self.good_urls.iter().any(|u| u == url) {
                let (_tx, rx) = mpsc::channel(4);
                Ok((
                    Arc::new(RecordingLink {
                        sent: StdMutex::new(Vec::new()),
                    }),
                    rx,
                ))
            } else {
                Err(MeshError::TransportOpenFailed {
                    peer: String::new(),
                    reason: "connection refused".into(),
                })
            }
        }
    }

    struct AlwaysFailConnector {
        attempts: StdMutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl SignalingConnector for AlwaysFailConnector {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(Arc<dyn SignalingLink>, mpsc::Receiver<SignalingFrame>), MeshError> {
            self.attempts.lock().unwrap().push(tokio::time::Instant::now());
            Err(MeshError::TransportOpenFailed {
                peer: String::new(),
                reason: "refused".into(),
            })
        }
    }

    struct RecordingDiscovery {
        announced: StdMutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl LocalDiscovery for RecordingDiscovery {
        async fn announce(&self, id: &NodeId) {
            self.announced.lock().unwrap().push(id.clone());
        }
        fn subscribe(&self) -> mpsc::Receiver<NodeId> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }

    #[tokio::test]
    async fn try_all_urls_skips_failures_and_returns_the_first_success() {
        let connector = Arc::new(ScriptedConnector {
            good_urls: vec!["mock://b".into()],
            attempts: StdMutex::new(Vec::new()),
        });
        let client = SignalingClient::new(
            "self".into(),
            vec!["mock://a".into(), "mock://b".into(), "mock://c".into()],
            connector.clone(),
            None,
            crate::clock::system_clock(),
        );

        let result = client.try_all_urls().await;
        assert!(result.is_some());
        assert_eq!(
            *connector.attempts.lock().unwrap(),
            vec!["mock://a".to_string(), "mock://b".to_string()],
            "must stop trying once a URL succeeds, never reaching mock://c"
        );
    }

    #[tokio::test]
    async fn start_falls_back_to_local_discovery_when_every_url_fails() {
        let connector = Arc::new(ScriptedConnector {
            good_urls: Vec::new(),
            attempts: StdMutex::new(Vec::new()),
        });
        let discovery = Arc::new(RecordingDiscovery {
            announced: StdMutex::new(Vec::new()),
        });
        let client = Arc::new(SignalingClient::new(
            "self".into(),
            vec!["mock://a".into(), "mock://b".into()],
            connector,
            Some(discovery.clone()),
            crate::clock::system_clock(),
        ));

        let (tx, mut rx) = mpsc::channel(8);
        client.start(tx).await.expect("local discovery must succeed when every URL fails");

        let event = rx.recv().await.expect("an event must be emitted");
        assert!(matches!(event, SignalingEvent::LocalDiscoveryActive));
        assert_eq!(discovery.announced.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn start_is_signaling_unavailable_when_every_url_fails_and_no_local_discovery() {
        let connector = Arc::new(ScriptedConnector {
            good_urls: Vec::new(),
            attempts: StdMutex::new(Vec::new()),
        });
        let client = Arc::new(SignalingClient::new(
            "self".into(),
            vec!["mock://a".into()],
            connector,
            None,
            crate::clock::system_clock(),
        ));

        let (tx, _rx) = mpsc::channel(8);
        let result = client.start(tx).await;
        assert!(matches!(result, Err(MeshError::SignalingUnavailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_doubles_then_caps_at_sixty_seconds() {
        let connector = Arc::new(AlwaysFailConnector {
            attempts: StdMutex::new(Vec::new()),
        });
        let client = Arc::new(SignalingClient::new(
            "self".into(),
            vec!["mock://a".into()],
            connector.clone(),
            None,
            crate::clock::system_clock(),
        ));

        let (already_closed_tx, initial_rx) = mpsc::channel::<SignalingFrame>(1);
        drop(already_closed_tx);
        let (events_tx, _events_rx) = mpsc::channel(64);
        let initial_link: Arc<dyn SignalingLink> = Arc::new(RecordingLink {
            sent: StdMutex::new(Vec::new()),
        });

        // The reconnect loop runs forever as long as every attempt keeps
        // failing, so bound it with a timeout long enough to observe the
        // backoff reach its cap (5s, 10s, 20s, 40s, 60s, 60s, ...).
        let _ = tokio::time::timeout(
            Duration::from_secs(250),
            client.clone().run_link(initial_link, initial_rx, events_tx),
        )
        .await;

        let attempts = connector.attempts.lock().unwrap().clone();
        assert!(attempts.len() >= 5, "expected at least 5 reconnect attempts by t=250s, got {}", attempts.len());

        let gaps: Vec<Duration> = attempts
            .windows(2)
            .map(|w| w[1].duration_since(w[0]))
            .collect();

        // Early gaps double: 10s, 20s.
        assert_eq!(gaps[0], Duration::from_secs(10));
        assert_eq!(gaps[1], Duration::from_secs(20));

        // Once the cap is reached it stops growing.
        let last_two = &gaps[gaps.len() - 2..];
        assert_eq!(last_two[0], Duration::from_secs(60));
        assert_eq!(last_two[1], Duration::from_secs(60));
    }
}
