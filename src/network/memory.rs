//! In-process network adapters for tests and same-process repos.
//!
//! `MemoryNetworkAdapter::pair` builds two adapters joined by crossed
//! channels, so two repos in one process can discover each other and sync.
//! `DummyNetworkAdapter` is a transport with no peers at all, useful for
//! exercising unavailability paths.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

use crate::ids::{PeerId, PeerMetadata};
use crate::protocol::RepoMessage;

use super::{AdapterEvent, NetworkAdapter, NetworkError, ADAPTER_EVENT_CAPACITY};

/// Messages crossing between the two halves of a pair.
#[derive(Debug, Clone)]
enum Wire {
    /// "I am here": identity and metadata, sent on connect.
    Join { peer_id: PeerId, metadata: PeerMetadata },
    /// A repo message in flight.
    Repo(RepoMessage),
    /// "I am gone", sent on disconnect.
    Leave { peer_id: PeerId },
}

struct PairState {
    local: Option<(PeerId, PeerMetadata)>,
    remote: Option<PeerId>,
}

struct PairInner {
    outbound: mpsc::UnboundedSender<Wire>,
    events: broadcast::Sender<AdapterEvent>,
    state: Mutex<PairState>,
}

/// One half of an in-process transport pair.
#[derive(Clone)]
pub struct MemoryNetworkAdapter {
    inner: Arc<PairInner>,
}

impl MemoryNetworkAdapter {
    /// Build two connected halves. Each half is ready from construction;
    /// peers appear once both halves have called `connect`.
    pub fn pair() -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let a = Self::build(tx_ab);
        let b = Self::build(tx_ba);
        a.spawn_reader(rx_ba);
        b.spawn_reader(rx_ab);
        (a, b)
    }

    fn build(outbound: mpsc::UnboundedSender<Wire>) -> Self {
        let (events, _) = broadcast::channel(ADAPTER_EVENT_CAPACITY);
        Self {
            inner: Arc::new(PairInner {
                outbound,
                events,
                state: Mutex::new(PairState { local: None, remote: None }),
            }),
        }
    }

    fn spawn_reader(&self, mut rx: mpsc::UnboundedReceiver<Wire>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(wire) = rx.recv().await {
                match wire {
                    Wire::Join { peer_id, metadata } => {
                        let answer = {
                            let mut state = inner.state.lock().unwrap();
                            let first_sighting = state.remote.as_ref() != Some(&peer_id);
                            state.remote = Some(peer_id.clone());
                            // Answer a late joiner so both sides learn of
                            // each other regardless of connect order.
                            first_sighting.then(|| state.local.clone()).flatten()
                        };
                        let _ = inner.events.send(AdapterEvent::PeerCandidate {
                            peer_id,
                            metadata,
                        });
                        if let Some((local_id, local_meta)) = answer {
                            let _ = inner.outbound.send(Wire::Join {
                                peer_id: local_id,
                                metadata: local_meta,
                            });
                        }
                    }
                    Wire::Repo(msg) => {
                        let _ = inner.events.send(AdapterEvent::Message(msg));
                    }
                    Wire::Leave { peer_id } => {
                        inner.state.lock().unwrap().remote = None;
                        let _ = inner.events.send(AdapterEvent::PeerDisconnected { peer_id });
                    }
                }
            }
        });
    }
}

#[async_trait]
impl NetworkAdapter for MemoryNetworkAdapter {
    async fn connect(&self, peer_id: PeerId, metadata: PeerMetadata) {
        self.inner.state.lock().unwrap().local = Some((peer_id.clone(), metadata.clone()));
        let _ = self.inner.outbound.send(Wire::Join { peer_id, metadata });
        let _ = self.inner.events.send(AdapterEvent::Ready);
    }

    async fn disconnect(&self) {
        let (local, remote) = {
            let mut state = self.inner.state.lock().unwrap();
            (state.local.clone(), state.remote.take())
        };
        if let Some((peer_id, _)) = local {
            let _ = self.inner.outbound.send(Wire::Leave { peer_id });
        }
        if let Some(remote) = remote {
            let _ = self
                .inner
                .events
                .send(AdapterEvent::PeerDisconnected { peer_id: remote });
        }
    }

    async fn send(&self, msg: RepoMessage) -> Result<(), NetworkError> {
        self.inner
            .outbound
            .send(Wire::Repo(msg))
            .map_err(|e| NetworkError::AdapterSend(e.to_string()))
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }
}

/// A transport with no peers behind it.
pub struct DummyNetworkAdapter {
    start_ready: bool,
    events: broadcast::Sender<AdapterEvent>,
}

impl DummyNetworkAdapter {
    pub fn new(start_ready: bool) -> Self {
        let (events, _) = broadcast::channel(ADAPTER_EVENT_CAPACITY);
        Self { start_ready, events }
    }

    /// Flip the adapter to ready, for tests that delay readiness.
    pub fn emit_ready(&self) {
        let _ = self.events.send(AdapterEvent::Ready);
    }
}

#[async_trait]
impl NetworkAdapter for DummyNetworkAdapter {
    async fn connect(&self, _peer_id: PeerId, _metadata: PeerMetadata) {}

    async fn disconnect(&self) {
        let _ = self.events.send(AdapterEvent::Close);
    }

    async fn send(&self, msg: RepoMessage) -> Result<(), NetworkError> {
        Err(NetworkError::AdapterSend(format!(
            "dummy adapter has no peers ({} to {})",
            msg.type_name(),
            msg.target_id()
        )))
    }

    fn is_ready(&self) -> bool {
        self.start_ready
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DocumentId;
    use tokio::time::{timeout, Duration};

    async fn next_event(rx: &mut broadcast::Receiver<AdapterEvent>) -> AdapterEvent {
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_pair_handshake_both_orders() {
        let (a, b) = MemoryNetworkAdapter::pair();
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.connect(PeerId::from("alice"), PeerMetadata::default()).await;
        b.connect(PeerId::from("bob"), PeerMetadata::default()).await;

        // Both sides see the other as a candidate, whatever the order.
        loop {
            if let AdapterEvent::PeerCandidate { peer_id, .. } = next_event(&mut a_events).await {
                assert_eq!(peer_id.as_str(), "bob");
                break;
            }
        }
        loop {
            if let AdapterEvent::PeerCandidate { peer_id, .. } = next_event(&mut b_events).await {
                assert_eq!(peer_id.as_str(), "alice");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_pair_delivers_messages() {
        let (a, b) = MemoryNetworkAdapter::pair();
        let mut b_events = b.subscribe();
        a.connect(PeerId::from("alice"), PeerMetadata::default()).await;
        b.connect(PeerId::from("bob"), PeerMetadata::default()).await;

        let msg = RepoMessage::DocUnavailable {
            sender_id: PeerId::from("alice"),
            target_id: PeerId::from("bob"),
            document_id: DocumentId::random(),
        };
        a.send(msg).await.unwrap();

        loop {
            if let AdapterEvent::Message(m) = next_event(&mut b_events).await {
                assert_eq!(m.type_name(), "doc-unavailable");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_notifies_both_sides() {
        let (a, b) = MemoryNetworkAdapter::pair();
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();
        a.connect(PeerId::from("alice"), PeerMetadata::default()).await;
        b.connect(PeerId::from("bob"), PeerMetadata::default()).await;

        b.disconnect().await;

        loop {
            if let AdapterEvent::PeerDisconnected { peer_id } = next_event(&mut a_events).await {
                assert_eq!(peer_id.as_str(), "bob");
                break;
            }
        }
        loop {
            if let AdapterEvent::PeerDisconnected { peer_id } = next_event(&mut b_events).await {
                assert_eq!(peer_id.as_str(), "alice");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (a, b) = MemoryNetworkAdapter::pair();
        let mut a_events = a.subscribe();
        a.connect(PeerId::from("alice"), PeerMetadata::default()).await;
        b.connect(PeerId::from("bob"), PeerMetadata::default()).await;
        b.disconnect().await;

        // Drain until the disconnect is observed.
        loop {
            if let AdapterEvent::PeerDisconnected { .. } = next_event(&mut a_events).await {
                break;
            }
        }

        b.connect(PeerId::from("bob"), PeerMetadata::default()).await;
        loop {
            if let AdapterEvent::PeerCandidate { peer_id, .. } = next_event(&mut a_events).await {
                assert_eq!(peer_id.as_str(), "bob");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_dummy_adapter_readiness() {
        let ready = DummyNetworkAdapter::new(true);
        assert!(ready.is_ready());
        let lazy = DummyNetworkAdapter::new(false);
        assert!(!lazy.is_ready());
    }
}
