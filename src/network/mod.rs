//! Networking: the adapter seam and the multiplexer over it.
//!
//! A `NetworkAdapter` is one transport (a websocket, a message channel, a
//! broadcast channel). The `NetworkSubsystem` multiplexes any number of
//! them: it tracks which adapter first claimed each peer, tags outbound
//! messages with the local peer id, stamps outbound ephemerals with a
//! session id and a monotonically increasing count, and drops inbound
//! ephemerals that arrive late or twice for a `(sender, session)` pair.
//!
//! ```text
//! adapter A ──┐                        ┌── Peer / PeerLeft
//! adapter B ──┼── NetworkSubsystem ────┼── Message(RepoMessage)
//! adapter C ──┘   (routing, dedupe)    └── readiness watch
//! ```

pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::ids::{PeerId, PeerMetadata};
use crate::protocol::RepoMessage;

pub use memory::{DummyNetworkAdapter, MemoryNetworkAdapter};

/// Capacity of each adapter's event channel.
const ADAPTER_EVENT_CAPACITY: usize = 512;

/// Events a transport adapter emits.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A remote peer announced itself on this transport.
    PeerCandidate { peer_id: PeerId, metadata: PeerMetadata },
    /// A remote peer went away.
    PeerDisconnected { peer_id: PeerId },
    /// An inbound wire message.
    Message(RepoMessage),
    /// The adapter finished its own setup.
    Ready,
    /// The adapter shut down.
    Close,
}

/// Events the subsystem hands to the repo.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer is routable; metadata was exchanged at connection setup.
    Peer { peer_id: PeerId, metadata: PeerMetadata },
    /// A peer is no longer routable.
    PeerLeft { peer_id: PeerId },
    /// An inbound message that survived validation and dedupe.
    Message(RepoMessage),
}

/// Network failures. Logged; the message is dropped.
#[derive(Debug, Clone)]
pub enum NetworkError {
    /// No adapter claims the target peer.
    UnknownPeer(PeerId),
    /// The owning adapter rejected the send.
    AdapterSend(String),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownPeer(peer) => write!(f, "no route to peer {peer}"),
            Self::AdapterSend(e) => write!(f, "adapter send failed: {e}"),
        }
    }
}

impl std::error::Error for NetworkError {}

/// The pluggable transport seam.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Announce the local peer on this transport.
    async fn connect(&self, peer_id: PeerId, metadata: PeerMetadata);
    /// Tear the transport down.
    async fn disconnect(&self);
    /// Send one message towards its `target_id`.
    async fn send(&self, msg: RepoMessage) -> Result<(), NetworkError>;
    /// Whether the transport finished its own setup.
    fn is_ready(&self) -> bool;
    /// Subscribe to this adapter's events.
    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;

    /// Resolve once the transport reports ready.
    async fn when_ready(&self) {
        if self.is_ready() {
            return;
        }
        let mut events = self.subscribe();
        loop {
            match events.recv().await {
                Ok(AdapterEvent::Ready) if self.is_ready() => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Multiplexes N adapters and owns peer-to-adapter routing.
pub struct NetworkSubsystem {
    peer_id: PeerId,
    adapters: Vec<Arc<dyn NetworkAdapter>>,
    routes: Arc<Mutex<HashMap<PeerId, usize>>>,
    ready_tx: watch::Sender<bool>,
    session_id: String,
    ephemeral_count: AtomicU32,
}

impl NetworkSubsystem {
    /// Wire up the adapters and connect each one. Returns the subsystem and
    /// the unified event stream.
    pub async fn new(
        peer_id: PeerId,
        metadata: PeerMetadata,
        adapters: Vec<Arc<dyn NetworkAdapter>>,
    ) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let routes: Arc<Mutex<HashMap<PeerId, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, _) = watch::channel(false);
        // One filter for the whole subsystem: a duplicate is a duplicate no
        // matter which transport delivered it.
        let dedupe: Arc<Mutex<EphemeralDedupe>> = Arc::new(Mutex::new(EphemeralDedupe::default()));

        for (index, adapter) in adapters.iter().enumerate() {
            let mut adapter_events = adapter.subscribe();
            let events_tx = events_tx.clone();
            let routes = routes.clone();
            let ready_tx = ready_tx.clone();
            let all: Vec<Arc<dyn NetworkAdapter>> = adapters.clone();
            let dedupe = dedupe.clone();

            tokio::spawn(async move {
                loop {
                    let event = match adapter_events.recv().await {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("adapter {index} lagged by {n} events");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    match event {
                        AdapterEvent::PeerCandidate { peer_id, metadata } => {
                            let first_claim = {
                                let mut routes = routes.lock().unwrap();
                                match routes.get(&peer_id) {
                                    Some(_) => false,
                                    None => {
                                        routes.insert(peer_id.clone(), index);
                                        true
                                    }
                                }
                            };
                            if first_claim {
                                let _ = events_tx.send(NetworkEvent::Peer { peer_id, metadata });
                            }
                        }
                        AdapterEvent::PeerDisconnected { peer_id } => {
                            let routed_here = {
                                let mut routes = routes.lock().unwrap();
                                if routes.get(&peer_id) == Some(&index) {
                                    routes.remove(&peer_id);
                                    true
                                } else {
                                    false
                                }
                            };
                            if routed_here {
                                let _ = events_tx.send(NetworkEvent::PeerLeft { peer_id });
                            }
                        }
                        AdapterEvent::Message(msg) => {
                            if dedupe.lock().unwrap().admit(&msg) {
                                let _ = events_tx.send(NetworkEvent::Message(msg));
                            }
                        }
                        AdapterEvent::Ready => {
                            let ready = all.iter().all(|a| a.is_ready());
                            ready_tx.send_replace(ready);
                        }
                        AdapterEvent::Close => {
                            log::debug!("adapter {index} closed");
                            ready_tx.send_replace(false);
                        }
                    }
                }
            });
        }

        for adapter in &adapters {
            adapter.connect(peer_id.clone(), metadata.clone()).await;
        }
        ready_tx.send_replace(adapters.iter().all(|a| a.is_ready()));

        (
            Self {
                peer_id,
                adapters,
                routes,
                ready_tx,
                session_id: Uuid::new_v4().simple().to_string(),
                ephemeral_count: AtomicU32::new(0),
            },
            events_rx,
        )
    }

    /// The local peer id every outbound message is tagged with.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Send a message to its target peer. The subsystem tags the sender and
    /// stamps ephemerals; an unroutable target drops the message with a log.
    pub async fn send(&self, mut msg: RepoMessage) -> Result<(), NetworkError> {
        msg.set_sender(self.peer_id.clone());
        if let RepoMessage::Ephemeral { count, session_id, .. } = &mut msg {
            *count = self.ephemeral_count.fetch_add(1, Ordering::SeqCst) + 1;
            *session_id = self.session_id.clone();
        }

        let target = msg.target_id().clone();
        let adapter_index = self.routes.lock().unwrap().get(&target).copied();
        let Some(adapter_index) = adapter_index else {
            log::warn!("dropping {} message: no route to {target}", msg.type_name());
            return Err(NetworkError::UnknownPeer(target));
        };
        self.adapters[adapter_index].send(msg).await
    }

    /// Conjunction of all adapter readiness.
    pub fn is_ready(&self) -> bool {
        self.adapters.iter().all(|a| a.is_ready())
    }

    /// A watch over the conjunction readiness, for tasks that must not
    /// keep the subsystem alive while they wait.
    pub(crate) fn ready_watch(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Resolve once every adapter has reported ready.
    pub async fn when_ready(&self) {
        if self.is_ready() {
            return;
        }
        let mut rx = self.ready_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Peers currently routable.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.routes.lock().unwrap().keys().cloned().collect()
    }

    /// Disconnect every adapter. Used on shutdown.
    pub async fn disconnect_all(&self) {
        for adapter in &self.adapters {
            adapter.disconnect().await;
        }
        self.routes.lock().unwrap().clear();
        self.ready_tx.send_replace(false);
    }
}

/// Monotone reordering filter for inbound ephemerals.
///
/// At most one delivery per `(sender, session, count)`, never in
/// decreasing count order.
#[derive(Default)]
struct EphemeralDedupe {
    last_seen: HashMap<(PeerId, String), u32>,
}

impl EphemeralDedupe {
    /// Whether the message may be delivered. Non-ephemerals always pass.
    fn admit(&mut self, msg: &RepoMessage) -> bool {
        let RepoMessage::Ephemeral { sender_id, session_id, count, .. } = msg else {
            return true;
        };
        let key = (sender_id.clone(), session_id.clone());
        match self.last_seen.get(&key) {
            Some(last) if *count <= *last => {
                log::debug!(
                    "dropping ephemeral {count} from {sender_id} (already saw {last})"
                );
                false
            }
            _ => {
                self.last_seen.insert(key, *count);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DocumentId;

    fn ephemeral(sender: &str, session: &str, count: u32) -> RepoMessage {
        RepoMessage::Ephemeral {
            sender_id: PeerId::from(sender),
            target_id: PeerId::from("local"),
            document_id: DocumentId::random(),
            count,
            session_id: session.to_string(),
            data: vec![],
        }
    }

    #[test]
    fn test_dedupe_is_monotone_per_session() {
        let mut dedupe = EphemeralDedupe::default();
        assert!(dedupe.admit(&ephemeral("a", "s1", 3)));
        assert!(!dedupe.admit(&ephemeral("a", "s1", 1)));
        assert!(!dedupe.admit(&ephemeral("a", "s1", 2)));
        assert!(!dedupe.admit(&ephemeral("a", "s1", 3)));
        assert!(dedupe.admit(&ephemeral("a", "s1", 4)));
    }

    #[test]
    fn test_dedupe_sessions_are_independent() {
        let mut dedupe = EphemeralDedupe::default();
        assert!(dedupe.admit(&ephemeral("a", "s1", 5)));
        assert!(dedupe.admit(&ephemeral("a", "s2", 1)));
        assert!(dedupe.admit(&ephemeral("b", "s1", 1)));
    }

    #[test]
    fn test_dedupe_passes_non_ephemeral() {
        let mut dedupe = EphemeralDedupe::default();
        let msg = RepoMessage::DocUnavailable {
            sender_id: PeerId::from("a"),
            target_id: PeerId::from("b"),
            document_id: DocumentId::random(),
        };
        assert!(dedupe.admit(&msg));
        assert!(dedupe.admit(&msg));
    }

    #[tokio::test]
    async fn test_subsystem_with_no_adapters_is_ready() {
        let (network, _events) = NetworkSubsystem::new(
            PeerId::from("local"),
            PeerMetadata::default(),
            Vec::new(),
        )
        .await;
        assert!(network.is_ready());
        network.when_ready().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_dropped() {
        let (network, _events) = NetworkSubsystem::new(
            PeerId::from("local"),
            PeerMetadata::default(),
            Vec::new(),
        )
        .await;
        let result = network
            .send(RepoMessage::DocUnavailable {
                sender_id: PeerId::from("local"),
                target_id: PeerId::from("nowhere"),
                document_id: DocumentId::random(),
            })
            .await;
        assert!(matches!(result, Err(NetworkError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_dedupe_shared_across_adapters() {
        use tokio::time::{timeout, Duration};

        // The same (sender, session, count) arriving over two different
        // transports must still be delivered at most once.
        let (left1, right1) = MemoryNetworkAdapter::pair();
        let (left2, right2) = MemoryNetworkAdapter::pair();
        let (_network, mut events) = NetworkSubsystem::new(
            PeerId::from("local"),
            PeerMetadata::default(),
            vec![
                Arc::new(left1) as Arc<dyn NetworkAdapter>,
                Arc::new(left2) as Arc<dyn NetworkAdapter>,
            ],
        )
        .await;

        let doc = DocumentId::random();
        let ephemeral = |count: u32| RepoMessage::Ephemeral {
            sender_id: PeerId::from("alice"),
            target_id: PeerId::from("local"),
            document_id: doc,
            count,
            session_id: "session-1".into(),
            data: vec![count as u8],
        };

        right1.send(ephemeral(1)).await.unwrap();
        loop {
            match timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap() {
                NetworkEvent::Message(RepoMessage::Ephemeral { count, .. }) => {
                    assert_eq!(count, 1);
                    break;
                }
                _ => {}
            }
        }

        // Duplicate count over the second transport, then a fresh count.
        right2.send(ephemeral(1)).await.unwrap();
        right2.send(ephemeral(2)).await.unwrap();

        loop {
            match timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap() {
                NetworkEvent::Message(RepoMessage::Ephemeral { count, .. }) => {
                    assert_eq!(count, 2, "cross-transport duplicate must be dropped");
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_outbound_ephemeral_counts_increase() {
        let (left, right) = MemoryNetworkAdapter::pair();
        let (network, _events) = NetworkSubsystem::new(
            PeerId::from("local"),
            PeerMetadata::default(),
            vec![Arc::new(left) as Arc<dyn NetworkAdapter>],
        )
        .await;
        let mut remote_events = right.subscribe();
        right
            .connect(PeerId::from("remote"), PeerMetadata::default())
            .await;

        // Wait until the route to "remote" exists.
        for _ in 0..100 {
            if network.connected_peers().iter().any(|p| p.as_str() == "remote") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let doc = DocumentId::random();
        for _ in 0..2 {
            network
                .send(RepoMessage::Ephemeral {
                    sender_id: PeerId::from("ignored"),
                    target_id: PeerId::from("remote"),
                    document_id: doc,
                    count: 0,
                    session_id: String::new(),
                    data: vec![1],
                })
                .await
                .unwrap();
        }

        let mut counts = Vec::new();
        while counts.len() < 2 {
            match remote_events.recv().await.unwrap() {
                AdapterEvent::Message(RepoMessage::Ephemeral { count, sender_id, session_id, .. }) => {
                    assert_eq!(sender_id.as_str(), "local");
                    assert!(!session_id.is_empty());
                    counts.push(count);
                }
                _ => {}
            }
        }
        assert_eq!(counts, vec![1, 2]);
    }
}
