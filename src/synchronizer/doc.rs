//! The per-document sync protocol engine.
//!
//! One synchronizer per document, one `automerge::sync::State` per peer.
//! Outbound sync messages are debounced per peer so bursts of changes
//! collapse into one protocol round; inbound messages that arrive before
//! the handle finished loading are buffered and replayed in arrival order.
//!
//! ```text
//! handle events ──┐
//! inbound msgs  ──┼── DocSynchronizer ──┬── Message (out)
//! new peers     ──┘   (state per peer)  ├── SyncState (persist)
//!                                       └── OpenDoc (gossip setup)
//! ```

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::debounce::KeyedDebouncer;
use crate::handle::{DocHandle, HandleEvent, HandleState};
use crate::ids::{DocumentId, PeerId, PeerMetadata};
use crate::protocol::RepoMessage;
use crate::storage::StorageSubsystem;
use crate::synchronizer::{PeerDocStatus, SyncEvent};

/// Default trailing-edge debounce for outbound sync messages.
pub const DEFAULT_SYNC_DEBOUNCE: Duration = Duration::from_millis(100);

/// States in which the synchronizer may exchange protocol messages.
const SYNCABLE: &[HandleState] = &[
    HandleState::Ready,
    HandleState::Requesting,
    HandleState::Unavailable,
];

struct SyncInner {
    sync_states: FxHashMap<PeerId, automerge::sync::State>,
    peer_doc_status: FxHashMap<PeerId, PeerDocStatus>,
    /// Inbound messages buffered until the handle can process them.
    pending: Vec<RepoMessage>,
    /// Peers we already emitted `OpenDoc` for.
    opened: FxHashSet<PeerId>,
    /// Peers we already told the document is unavailable.
    unavailable_sent: FxHashSet<PeerId>,
    sync_started: bool,
}

struct SyncWorker {
    local_peer: PeerId,
    handle: DocHandle,
    events: mpsc::UnboundedSender<SyncEvent>,
    inner: Mutex<SyncInner>,
    debouncer: KeyedDebouncer<PeerId>,
    storage: Option<Arc<StorageSubsystem>>,
    peer_metadata: Arc<std::sync::Mutex<std::collections::HashMap<PeerId, PeerMetadata>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

/// Sync protocol engine for one document.
#[derive(Clone)]
pub struct DocSynchronizer {
    worker: Arc<SyncWorker>,
}

impl DocSynchronizer {
    pub fn new(
        local_peer: PeerId,
        handle: DocHandle,
        events: mpsc::UnboundedSender<SyncEvent>,
        storage: Option<Arc<StorageSubsystem>>,
        peer_metadata: Arc<std::sync::Mutex<std::collections::HashMap<PeerId, PeerMetadata>>>,
        sync_debounce: Duration,
    ) -> Self {
        let (debouncer, fire_rx) = KeyedDebouncer::new(sync_debounce);
        let (shutdown, _) = tokio::sync::watch::channel(false);
        let worker = Arc::new(SyncWorker {
            local_peer,
            handle,
            events,
            inner: Mutex::new(SyncInner {
                sync_states: FxHashMap::default(),
                peer_doc_status: FxHashMap::default(),
                pending: Vec::new(),
                opened: FxHashSet::default(),
                unavailable_sent: FxHashSet::default(),
                sync_started: false,
            }),
            debouncer,
            storage,
            peer_metadata,
            shutdown,
        });

        let this = Self { worker };
        this.spawn_fire_loop(fire_rx);
        this.spawn_handle_watcher();
        this.spawn_replay_on_load();
        this.spawn_unavailable_announcer();
        this
    }

    pub fn document_id(&self) -> DocumentId {
        self.worker.handle.document_id()
    }

    pub fn handle(&self) -> &DocHandle {
        &self.worker.handle
    }

    /// Whether the synchronizer tracks this peer.
    pub async fn has_peer(&self, peer: &PeerId) -> bool {
        self.worker.inner.lock().await.sync_states.contains_key(peer)
    }

    /// Peers currently tracked.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.worker.inner.lock().await.sync_states.keys().cloned().collect()
    }

    /// Initialize state for any not-yet-known peer and start syncing.
    ///
    /// Peers with a storage id get their persisted sync state as the
    /// starting point; everyone else starts from scratch.
    pub async fn begin_sync(&self, peers: &[PeerId]) {
        for peer in peers {
            let known = {
                let inner = self.worker.inner.lock().await;
                inner.sync_states.contains_key(peer)
            };
            if known {
                continue;
            }

            let initial = self.worker.load_peer_sync_state(peer).await;
            let mut inner = self.worker.inner.lock().await;
            // Re-check: another caller may have raced us past the await.
            if inner.sync_states.contains_key(peer) {
                continue;
            }
            inner.sync_states.insert(peer.clone(), initial);
            inner.peer_doc_status.entry(peer.clone()).or_default();
            inner.sync_started = true;
            drop(inner);

            log::debug!(
                "begin sync of {} with {peer}",
                self.worker.handle.document_id()
            );
            self.worker.debouncer.schedule(peer.clone());
        }
    }

    /// Forget a peer's sync state and status.
    pub async fn end_sync(&self, peer: &PeerId) {
        let mut inner = self.worker.inner.lock().await;
        inner.sync_states.remove(peer);
        inner.peer_doc_status.remove(peer);
        inner.opened.remove(peer);
        inner.unavailable_sent.remove(peer);
        drop(inner);
        self.worker.debouncer.cancel(peer);
    }

    /// Feed one inbound message addressed to this document.
    pub async fn receive_message(&self, msg: RepoMessage) {
        self.worker.receive_message(msg).await;
    }

    /// Stop all timers and background tasks. The synchronizer is unusable
    /// afterwards.
    pub fn shutdown(&self) {
        self.worker.debouncer.cancel_all();
        self.worker.shutdown.send_replace(true);
    }

    fn spawn_fire_loop(&self, mut fire_rx: mpsc::UnboundedReceiver<PeerId>) {
        let worker = self.worker.clone();
        let mut shutdown = self.worker.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let peer = tokio::select! {
                    peer = fire_rx.recv() => match peer {
                        Some(peer) => peer,
                        None => break,
                    },
                    _ = shutdown.wait_for(|stop| *stop) => break,
                };
                // Nothing is sent until the handle can answer for the doc.
                tokio::select! {
                    state = worker.handle.await_state(SYNCABLE) => {
                        if state.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
                worker.send_sync_to(&peer).await;
            }
        });
    }

    /// Local changes and outbound broadcasts re-arm the per-peer debounce.
    fn spawn_handle_watcher(&self) {
        let worker = self.worker.clone();
        let mut events = self.worker.handle.subscribe();
        let mut shutdown = self.worker.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.wait_for(|stop| *stop) => break,
                };
                match event {
                    Ok(HandleEvent::HeadsChanged { .. }) => {
                        worker.schedule_all().await;
                    }
                    Ok(HandleEvent::EphemeralOutbound { data }) => {
                        worker.broadcast_ephemeral(data).await;
                    }
                    Ok(HandleEvent::Delete) => break,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("doc synchronizer lagged by {n} handle events");
                    }
                    Err(_) => break,
                }
            }
        });
    }

    /// Replay messages buffered while the handle was loading.
    fn spawn_replay_on_load(&self) {
        let worker = self.worker.clone();
        let mut shutdown = self.worker.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                state = worker.handle.await_state(SYNCABLE) => {
                    if state.is_err() {
                        return;
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
            let buffered: Vec<RepoMessage> = {
                let mut inner = worker.inner.lock().await;
                std::mem::take(&mut inner.pending)
            };
            for msg in buffered {
                worker.receive_message(msg).await;
            }
        });
    }

    /// Tell waiting peers when the document turns out to be unavailable.
    fn spawn_unavailable_announcer(&self) {
        let worker = self.worker.clone();
        let mut shutdown = self.worker.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    state = worker.handle.await_state(&[HandleState::Unavailable]) => {
                        if state.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
                worker.announce_unavailable().await;
                tokio::select! {
                    state = worker.handle.await_state(&[HandleState::Ready]) => {
                        if state.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
        });
    }
}

impl SyncWorker {
    async fn load_peer_sync_state(&self, peer: &PeerId) -> automerge::sync::State {
        let storage_id = {
            let metadata = self.peer_metadata.lock().unwrap();
            metadata.get(peer).and_then(|m| m.storage_id.clone())
        };
        if let (Some(storage), Some(storage_id)) = (self.storage.as_ref(), storage_id) {
            match storage.load_sync_state(self.handle.document_id(), &storage_id).await {
                Ok(Some(state)) => return state,
                Ok(None) => {}
                Err(e) => log::warn!("loading sync state for {peer}: {e}"),
            }
        }
        automerge::sync::State::new()
    }

    async fn schedule_all(&self) {
        let inner = self.inner.lock().await;
        if !inner.sync_started {
            return;
        }
        for peer in inner.sync_states.keys() {
            self.debouncer.schedule(peer.clone());
        }
    }

    /// Generate and emit the next sync round for one peer, if any.
    async fn send_sync_to(&self, peer: &PeerId) {
        // A handle that gave up with nothing to offer has nothing to sync;
        // waiting peers were told via doc-unavailable.
        if self.handle.state() == HandleState::Unavailable && !self.handle.has_history() {
            return;
        }
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.sync_states.get_mut(peer) else {
            return;
        };
        let Some(data) = self.handle.generate_sync_message(state) else {
            return;
        };
        let document_id = self.handle.document_id();

        // A handle still hunting for its first copy asks; everyone else
        // offers.
        let msg = if self.handle.state() == HandleState::Requesting {
            RepoMessage::Request {
                sender_id: self.local_peer.clone(),
                target_id: peer.clone(),
                document_id,
                data,
            }
        } else {
            RepoMessage::Sync {
                sender_id: self.local_peer.clone(),
                target_id: peer.clone(),
                document_id,
                data,
            }
        };
        let state_snapshot = state.clone();
        drop(inner);

        let _ = self.events.send(SyncEvent::Message(msg));
        let _ = self.events.send(SyncEvent::SyncState {
            document_id,
            peer_id: peer.clone(),
            sync_state: state_snapshot,
        });
    }

    async fn receive_message(&self, msg: RepoMessage) {
        match msg {
            RepoMessage::Sync { .. } | RepoMessage::Request { .. } => {
                self.receive_sync(msg).await;
            }
            RepoMessage::DocUnavailable { sender_id, .. } => {
                self.receive_doc_unavailable(sender_id).await;
            }
            RepoMessage::Ephemeral { sender_id, data, .. } => {
                self.handle.deliver_ephemeral(sender_id, data);
            }
            other => {
                log::warn!(
                    "doc synchronizer ignoring {} message",
                    other.type_name()
                );
            }
        }
    }

    async fn receive_sync(&self, msg: RepoMessage) {
        // Buffer until the handle has decided what it is.
        if matches!(
            self.handle.state(),
            HandleState::Idle | HandleState::Loading | HandleState::Unloaded
        ) {
            self.inner.lock().await.pending.push(msg);
            return;
        }

        // Anything still buffered goes first, in arrival order.
        let backlog: Vec<RepoMessage> = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.pending)
        };
        for buffered in backlog {
            self.apply_sync(buffered).await;
        }
        self.apply_sync(msg).await;
    }

    async fn apply_sync(&self, msg: RepoMessage) {
        let (sender, data, is_request) = match msg {
            RepoMessage::Sync { sender_id, data, .. } => (sender_id, data, false),
            RepoMessage::Request { sender_id, data, .. } => (sender_id, data, true),
            _ => return,
        };

        // A request from a peer that lacks the doc, hitting us while we
        // lack it too: remember they want it and, if we have already given
        // up, say so once.
        let we_lack_content = !self.handle.has_history()
            && matches!(
                self.handle.state(),
                HandleState::Requesting | HandleState::Unavailable
            );
        if is_request && we_lack_content {
            let mut inner = self.inner.lock().await;
            inner.peer_doc_status.insert(sender.clone(), PeerDocStatus::Wants);
            inner
                .sync_states
                .entry(sender.clone())
                .or_insert_with(automerge::sync::State::new);
            let announce = self.handle.state() == HandleState::Unavailable
                && inner.unavailable_sent.insert(sender.clone());
            drop(inner);
            if announce {
                self.send_doc_unavailable(&sender).await;
            }
            // Still run the protocol round: their message carries their
            // have-state, ours will carry our (empty) one.
        }

        let mut inner = self.inner.lock().await;
        let state = inner
            .sync_states
            .entry(sender.clone())
            .or_insert_with(automerge::sync::State::new);
        let changed = match self.handle.receive_sync_message(state, &data) {
            Ok(changed) => changed,
            Err(e) => {
                log::error!(
                    "applying sync message from {sender} to {}: {e}",
                    self.handle.document_id()
                );
                return;
            }
        };
        let state_snapshot = state.clone();
        if !(is_request && we_lack_content) {
            inner.peer_doc_status.insert(sender.clone(), PeerDocStatus::Has);
        }
        inner.sync_started = true;
        let first_exchange = inner.opened.insert(sender.clone());
        let reply_peers: Vec<PeerId> = if changed {
            inner.sync_states.keys().cloned().collect()
        } else {
            vec![sender.clone()]
        };
        drop(inner);

        // A requesting or given-up handle that just received content has
        // found its document.
        if self.handle.has_history()
            && matches!(
                self.handle.state(),
                HandleState::Requesting | HandleState::Unavailable
            )
        {
            self.handle.mark_ready();
        }

        let document_id = self.handle.document_id();
        if first_exchange {
            let _ = self.events.send(SyncEvent::OpenDoc {
                document_id,
                peer_id: sender.clone(),
            });
        }
        let _ = self.events.send(SyncEvent::SyncState {
            document_id,
            peer_id: sender,
            sync_state: state_snapshot,
        });

        for peer in reply_peers {
            self.debouncer.schedule(peer);
        }
    }

    async fn receive_doc_unavailable(&self, sender: PeerId) {
        let all_unavailable = {
            let mut inner = self.inner.lock().await;
            inner
                .peer_doc_status
                .insert(sender.clone(), PeerDocStatus::Unavailable);
            !inner.sync_states.is_empty()
                && inner.sync_states.keys().all(|peer| {
                    inner.peer_doc_status.get(peer) == Some(&PeerDocStatus::Unavailable)
                })
        };
        log::debug!(
            "{sender} reports {} unavailable",
            self.handle.document_id()
        );
        if all_unavailable && self.handle.state() == HandleState::Requesting {
            self.handle.unavailable();
        }
    }

    async fn announce_unavailable(&self) {
        let waiting: Vec<PeerId> = {
            let mut inner = self.inner.lock().await;
            let waiting: Vec<PeerId> = inner
                .peer_doc_status
                .iter()
                .filter(|(_, status)| **status == PeerDocStatus::Wants)
                .map(|(peer, _)| peer.clone())
                .collect();
            waiting
                .into_iter()
                .filter(|peer| inner.unavailable_sent.insert(peer.clone()))
                .collect()
        };
        for peer in waiting {
            self.send_doc_unavailable(&peer).await;
        }
    }

    async fn send_doc_unavailable(&self, peer: &PeerId) {
        let _ = self.events.send(SyncEvent::Message(RepoMessage::DocUnavailable {
            sender_id: self.local_peer.clone(),
            target_id: peer.clone(),
            document_id: self.handle.document_id(),
        }));
    }

    /// Fan a local broadcast out to every tracked peer. Counting and
    /// session stamping happen in the network subsystem.
    async fn broadcast_ephemeral(&self, data: Vec<u8>) {
        let peers: Vec<PeerId> = {
            let inner = self.inner.lock().await;
            inner.sync_states.keys().cloned().collect()
        };
        let document_id = self.handle.document_id();
        for peer in peers {
            let _ = self.events.send(SyncEvent::Message(RepoMessage::Ephemeral {
                sender_id: self.local_peer.clone(),
                target_id: peer,
                document_id,
                count: 0,
                session_id: String::new(),
                data: data.clone(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleOptions;
    use automerge::transaction::Transactable;
    use automerge::{AutoCommit, ROOT};
    use std::collections::HashMap;
    use tokio::time::{timeout, Duration};

    fn metadata_map() -> Arc<std::sync::Mutex<HashMap<PeerId, PeerMetadata>>> {
        Arc::new(std::sync::Mutex::new(HashMap::new()))
    }

    fn synchronizer_for(
        handle: DocHandle,
    ) -> (DocSynchronizer, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sync = DocSynchronizer::new(
            PeerId::from("local"),
            handle,
            tx,
            None,
            metadata_map(),
            Duration::from_millis(10),
        );
        (sync, rx)
    }

    fn ready_handle_with_content() -> DocHandle {
        let mut doc = AutoCommit::new();
        doc.put(ROOT, "seed", 1).unwrap();
        doc.commit();
        DocHandle::new_ready(DocumentId::random(), doc, HandleOptions::default())
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> SyncEvent {
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_begin_sync_emits_a_sync_message() {
        let handle = ready_handle_with_content();
        let (sync, mut rx) = synchronizer_for(handle);
        sync.begin_sync(&[PeerId::from("bob")]).await;
        assert!(sync.has_peer(&PeerId::from("bob")).await);

        loop {
            match next_event(&mut rx).await {
                SyncEvent::Message(RepoMessage::Sync { target_id, .. }) => {
                    assert_eq!(target_id.as_str(), "bob");
                    break;
                }
                SyncEvent::Message(other) => panic!("unexpected {}", other.type_name()),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_requesting_handle_sends_request() {
        let handle = DocHandle::new(DocumentId::random(), HandleOptions::default());
        handle.begin_loading();
        handle.request();
        let (sync, mut rx) = synchronizer_for(handle);
        sync.begin_sync(&[PeerId::from("bob")]).await;

        loop {
            match next_event(&mut rx).await {
                SyncEvent::Message(msg) => {
                    assert_eq!(msg.type_name(), "request");
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_two_synchronizers_converge() {
        let doc_id = DocumentId::random();
        let alice_handle = ready_handle_with_content();
        let bob_handle = DocHandle::new(doc_id, HandleOptions::default());
        bob_handle.begin_loading();
        bob_handle.request();

        let (alice, mut alice_rx) = synchronizer_for(alice_handle.clone());
        let (bob, mut bob_rx) = synchronizer_for(bob_handle.clone());
        alice.begin_sync(&[PeerId::from("local")]).await;
        bob.begin_sync(&[PeerId::from("local")]).await;

        // Pump messages between the two synchronizers until bob is ready.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !bob_handle.is_ready() && tokio::time::Instant::now() < deadline {
            tokio::select! {
                Some(event) = alice_rx.recv() => {
                    if let SyncEvent::Message(msg) = event {
                        bob.receive_message(msg).await;
                    }
                }
                Some(event) = bob_rx.recv() => {
                    if let SyncEvent::Message(msg) = event {
                        alice.receive_message(msg).await;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }

        assert!(bob_handle.is_ready());
        assert_eq!(bob_handle.heads().unwrap(), alice_handle.heads().unwrap());
    }

    #[tokio::test]
    async fn test_messages_buffered_while_loading() {
        let handle = DocHandle::new(DocumentId::random(), HandleOptions::default());
        handle.begin_loading();
        let (sync, mut rx) = synchronizer_for(handle.clone());

        // A sync message arriving mid-load is buffered, not dropped.
        let source = ready_handle_with_content();
        let mut their_state = automerge::sync::State::new();
        let data = source.generate_sync_message(&mut their_state).unwrap();
        sync.receive_message(RepoMessage::Sync {
            sender_id: PeerId::from("bob"),
            target_id: PeerId::from("local"),
            document_id: handle.document_id(),
            data,
        })
        .await;

        // No SyncState event while buffered.
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        // Once loading finishes the buffer replays.
        handle.done_loading(AutoCommit::new());
        loop {
            match next_event(&mut rx).await {
                SyncEvent::SyncState { peer_id, .. } => {
                    assert_eq!(peer_id.as_str(), "bob");
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_all_peers_unavailable_gives_up() {
        let handle = DocHandle::new(DocumentId::random(), HandleOptions::default());
        handle.begin_loading();
        handle.request();
        let (sync, _rx) = synchronizer_for(handle.clone());
        sync.begin_sync(&[PeerId::from("bob"), PeerId::from("carol")]).await;

        sync.receive_message(RepoMessage::DocUnavailable {
            sender_id: PeerId::from("bob"),
            target_id: PeerId::from("local"),
            document_id: handle.document_id(),
        })
        .await;
        assert!(!handle.is_unavailable(), "one of two peers is not enough");

        sync.receive_message(RepoMessage::DocUnavailable {
            sender_id: PeerId::from("carol"),
            target_id: PeerId::from("local"),
            document_id: handle.document_id(),
        })
        .await;

        timeout(
            Duration::from_secs(1),
            handle.await_state(&[HandleState::Unavailable]),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_forwarded_to_handle() {
        let handle = ready_handle_with_content();
        let mut handle_events = handle.subscribe();
        let (sync, _rx) = synchronizer_for(handle.clone());

        sync.receive_message(RepoMessage::Ephemeral {
            sender_id: PeerId::from("bob"),
            target_id: PeerId::from("local"),
            document_id: handle.document_id(),
            count: 1,
            session_id: "s".into(),
            data: vec![4, 5, 6],
        })
        .await;

        match timeout(Duration::from_secs(1), handle_events.recv()).await.unwrap().unwrap() {
            HandleEvent::EphemeralMessage { sender_id, data } => {
                assert_eq!(sender_id.as_str(), "bob");
                assert_eq!(data, vec![4, 5, 6]);
            }
            other => panic!("expected EphemeralMessage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_to_peers() {
        let handle = ready_handle_with_content();
        let (sync, mut rx) = synchronizer_for(handle.clone());
        sync.begin_sync(&[PeerId::from("bob"), PeerId::from("carol")]).await;

        handle.broadcast(vec![7]).unwrap();

        let mut targets = Vec::new();
        while targets.len() < 2 {
            match next_event(&mut rx).await {
                SyncEvent::Message(RepoMessage::Ephemeral { target_id, data, .. }) => {
                    assert_eq!(data, vec![7]);
                    targets.push(target_id.as_str().to_string());
                }
                _ => {}
            }
        }
        targets.sort();
        assert_eq!(targets, vec!["bob", "carol"]);
    }

    #[tokio::test]
    async fn test_end_sync_forgets_peer() {
        let handle = ready_handle_with_content();
        let (sync, _rx) = synchronizer_for(handle);
        let bob = PeerId::from("bob");
        sync.begin_sync(std::slice::from_ref(&bob)).await;
        assert!(sync.has_peer(&bob).await);
        sync.end_sync(&bob).await;
        assert!(!sync.has_peer(&bob).await);
    }

    #[tokio::test]
    async fn test_unavailable_reply_to_request_for_missing_doc() {
        let handle = DocHandle::new(
            DocumentId::random(),
            HandleOptions { timeout_delay: Some(Duration::from_millis(20)) },
        );
        handle.begin_loading();
        handle.request();
        let (sync, mut rx) = synchronizer_for(handle.clone());

        // Bob asks us for a document neither of us has.
        let mut bob_probe = AutoCommit::new();
        let mut bob_state = automerge::sync::State::new();
        use automerge::sync::SyncDoc;
        let data = bob_probe
            .sync()
            .generate_sync_message(&mut bob_state)
            .map(|m| m.encode())
            .unwrap();
        sync.receive_message(RepoMessage::Request {
            sender_id: PeerId::from("bob"),
            target_id: PeerId::from("local"),
            document_id: handle.document_id(),
            data,
        })
        .await;

        // After the timeout flips us to unavailable, bob hears about it
        // exactly once.
        let mut unavailable_count = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while tokio::time::Instant::now() < deadline {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(SyncEvent::Message(RepoMessage::DocUnavailable { target_id, .. }))) => {
                    assert_eq!(target_id.as_str(), "bob");
                    unavailable_count += 1;
                }
                Ok(Some(_)) => {}
                _ => {}
            }
        }
        assert_eq!(unavailable_count, 1);
    }
}
