//! The repo: facade wiring handles, storage, network, and synchronizers.
//!
//! One `Repo` per process instance. It owns the handle cache (exactly one
//! handle per document id while cached), debounces document saves and
//! per-backend sync-state saves, and runs the event loop that moves data
//! between the subsystems:
//!
//! ```text
//! handle heads-changed ──► save debounce ──► StorageSubsystem
//! handle change        ──► DocSynchronizer ──► messages ──► Network
//! network messages     ──► CollectionSynchronizer ──► handles
//! sync-state events    ──► sync-state persistence + remote-heads gossip
//! ```
//!
//! Storage and adapter failures are logged and never crash the repo; they
//! only surface to callers that explicitly `flush`.

use automerge::AutoCommit;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::debounce::KeyedDebouncer;
use crate::handle::{DocHandle, HandleError, HandleEvent, HandleOptions, HandleState};
use crate::ids::{DocumentId, InvalidDocumentId, PeerId, PeerMetadata, StorageId};
use crate::network::{NetworkAdapter, NetworkEvent, NetworkSubsystem};
use crate::protocol::{heads_from_wire, heads_to_wire, HeadsAtTime, RepoMessage};
use crate::remote_heads::{RemoteHeadsEvent, RemoteHeadsSubscriptions};
use crate::storage::{StorageAdapter, StorageSubsystem};
use crate::synchronizer::{CollectionSynchronizer, ShareAll, SharePolicy, SyncEvent};

/// Default trailing-edge debounce for document saves.
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Repo construction options.
#[derive(Clone)]
pub struct RepoConfig {
    /// Persistence backend. Without one the repo is memory-only.
    pub storage: Option<Arc<dyn StorageAdapter>>,
    /// Transports to discover peers over.
    pub network: Vec<Arc<dyn NetworkAdapter>>,
    /// The local peer name; minted randomly when absent.
    pub peer_id: Option<PeerId>,
    /// Which documents go to which peers.
    pub share_policy: Arc<dyn SharePolicy>,
    /// Advertised to peers. Defaults to "no storage backend".
    pub is_ephemeral: Option<bool>,
    /// Turn the remote-heads gossip subsystem on.
    pub enable_remote_heads_gossiping: bool,
    /// Trailing-edge debounce for document saves.
    pub save_debounce: Duration,
    /// Trailing-edge debounce for outbound sync messages, per (doc, peer).
    pub sync_debounce: Duration,
    /// How long found-nowhere documents wait before going unavailable.
    pub handle_timeout: Option<Duration>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            storage: None,
            network: Vec::new(),
            peer_id: None,
            share_policy: Arc::new(ShareAll),
            is_ephemeral: None,
            enable_remote_heads_gossiping: false,
            save_debounce: DEFAULT_SAVE_DEBOUNCE,
            sync_debounce: crate::synchronizer::doc::DEFAULT_SYNC_DEBOUNCE,
            handle_timeout: None,
        }
    }
}

impl RepoConfig {
    /// Short debounces so tests settle quickly.
    pub fn for_testing() -> Self {
        Self {
            save_debounce: Duration::from_millis(10),
            sync_debounce: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

/// Failures surfaced by the repo boundary.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("invalid document id: {0}")]
    InvalidDocumentId(#[from] InvalidDocumentId),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error("storage failure: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("source document has no content")]
    EmptySource,
}

type PeerMetadataMap = Arc<Mutex<HashMap<PeerId, PeerMetadata>>>;
type HandleMap = Arc<Mutex<HashMap<DocumentId, DocHandle>>>;

struct RepoInner {
    peer_id: PeerId,
    handles: HandleMap,
    handle_options: HandleOptions,
    doc_events_tx: mpsc::UnboundedSender<(DocumentId, HandleEvent)>,
    storage: Option<Arc<StorageSubsystem>>,
    network: NetworkSubsystem,
    synchronizer: CollectionSynchronizer,
    remote_heads: RemoteHeadsSubscriptions,
    peer_metadata: PeerMetadataMap,
    share_policy: Arc<dyn SharePolicy>,
    save_debouncer: KeyedDebouncer<DocumentId>,
    sync_state_debouncer: KeyedDebouncer<StorageId>,
    /// Latest sync state per backend awaiting its debounced write.
    pending_sync_states: Mutex<HashMap<StorageId, HashMap<DocumentId, automerge::sync::State>>>,
    gossip: bool,
}

/// A client-side coordinator for a library of collaborative documents.
#[derive(Clone)]
pub struct Repo {
    inner: Arc<RepoInner>,
}

impl Repo {
    /// Build a repo: wire the subsystems, connect the adapters, and start
    /// the event loop.
    pub async fn new(config: RepoConfig) -> Result<Self, RepoError> {
        let peer_id = config.peer_id.unwrap_or_else(PeerId::random);
        let storage = config.storage.map(|adapter| Arc::new(StorageSubsystem::new(adapter)));

        let storage_id = match storage.as_ref() {
            Some(subsystem) => Some(subsystem.id().await?),
            None => None,
        };
        let metadata = PeerMetadata {
            storage_id,
            is_ephemeral: config.is_ephemeral.unwrap_or(storage.is_none()),
        };

        let (network, network_rx) =
            NetworkSubsystem::new(peer_id.clone(), metadata, config.network).await;

        let handles: HandleMap = Arc::new(Mutex::new(HashMap::new()));
        let handle_options = HandleOptions { timeout_delay: config.handle_timeout };
        let (doc_events_tx, doc_events_rx) = mpsc::unbounded_channel();
        let peer_metadata: PeerMetadataMap = Arc::new(Mutex::new(HashMap::new()));

        let provider = {
            let handles = handles.clone();
            let options = handle_options.clone();
            let doc_events_tx = doc_events_tx.clone();
            Arc::new(move |id: DocumentId| {
                get_or_create_handle(&handles, &options, &doc_events_tx, id)
            }) as crate::synchronizer::collection::HandleProvider
        };

        let (synchronizer, sync_rx) = CollectionSynchronizer::new(
            peer_id.clone(),
            config.share_policy.clone(),
            storage.clone(),
            peer_metadata.clone(),
            provider,
            config.sync_debounce,
        );
        let (remote_heads, remote_heads_rx) = RemoteHeadsSubscriptions::new();
        let (save_debouncer, save_rx) = KeyedDebouncer::new(config.save_debounce);
        let (sync_state_debouncer, sync_state_rx) = KeyedDebouncer::new(config.save_debounce);

        let inner = Arc::new(RepoInner {
            peer_id,
            handles,
            handle_options,
            doc_events_tx,
            storage,
            network,
            synchronizer,
            remote_heads,
            peer_metadata,
            share_policy: config.share_policy,
            save_debouncer,
            sync_state_debouncer,
            pending_sync_states: Mutex::new(HashMap::new()),
            gossip: config.enable_remote_heads_gossiping,
        });

        spawn_event_loop(
            Arc::downgrade(&inner),
            network_rx,
            sync_rx,
            remote_heads_rx,
            doc_events_rx,
            save_rx,
            sync_state_rx,
        );

        Ok(Self { inner })
    }

    /// The local peer id.
    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    /// The stable id of this repo's storage backend, if it has one.
    pub async fn storage_id(&self) -> Option<StorageId> {
        match self.inner.storage.as_ref() {
            Some(storage) => storage.id().await.ok(),
            None => None,
        }
    }

    /// Document ids currently cached.
    pub fn handles(&self) -> Vec<DocumentId> {
        self.inner.handles.lock().unwrap().keys().copied().collect()
    }

    /// The cached handle for an id, if any.
    pub fn cached_handle(&self, id: &DocumentId) -> Option<DocHandle> {
        self.inner.handles.lock().unwrap().get(id).cloned()
    }

    /// Peers currently known, with their metadata.
    pub fn peers(&self) -> Vec<(PeerId, PeerMetadata)> {
        self.inner
            .peer_metadata
            .lock()
            .unwrap()
            .iter()
            .map(|(peer, metadata)| (peer.clone(), metadata.clone()))
            .collect()
    }

    /// Create a fresh document with a random id. The handle starts READY.
    pub async fn create(&self) -> Result<DocHandle, RepoError> {
        self.create_with(AutoCommit::new()).await
    }

    /// Create a fresh document seeded with `doc`.
    pub async fn create_with(&self, doc: AutoCommit) -> Result<DocHandle, RepoError> {
        let id = DocumentId::random();
        let handle = DocHandle::new_ready(id, doc, self.inner.handle_options.clone());
        self.register_handle(handle.clone());
        self.inner.synchronizer.add_document(handle.clone()).await;
        if self.inner.storage.is_some() {
            self.inner.save_debouncer.schedule(id);
        }
        log::info!("created document {id}");
        Ok(handle)
    }

    /// Import a serialized document as a new document.
    pub async fn import(&self, bytes: &[u8]) -> Result<DocHandle, RepoError> {
        let doc = AutoCommit::load(bytes).map_err(|e| HandleError::Crdt(e.to_string()))?;
        self.create_with(doc).await
    }

    /// Look a document up by URL, base58check string, or legacy UUID.
    pub async fn find(&self, url_or_id: &str) -> Result<DocHandle, RepoError> {
        let id = DocumentId::parse(url_or_id)?;
        Ok(self.find_by_id(id).await)
    }

    /// Look a document up by id: cache hit, else storage, else the network.
    ///
    /// The handle returns immediately; await `handle.doc()` for the value.
    pub async fn find_by_id(&self, id: DocumentId) -> DocHandle {
        if let Some(handle) = self.cached_handle(&id) {
            match handle.state() {
                HandleState::Unavailable => {
                    // Emit on a later turn so the caller can attach
                    // listeners to the returned handle first.
                    let reannounce = handle.clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        reannounce.reannounce_unavailable();
                    });
                }
                HandleState::Unloaded => {
                    handle.reload();
                    // Without a retained document the reload goes back
                    // through storage.
                    if handle.state() == HandleState::Loading {
                        spawn_storage_load(self.inner.clone(), handle.clone());
                    }
                }
                _ => {}
            }
            return handle;
        }

        let handle = get_or_create_handle(
            &self.inner.handles,
            &self.inner.handle_options,
            &self.inner.doc_events_tx,
            id,
        );
        handle.begin_loading();
        self.inner.synchronizer.add_document(handle.clone()).await;
        spawn_storage_load(self.inner.clone(), handle.clone());
        handle
    }

    /// Copy a document's history into a fresh document id.
    pub async fn clone_document(&self, source: &DocHandle) -> Result<DocHandle, RepoError> {
        let mut doc = match source.state() {
            HandleState::Ready => source.clone_doc(),
            HandleState::Unavailable => return Err(HandleError::Unavailable.into()),
            HandleState::Deleted => return Err(HandleError::Deleted.into()),
            other => return Err(HandleError::NotReady(other).into()),
        };
        if doc.get_heads().is_empty() {
            return Err(RepoError::EmptySource);
        }
        let forked = doc.fork();
        self.create_with(forked).await
    }

    /// Delete a document: terminal handle state, cache eviction, storage
    /// removal.
    pub async fn delete(&self, id: DocumentId) -> Result<(), RepoError> {
        let handle = self.inner.handles.lock().unwrap().remove(&id);
        if let Some(handle) = handle {
            handle.delete();
        }
        self.inner.save_debouncer.cancel(&id);
        self.inner.synchronizer.remove_document(id).await;
        self.inner.remote_heads.remove_document(&id);
        if let Some(storage) = self.inner.storage.as_ref() {
            storage.remove_doc(id).await?;
        }
        log::info!("deleted document {id}");
        Ok(())
    }

    /// Await the document and return its full serialized form.
    pub async fn export(&self, id: DocumentId) -> Result<Vec<u8>, RepoError> {
        let handle = self.find_by_id(id).await;
        handle.await_state(&[HandleState::Ready]).await?;
        Ok(handle.save()?)
    }

    /// Force a storage save of the named documents (or all cached ones).
    /// The only path on which storage failures reach the caller.
    pub async fn flush(&self, ids: Option<Vec<DocumentId>>) -> Result<(), RepoError> {
        let Some(storage) = self.inner.storage.as_ref() else {
            return Ok(());
        };
        let ids = ids.unwrap_or_else(|| self.handles());
        for id in ids {
            let Some(handle) = self.cached_handle(&id) else {
                continue;
            };
            if handle.is_deleted() {
                continue;
            }
            self.inner.save_debouncer.cancel(&id);
            let mut doc = handle.clone_doc();
            storage.save_doc(id, &mut doc).await?;
        }
        Ok(())
    }

    /// Evict an idle handle from the cache. Only handles in READY,
    /// UNLOADED, DELETED, or UNAVAILABLE may leave; READY ones are
    /// unloaded first. Anything else warns and stays.
    pub fn remove_from_cache(&self, id: &DocumentId) {
        let Some(handle) = self.cached_handle(id) else {
            return;
        };
        match handle.state() {
            HandleState::Ready => handle.unload(),
            HandleState::Unloaded | HandleState::Deleted | HandleState::Unavailable => {}
            other => {
                log::warn!("not removing {id} from cache in state {other:?}");
                return;
            }
        }
        self.inner.handles.lock().unwrap().remove(id);
    }

    /// Subscribe to heads advertisements for these storage backends.
    pub fn subscribe_to_remotes(&self, remotes: Vec<StorageId>) {
        if self.inner.gossip {
            self.inner.remote_heads.subscribe_to_remotes(remotes);
        }
    }

    /// Disconnect every adapter and flush every handle.
    pub async fn shutdown(&self) -> Result<(), RepoError> {
        self.inner.network.disconnect_all().await;
        let result = self.flush(None).await;
        self.inner.synchronizer.shutdown().await;
        self.inner.save_debouncer.cancel_all();
        self.inner.sync_state_debouncer.cancel_all();
        result
    }

    fn register_handle(&self, handle: DocHandle) {
        let id = handle.document_id();
        let mut handles = self.inner.handles.lock().unwrap();
        debug_assert!(
            !handles.contains_key(&id),
            "one handle per document id per repo"
        );
        spawn_handle_forwarder(&handle, self.inner.doc_events_tx.clone());
        handles.insert(id, handle);
    }
}

/// Cache lookup-or-create, shared by the repo API and the synchronizer's
/// handle provider. New handles start IDLE with a forwarder attached.
fn get_or_create_handle(
    handles: &HandleMap,
    options: &HandleOptions,
    doc_events_tx: &mpsc::UnboundedSender<(DocumentId, HandleEvent)>,
    id: DocumentId,
) -> DocHandle {
    let mut handles = handles.lock().unwrap();
    if let Some(handle) = handles.get(&id) {
        return handle.clone();
    }
    let handle = DocHandle::new(id, options.clone());
    spawn_handle_forwarder(&handle, doc_events_tx.clone());
    handles.insert(id, handle.clone());
    handle
}

/// Resolve a LOADING handle: storage hit makes it READY, a miss hands it
/// to the network as a request once the transports are up. The task holds
/// only the storage subsystem and a readiness watch, never the repo.
fn spawn_storage_load(inner: Arc<RepoInner>, handle: DocHandle) {
    let id = handle.document_id();
    let storage = inner.storage.clone();
    let mut network_ready = inner.network.ready_watch();
    drop(inner);
    tokio::spawn(async move {
        let found = match storage.as_ref() {
            Some(storage) => match storage.load_doc(id).await {
                Ok(found) => found,
                Err(e) => {
                    log::error!("loading {id} from storage: {e}");
                    None
                }
            },
            None => None,
        };
        match found {
            Some(doc) => handle.done_loading(doc),
            None => {
                // Nothing on disk: wait for the transports, then ask.
                if network_ready.wait_for(|ready| *ready).await.is_err() {
                    return;
                }
                handle.request();
            }
        }
    });
}

/// Forward one handle's events into the repo loop, tagged with its id.
fn spawn_handle_forwarder(
    handle: &DocHandle,
    doc_events_tx: mpsc::UnboundedSender<(DocumentId, HandleEvent)>,
) {
    let id = handle.document_id();
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let terminal = matches!(event, HandleEvent::Delete);
                    if doc_events_tx.send((id, event)).is_err() || terminal {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("repo lagged by {n} events from {id}");
                }
                Err(_) => break,
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn spawn_event_loop(
    inner: Weak<RepoInner>,
    mut network_rx: mpsc::UnboundedReceiver<NetworkEvent>,
    mut sync_rx: mpsc::UnboundedReceiver<SyncEvent>,
    mut remote_heads_rx: mpsc::UnboundedReceiver<RemoteHeadsEvent>,
    mut doc_events_rx: mpsc::UnboundedReceiver<(DocumentId, HandleEvent)>,
    mut save_rx: mpsc::UnboundedReceiver<DocumentId>,
    mut sync_state_rx: mpsc::UnboundedReceiver<StorageId>,
) {
    enum LoopEvent {
        Network(NetworkEvent),
        Sync(SyncEvent),
        RemoteHeads(RemoteHeadsEvent),
        Doc(DocumentId, HandleEvent),
        SaveDoc(DocumentId),
        SaveSyncStates(StorageId),
    }

    tokio::spawn(async move {
        loop {
            // Wait without holding the repo alive, so dropping the last
            // `Repo` ends the loop.
            let event = tokio::select! {
                Some(event) = network_rx.recv() => LoopEvent::Network(event),
                Some(event) = sync_rx.recv() => LoopEvent::Sync(event),
                Some(event) = remote_heads_rx.recv() => LoopEvent::RemoteHeads(event),
                Some((id, event)) = doc_events_rx.recv() => LoopEvent::Doc(id, event),
                Some(id) = save_rx.recv() => LoopEvent::SaveDoc(id),
                Some(storage_id) = sync_state_rx.recv() => LoopEvent::SaveSyncStates(storage_id),
                else => break,
            };
            let Some(repo) = inner.upgrade() else { break };
            match event {
                LoopEvent::Network(event) => handle_network_event(&repo, event).await,
                LoopEvent::Sync(event) => handle_sync_event(&repo, event).await,
                LoopEvent::RemoteHeads(event) => handle_remote_heads_event(&repo, event).await,
                LoopEvent::Doc(id, event) => {
                    if matches!(event, HandleEvent::HeadsChanged { .. }) && repo.storage.is_some() {
                        repo.save_debouncer.schedule(id);
                    }
                }
                LoopEvent::SaveDoc(id) => save_document(&repo, id).await,
                LoopEvent::SaveSyncStates(storage_id) => save_sync_states(&repo, storage_id).await,
            }
        }
    });
}

async fn handle_network_event(repo: &Arc<RepoInner>, event: NetworkEvent) {
    match event {
        NetworkEvent::Peer { peer_id, metadata } => {
            log::info!("peer {peer_id} connected");
            repo.peer_metadata
                .lock()
                .unwrap()
                .insert(peer_id.clone(), metadata);
            repo.synchronizer.add_peer(peer_id.clone()).await;
            if repo.gossip && repo.share_policy.should_share(&peer_id, None).await {
                repo.remote_heads.add_generous_peer(peer_id);
            }
        }
        NetworkEvent::PeerLeft { peer_id } => {
            log::info!("peer {peer_id} disconnected");
            repo.peer_metadata.lock().unwrap().remove(&peer_id);
            repo.synchronizer.remove_peer(&peer_id).await;
            repo.remote_heads.remove_peer(&peer_id);
        }
        NetworkEvent::Message(msg) => match msg {
            RepoMessage::RemoteSubscriptionChange { sender_id, add, remove, .. } => {
                if repo.gossip {
                    repo.remote_heads.handle_control_message(sender_id, add, remove);
                }
            }
            RepoMessage::RemoteHeadsChanged { sender_id, document_id, new_heads, .. } => {
                if repo.gossip {
                    receive_remote_heads(repo, sender_id, document_id, new_heads);
                }
            }
            other => repo.synchronizer.receive_message(other).await,
        },
    }
}

fn receive_remote_heads(
    repo: &Arc<RepoInner>,
    sender_id: PeerId,
    document_id: DocumentId,
    new_heads: HashMap<StorageId, HeadsAtTime>,
) {
    let mut decoded = Vec::with_capacity(new_heads.len());
    for (storage_id, entry) in new_heads {
        match heads_from_wire(&entry.heads) {
            Ok(heads) => decoded.push((storage_id, heads, entry.timestamp)),
            Err(e) => log::warn!("rejecting remote heads from {sender_id}: {e}"),
        }
    }
    repo.remote_heads.handle_remote_heads(&sender_id, document_id, decoded);
}

async fn handle_sync_event(repo: &Arc<RepoInner>, event: SyncEvent) {
    match event {
        SyncEvent::Message(msg) => {
            if let Err(e) = repo.network.send(msg).await {
                log::warn!("outbound message dropped: {e}");
            }
        }
        SyncEvent::SyncState { document_id, peer_id, sync_state } => {
            let metadata = repo.peer_metadata.lock().unwrap().get(&peer_id).cloned();
            let Some(metadata) = metadata else { return };
            let Some(storage_id) = metadata.storage_id else { return };

            // Sync states for ephemeral peers are never persisted.
            if !metadata.is_ephemeral && repo.storage.is_some() {
                repo.pending_sync_states
                    .lock()
                    .unwrap()
                    .entry(storage_id.clone())
                    .or_default()
                    .insert(document_id, sync_state.clone());
                repo.sync_state_debouncer.schedule(storage_id.clone());
            }

            if repo.gossip {
                if let Some(their_heads) = sync_state.their_heads {
                    repo.remote_heads.handle_immediate_remote_heads_changed(
                        document_id,
                        storage_id,
                        their_heads,
                    );
                }
            }
        }
        SyncEvent::OpenDoc { document_id, peer_id } => {
            if repo.gossip {
                repo.remote_heads.subscribe_peer_to_doc(peer_id, document_id);
            }
        }
    }
}

async fn handle_remote_heads_event(repo: &Arc<RepoInner>, event: RemoteHeadsEvent) {
    match event {
        RemoteHeadsEvent::NotifyRemoteHeads { peer_id, document_id, storage_id, heads, timestamp } => {
            let mut new_heads = HashMap::new();
            new_heads.insert(storage_id, HeadsAtTime { heads: heads_to_wire(&heads), timestamp });
            let msg = RepoMessage::RemoteHeadsChanged {
                sender_id: repo.peer_id.clone(),
                target_id: peer_id,
                document_id,
                new_heads,
            };
            if let Err(e) = repo.network.send(msg).await {
                log::warn!("remote-heads notification dropped: {e}");
            }
        }
        RemoteHeadsEvent::ChangeRemoteSubs { peers, add, remove } => {
            for peer in peers {
                let msg = RepoMessage::RemoteSubscriptionChange {
                    sender_id: repo.peer_id.clone(),
                    target_id: peer,
                    add: add.clone(),
                    remove: remove.clone(),
                };
                if let Err(e) = repo.network.send(msg).await {
                    log::warn!("subscription change dropped: {e}");
                }
            }
        }
        RemoteHeadsEvent::RemoteHeadsChanged { document_id, storage_id, heads, .. } => {
            let handle = repo.handles.lock().unwrap().get(&document_id).cloned();
            if let Some(handle) = handle {
                handle.set_remote_heads(storage_id, heads);
            }
        }
    }
}

async fn save_document(repo: &Arc<RepoInner>, id: DocumentId) {
    let Some(storage) = repo.storage.as_ref() else { return };
    let handle = repo.handles.lock().unwrap().get(&id).cloned();
    let Some(handle) = handle else { return };
    if handle.is_deleted() {
        return;
    }
    let mut doc = handle.clone_doc();
    if let Err(e) = storage.save_doc(id, &mut doc).await {
        log::error!("saving document {id}: {e}");
    }
}

async fn save_sync_states(repo: &Arc<RepoInner>, storage_id: StorageId) {
    let Some(storage) = repo.storage.as_ref() else { return };
    let pending = repo
        .pending_sync_states
        .lock()
        .unwrap()
        .remove(&storage_id)
        .unwrap_or_default();
    for (document_id, state) in pending {
        if let Err(e) = storage.save_sync_state(document_id, &storage_id, &state).await {
            log::error!("saving sync state for {document_id}/{storage_id}: {e}");
        }
    }
}
