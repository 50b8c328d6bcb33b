//! Collection-wide synchronization: peers × documents.
//!
//! Owns every `DocSynchronizer`, fans peer arrivals and document arrivals
//! into them, and gates each (peer, document) pair through the share
//! policy. The policy is consulted on every path that could introduce a
//! pair (new peer, new document, inbound message) and its answers are
//! never cached.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::handle::{DocHandle, HandleState};
use crate::ids::{DocumentId, PeerId, PeerMetadata};
use crate::protocol::RepoMessage;
use crate::storage::StorageSubsystem;
use crate::synchronizer::{DocSynchronizer, SyncEvent};

/// Decides which documents are announced to which peers.
///
/// Called from multiple paths, possibly concurrently for the same pair;
/// implementations should be pure with respect to their arguments.
#[async_trait]
pub trait SharePolicy: Send + Sync {
    /// Whether `document_id` (or, when `None`, documents in general)
    /// should be shared with `peer_id`.
    async fn should_share(&self, peer_id: &PeerId, document_id: Option<&DocumentId>) -> bool;
}

/// The default policy: share everything with everyone.
pub struct ShareAll;

#[async_trait]
impl SharePolicy for ShareAll {
    async fn should_share(&self, _peer_id: &PeerId, _document_id: Option<&DocumentId>) -> bool {
        true
    }
}

/// Obtains (creating if necessary) the repo's handle for a document id.
/// Inbound messages referencing unknown documents go through this.
pub type HandleProvider = Arc<dyn Fn(DocumentId) -> DocHandle + Send + Sync>;

struct CollectionState {
    peers: HashSet<PeerId>,
    doc_synchronizers: HashMap<DocumentId, DocSynchronizer>,
    /// Dedupe flag so a document is only set up once.
    doc_set_up: HashMap<DocumentId, bool>,
}

/// Routes peer and document events into per-document synchronizers.
pub struct CollectionSynchronizer {
    local_peer: PeerId,
    share_policy: Arc<dyn SharePolicy>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    storage: Option<Arc<StorageSubsystem>>,
    peer_metadata: Arc<std::sync::Mutex<HashMap<PeerId, PeerMetadata>>>,
    handle_provider: HandleProvider,
    sync_debounce: Duration,
    state: Mutex<CollectionState>,
}

impl CollectionSynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        share_policy: Arc<dyn SharePolicy>,
        storage: Option<Arc<StorageSubsystem>>,
        peer_metadata: Arc<std::sync::Mutex<HashMap<PeerId, PeerMetadata>>>,
        handle_provider: HandleProvider,
        sync_debounce: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                local_peer,
                share_policy,
                events_tx,
                storage,
                peer_metadata,
                handle_provider,
                sync_debounce,
                state: Mutex::new(CollectionState {
                    peers: HashSet::new(),
                    doc_synchronizers: HashMap::new(),
                    doc_set_up: HashMap::new(),
                }),
            },
            events_rx,
        )
    }

    /// Register a peer and start syncing every shared document with it.
    /// Idempotent.
    pub async fn add_peer(&self, peer: PeerId) {
        let synchronizers: Vec<(DocumentId, DocSynchronizer)> = {
            let mut state = self.state.lock().await;
            if !state.peers.insert(peer.clone()) {
                return;
            }
            state
                .doc_synchronizers
                .iter()
                .map(|(id, sync)| (*id, sync.clone()))
                .collect()
        };

        log::debug!("peer {peer} joined, checking {} documents", synchronizers.len());
        for (document_id, sync) in synchronizers {
            if self.share_policy.should_share(&peer, Some(&document_id)).await {
                sync.begin_sync(std::slice::from_ref(&peer)).await;
            }
        }
    }

    /// Drop a peer from every synchronizer.
    pub async fn remove_peer(&self, peer: &PeerId) {
        let synchronizers: Vec<DocSynchronizer> = {
            let mut state = self.state.lock().await;
            state.peers.remove(peer);
            state.doc_synchronizers.values().cloned().collect()
        };
        for sync in synchronizers {
            sync.end_sync(peer).await;
        }
    }

    /// Register a document and start syncing it with every generous peer.
    /// Idempotent via the set-up flag.
    pub async fn add_document(&self, handle: DocHandle) {
        let document_id = handle.document_id();
        let (sync, peers) = {
            let mut state = self.state.lock().await;
            if state.doc_set_up.get(&document_id).copied().unwrap_or(false) {
                return;
            }
            state.doc_set_up.insert(document_id, true);
            let sync = self.make_synchronizer(handle);
            state.doc_synchronizers.insert(document_id, sync.clone());
            (sync, state.peers.iter().cloned().collect::<Vec<_>>())
        };

        for peer in peers {
            if self.share_policy.should_share(&peer, Some(&document_id)).await {
                sync.begin_sync(std::slice::from_ref(&peer)).await;
            }
        }
    }

    /// Drop a document's synchronizer; pending outbound messages die with
    /// its timers. Peers are not told.
    pub async fn remove_document(&self, document_id: DocumentId) {
        let removed = {
            let mut state = self.state.lock().await;
            state.doc_set_up.remove(&document_id);
            state.doc_synchronizers.remove(&document_id)
        };
        if let Some(sync) = removed {
            sync.shutdown();
        }
    }

    /// Feed an inbound message to its document's synchronizer, creating
    /// handle and synchronizer for first-seen documents, then catch up any
    /// generous peers the synchronizer does not know yet.
    pub async fn receive_message(&self, msg: RepoMessage) {
        let Some(document_id) = msg.document_id().copied() else {
            log::warn!("collection synchronizer got {} message", msg.type_name());
            return;
        };

        let sync = self.ensure_synchronizer(document_id).await;
        sync.receive_message(msg).await;

        let peers: Vec<PeerId> = {
            let state = self.state.lock().await;
            state.peers.iter().cloned().collect()
        };
        for peer in peers {
            if !sync.has_peer(&peer).await
                && self.share_policy.should_share(&peer, Some(&document_id)).await
            {
                sync.begin_sync(std::slice::from_ref(&peer)).await;
            }
        }
    }

    /// The synchronizer for a document, if one exists.
    pub async fn synchronizer(&self, document_id: &DocumentId) -> Option<DocSynchronizer> {
        self.state.lock().await.doc_synchronizers.get(document_id).cloned()
    }

    /// Currently registered peers.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.state.lock().await.peers.iter().cloned().collect()
    }

    /// Shut down every synchronizer. Used on repo shutdown.
    pub async fn shutdown(&self) {
        let state = self.state.lock().await;
        for sync in state.doc_synchronizers.values() {
            sync.shutdown();
        }
    }

    async fn ensure_synchronizer(&self, document_id: DocumentId) -> DocSynchronizer {
        {
            let state = self.state.lock().await;
            if let Some(sync) = state.doc_synchronizers.get(&document_id) {
                return sync.clone();
            }
        }

        let handle = (self.handle_provider)(document_id);
        // A handle minted for an inbound message has not been through
        // find(): it goes straight to asking the network.
        if handle.state() == HandleState::Idle {
            handle.request();
        }

        let mut state = self.state.lock().await;
        // Double-check after the await-free gap above.
        if let Some(sync) = state.doc_synchronizers.get(&document_id) {
            return sync.clone();
        }
        state.doc_set_up.insert(document_id, true);
        let sync = self.make_synchronizer(handle);
        state.doc_synchronizers.insert(document_id, sync.clone());
        sync
    }

    fn make_synchronizer(&self, handle: DocHandle) -> DocSynchronizer {
        DocSynchronizer::new(
            self.local_peer.clone(),
            handle,
            self.events_tx.clone(),
            self.storage.clone(),
            self.peer_metadata.clone(),
            self.sync_debounce,
        )
    }
}
