//! Remote-heads gossip: who wants to hear about whose storage.
//!
//! Peers can advertise the heads they have observed on behalf of third
//! party storages, so an ephemeral client can learn how far a server-side
//! backend has caught up without talking to it. This component is the pure
//! in-memory subscription graph behind that: it tracks which peers asked
//! for which storage ids, which documents each peer has open with us, and
//! a last-writer-wins table of `(document, storage) -> (heads, timestamp)`.
//!
//! All state changes come in through plain method calls and all effects
//! leave as `RemoteHeadsEvent`s; the repo turns those into wire messages
//! and handle updates.

use automerge::ChangeHash;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::ids::{DocumentId, PeerId, StorageId};

/// Effects emitted by the subscription graph.
#[derive(Debug, Clone)]
pub enum RemoteHeadsEvent {
    /// Tell one peer about fresh heads for a `(document, storage)` pair.
    NotifyRemoteHeads {
        peer_id: PeerId,
        document_id: DocumentId,
        storage_id: StorageId,
        heads: Vec<ChangeHash>,
        timestamp: i64,
    },
    /// Our subscription set changed; tell these peers the deltas.
    ChangeRemoteSubs {
        peers: Vec<PeerId>,
        add: Vec<StorageId>,
        remove: Vec<StorageId>,
    },
    /// A gossiped advertisement was accepted into the table; the repo
    /// forwards this to the document handle.
    RemoteHeadsChanged {
        document_id: DocumentId,
        storage_id: StorageId,
        heads: Vec<ChangeHash>,
        timestamp: i64,
    },
}

#[derive(Clone)]
struct HeadsEntry {
    heads: Vec<ChangeHash>,
    timestamp: i64,
}

#[derive(Default)]
struct SubscriptionState {
    /// Storage ids we want advertisements for.
    our_subscriptions: FxHashSet<StorageId>,
    /// Storage ids each peer asked us for.
    peer_subscriptions: FxHashMap<PeerId, FxHashSet<StorageId>>,
    /// Peers that get advertisements for every document they share with us.
    generous_peers: FxHashSet<PeerId>,
    /// Documents each peer has open with us.
    open_docs: FxHashMap<PeerId, FxHashSet<DocumentId>>,
    /// Newest observed heads per `(document, storage)`.
    table: FxHashMap<DocumentId, FxHashMap<StorageId, HeadsEntry>>,
}

impl SubscriptionState {
    /// Peers to notify about a `(document, storage)` pair.
    fn subscribers(&self, document_id: &DocumentId, storage_id: &StorageId) -> Vec<PeerId> {
        let mut out: HashSet<&PeerId> = HashSet::new();
        for peer in &self.generous_peers {
            if self.peer_has_doc(peer, document_id) {
                out.insert(peer);
            }
        }
        for (peer, storages) in &self.peer_subscriptions {
            if storages.contains(storage_id) && self.peer_has_doc(peer, document_id) {
                out.insert(peer);
            }
        }
        out.into_iter().cloned().collect()
    }

    fn peer_has_doc(&self, peer: &PeerId, document_id: &DocumentId) -> bool {
        self.open_docs
            .get(peer)
            .map(|docs| docs.contains(document_id))
            .unwrap_or(false)
    }

    /// Accept an entry if it is newer than what we have. Equal or older
    /// timestamps are dropped.
    fn accept(
        &mut self,
        document_id: DocumentId,
        storage_id: StorageId,
        heads: Vec<ChangeHash>,
        timestamp: i64,
    ) -> bool {
        let row = self.table.entry(document_id).or_default();
        match row.get(&storage_id) {
            Some(existing) if existing.timestamp >= timestamp => false,
            _ => {
                row.insert(storage_id, HeadsEntry { heads, timestamp });
                true
            }
        }
    }
}

/// Subscribe/notify graph for heads observed by remote storages.
pub struct RemoteHeadsSubscriptions {
    state: Mutex<SubscriptionState>,
    events: mpsc::UnboundedSender<RemoteHeadsEvent>,
}

impl RemoteHeadsSubscriptions {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteHeadsEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Mutex::new(SubscriptionState::default()),
                events,
            },
            events_rx,
        )
    }

    /// Start listening for advertisements about these storages.
    pub fn subscribe_to_remotes(&self, remotes: Vec<StorageId>) {
        let (added, peers) = {
            let mut state = self.state.lock().unwrap();
            let added: Vec<StorageId> = remotes
                .into_iter()
                .filter(|s| state.our_subscriptions.insert(s.clone()))
                .collect();
            (added, state.generous_peers.iter().cloned().collect::<Vec<_>>())
        };
        if !added.is_empty() && !peers.is_empty() {
            let _ = self.events.send(RemoteHeadsEvent::ChangeRemoteSubs {
                peers,
                add: added,
                remove: Vec::new(),
            });
        }
    }

    /// Stop listening for advertisements about these storages.
    pub fn unsubscribe_from_remotes(&self, remotes: Vec<StorageId>) {
        let (removed, peers) = {
            let mut state = self.state.lock().unwrap();
            let removed: Vec<StorageId> = remotes
                .into_iter()
                .filter(|s| state.our_subscriptions.remove(s))
                .collect();
            (removed, state.generous_peers.iter().cloned().collect::<Vec<_>>())
        };
        if !removed.is_empty() && !peers.is_empty() {
            let _ = self.events.send(RemoteHeadsEvent::ChangeRemoteSubs {
                peers,
                add: Vec::new(),
                remove: removed,
            });
        }
    }

    /// Mark a peer generous: it gets advertisements for every document it
    /// shares with us, and our own subscriptions flow through it.
    pub fn add_generous_peer(&self, peer: PeerId) {
        let subs = {
            let mut state = self.state.lock().unwrap();
            if !state.generous_peers.insert(peer.clone()) {
                return;
            }
            state.our_subscriptions.iter().cloned().collect::<Vec<_>>()
        };
        if !subs.is_empty() {
            let _ = self.events.send(RemoteHeadsEvent::ChangeRemoteSubs {
                peers: vec![peer],
                add: subs,
                remove: Vec::new(),
            });
        }
    }

    /// Forget a peer entirely.
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock().unwrap();
        state.generous_peers.remove(peer);
        state.peer_subscriptions.remove(peer);
        state.open_docs.remove(peer);
    }

    /// Record that a peer has a document open with us. Fed by the
    /// synchronizer's open-doc events.
    pub fn subscribe_peer_to_doc(&self, peer: PeerId, document_id: DocumentId) {
        let catch_up: Vec<(StorageId, HeadsEntry)> = {
            let mut state = self.state.lock().unwrap();
            state.open_docs.entry(peer.clone()).or_default().insert(document_id);
            // Catch the peer up on what we already know for this document.
            let wants_all = state.generous_peers.contains(&peer);
            let asked: Option<&FxHashSet<StorageId>> = state.peer_subscriptions.get(&peer);
            state
                .table
                .get(&document_id)
                .map(|row| {
                    row.iter()
                        .filter(|(storage_id, _)| {
                            wants_all || asked.map(|set| set.contains(*storage_id)).unwrap_or(false)
                        })
                        .map(|(storage_id, entry)| (storage_id.clone(), entry.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        for (storage_id, entry) in catch_up {
            let _ = self.events.send(RemoteHeadsEvent::NotifyRemoteHeads {
                peer_id: peer.clone(),
                document_id,
                storage_id,
                heads: entry.heads,
                timestamp: entry.timestamp,
            });
        }
    }

    /// A peer changed what it wants to hear about.
    pub fn handle_control_message(
        &self,
        peer: PeerId,
        add: Vec<StorageId>,
        remove: Vec<StorageId>,
    ) {
        let mut state = self.state.lock().unwrap();
        let subs = state.peer_subscriptions.entry(peer).or_default();
        for storage_id in add {
            subs.insert(storage_id);
        }
        for storage_id in remove {
            subs.remove(&storage_id);
        }
    }

    /// A peer advertised heads on behalf of one or more storages. Newest
    /// timestamp per `(document, storage)` wins; accepted entries update
    /// the handle and are relayed to our own subscribers (except the
    /// advertiser).
    pub fn handle_remote_heads(
        &self,
        from: &PeerId,
        document_id: DocumentId,
        new_heads: Vec<(StorageId, Vec<ChangeHash>, i64)>,
    ) {
        for (storage_id, heads, timestamp) in new_heads {
            let subscribers = {
                let mut state = self.state.lock().unwrap();
                if !state.accept(document_id, storage_id.clone(), heads.clone(), timestamp) {
                    log::debug!(
                        "dropping stale heads for {document_id}/{storage_id} (ts {timestamp})"
                    );
                    continue;
                }
                state.subscribers(&document_id, &storage_id)
            };

            let _ = self.events.send(RemoteHeadsEvent::RemoteHeadsChanged {
                document_id,
                storage_id: storage_id.clone(),
                heads: heads.clone(),
                timestamp,
            });
            for peer_id in subscribers {
                if peer_id == *from {
                    continue;
                }
                let _ = self.events.send(RemoteHeadsEvent::NotifyRemoteHeads {
                    peer_id,
                    document_id,
                    storage_id: storage_id.clone(),
                    heads: heads.clone(),
                    timestamp,
                });
            }
        }
    }

    /// Our own view of a peer storage's heads moved (observed via sync
    /// state); notify every subscriber of the pair.
    pub fn handle_immediate_remote_heads_changed(
        &self,
        document_id: DocumentId,
        storage_id: StorageId,
        heads: Vec<ChangeHash>,
    ) {
        let timestamp = now_millis();
        let subscribers = {
            let mut state = self.state.lock().unwrap();
            if !state.accept(document_id, storage_id.clone(), heads.clone(), timestamp) {
                return;
            }
            state.subscribers(&document_id, &storage_id)
        };
        for peer_id in subscribers {
            let _ = self.events.send(RemoteHeadsEvent::NotifyRemoteHeads {
                peer_id,
                document_id,
                storage_id: storage_id.clone(),
                heads: heads.clone(),
                timestamp,
            });
        }
    }

    /// Drop a document's row from the table.
    pub fn remove_document(&self, document_id: &DocumentId) {
        self.state.lock().unwrap().table.remove(document_id);
    }

    /// Newest known heads for a `(document, storage)` pair.
    pub fn known_heads(
        &self,
        document_id: &DocumentId,
        storage_id: &StorageId,
    ) -> Option<(Vec<ChangeHash>, i64)> {
        self.state
            .lock()
            .unwrap()
            .table
            .get(document_id)
            .and_then(|row| row.get(storage_id))
            .map(|entry| (entry.heads.clone(), entry.timestamp))
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
