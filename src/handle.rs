//! Per-document handle: state machine and event hub.
//!
//! A `DocHandle` is the only way to read or mutate a document. Every access
//! is gated by the handle state:
//!
//! ```text
//! IDLE        --create-->  READY          local create with initial value
//! IDLE        --load--->   LOADING
//! LOADING     --found-->   READY
//! LOADING     --missing--> REQUESTING
//! REQUESTING  --peer-has-> READY
//! REQUESTING  --timeout--> UNAVAILABLE
//! READY|UNAVAILABLE --unload--> UNLOADED
//! UNLOADED    --reload-->  READY (doc retained) or LOADING
//! any         --delete-->  DELETED        terminal
//! UNAVAILABLE --peer-offers-doc--> READY
//! ```
//!
//! Observers subscribe to a broadcast event bus; state waiting is a watch
//! channel, so `doc()` and friends are a state-matcher over the handle's
//! state stream. Mutators are event-atomic: the heads carried by a
//! `HeadsChanged` event equal the document's heads at the moment it fired.

use automerge::{AutoCommit, ChangeHash, Patch};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::ids::{DocumentId, PeerId, StorageId};

/// Capacity of the per-handle event bus.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    Idle,
    Loading,
    Requesting,
    Ready,
    Unloaded,
    Deleted,
    Unavailable,
}

/// Events emitted by a handle.
#[derive(Debug, Clone)]
pub enum HandleEvent {
    /// The document changed (local mutation or applied remote sync).
    Change { heads: Vec<ChangeHash> },
    /// The document's heads moved. Fires iff the heads actually differ.
    HeadsChanged { heads: Vec<ChangeHash> },
    /// The handle was deleted.
    Delete,
    /// No peer could provide the document.
    Unavailable,
    /// An inbound ephemeral broadcast addressed to this document.
    EphemeralMessage { sender_id: PeerId, data: Vec<u8> },
    /// A local `broadcast()` call to be fanned out by the synchronizer.
    EphemeralOutbound { data: Vec<u8> },
    /// Heads observed on behalf of a remote storage changed.
    RemoteHeads { storage_id: StorageId, heads: Vec<ChangeHash> },
}

/// Handle construction options.
#[derive(Debug, Clone, Default)]
pub struct HandleOptions {
    /// How long a REQUESTING handle waits before giving up as UNAVAILABLE.
    pub timeout_delay: Option<Duration>,
}

/// Handle operation failures.
#[derive(Debug, Clone)]
pub enum HandleError {
    /// A mutator or accessor needed READY but the handle was elsewhere.
    NotReady(HandleState),
    /// The handle is DELETED; only inspection is permitted.
    Deleted,
    /// The counterpart of a merge or clone is UNAVAILABLE.
    Unavailable,
    /// The CRDT engine rejected an operation.
    Crdt(String),
}

impl std::fmt::Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady(state) => write!(f, "handle is not ready (state {state:?})"),
            Self::Deleted => write!(f, "handle is deleted"),
            Self::Unavailable => write!(f, "document is unavailable"),
            Self::Crdt(e) => write!(f, "crdt error: {e}"),
        }
    }
}

impl std::error::Error for HandleError {}

impl From<automerge::AutomergeError> for HandleError {
    fn from(e: automerge::AutomergeError) -> Self {
        Self::Crdt(e.to_string())
    }
}

struct HandleCore {
    state: HandleState,
    /// The document always exists internally; the state decides whether it
    /// is observable. During REQUESTING it is the empty doc sync runs from.
    doc: AutoCommit,
    last_heads: Vec<ChangeHash>,
    remote_heads: HashMap<StorageId, Vec<ChangeHash>>,
}

struct HandleInner {
    document_id: DocumentId,
    timeout_delay: Option<Duration>,
    core: Mutex<HandleCore>,
    state_tx: watch::Sender<HandleState>,
    events: broadcast::Sender<HandleEvent>,
}

impl HandleInner {
    fn emit(&self, event: HandleEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.events.send(event);
    }

    fn set_state(&self, core: &mut HandleCore, state: HandleState) {
        core.state = state;
        self.state_tx.send_replace(state);
    }

    /// Recompute heads after a mutation and emit change events if they moved.
    fn note_heads(&self, core: &mut HandleCore) -> Vec<ChangeHash> {
        let heads = core.doc.get_heads();
        if heads != core.last_heads {
            core.last_heads = heads.clone();
            self.emit(HandleEvent::Change { heads: heads.clone() });
            self.emit(HandleEvent::HeadsChanged { heads: heads.clone() });
        }
        heads
    }

    fn mark_unavailable(&self) {
        let mut core = self.core.lock().unwrap();
        if core.state != HandleState::Requesting {
            return;
        }
        self.set_state(&mut core, HandleState::Unavailable);
        drop(core);
        self.emit(HandleEvent::Unavailable);
    }
}

/// A cheap clone-able reference to one document's state machine.
///
/// Exactly one logical handle exists per document id per repo while cached;
/// clones share state and behave like borrows of the cached entry.
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<HandleInner>,
}

impl DocHandle {
    /// A handle in IDLE, about to be loaded or requested.
    pub fn new(document_id: DocumentId, options: HandleOptions) -> Self {
        Self::build(document_id, AutoCommit::new(), HandleState::Idle, options)
    }

    /// A handle born READY from a locally created document.
    pub fn new_ready(document_id: DocumentId, doc: AutoCommit, options: HandleOptions) -> Self {
        Self::build(document_id, doc, HandleState::Ready, options)
    }

    fn build(
        document_id: DocumentId,
        mut doc: AutoCommit,
        state: HandleState,
        options: HandleOptions,
    ) -> Self {
        let last_heads = doc.get_heads();
        let (state_tx, _) = watch::channel(state);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HandleInner {
                document_id,
                timeout_delay: options.timeout_delay,
                core: Mutex::new(HandleCore {
                    state,
                    doc,
                    last_heads,
                    remote_heads: HashMap::new(),
                }),
                state_tx,
                events,
            }),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.inner.document_id
    }

    /// The document URL, `automerge:<base58check>`.
    pub fn url(&self) -> String {
        self.inner.document_id.to_url()
    }

    pub fn state(&self) -> HandleState {
        self.inner.core.lock().unwrap().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == HandleState::Ready
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == HandleState::Deleted
    }

    pub fn is_unavailable(&self) -> bool {
        self.state() == HandleState::Unavailable
    }

    /// Subscribe to the handle's event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the state enters one of `states`.
    ///
    /// Errors once DELETED is reached (unless DELETED is awaited), so
    /// waiters never leak on terminal handles.
    pub async fn await_state(&self, states: &[HandleState]) -> Result<HandleState, HandleError> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if states.contains(&current) {
                return Ok(current);
            }
            if current == HandleState::Deleted {
                return Err(HandleError::Deleted);
            }
            if rx.changed().await.is_err() {
                return Err(HandleError::Deleted);
            }
        }
    }

    /// Wait for READY, then return a snapshot clone of the document.
    pub async fn doc(&self) -> Result<AutoCommit, HandleError> {
        self.doc_when(&[HandleState::Ready]).await
    }

    /// Wait for any of `states`, then return a snapshot clone.
    pub async fn doc_when(&self, states: &[HandleState]) -> Result<AutoCommit, HandleError> {
        self.await_state(states).await?;
        Ok(self.inner.core.lock().unwrap().doc.clone())
    }

    /// Synchronous document snapshot; `None` unless READY.
    pub fn doc_sync(&self) -> Option<AutoCommit> {
        let core = self.inner.core.lock().unwrap();
        (core.state == HandleState::Ready).then(|| core.doc.clone())
    }

    /// Run a read-only closure against the document. Requires READY.
    pub fn with_doc<R>(&self, f: impl FnOnce(&AutoCommit) -> R) -> Result<R, HandleError> {
        let core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready => Ok(f(&core.doc)),
            HandleState::Deleted => Err(HandleError::Deleted),
            other => Err(HandleError::NotReady(other)),
        }
    }

    /// Current heads. Requires READY.
    pub fn heads(&self) -> Result<Vec<ChangeHash>, HandleError> {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready => Ok(core.doc.get_heads()),
            HandleState::Deleted => Err(HandleError::Deleted),
            other => Err(HandleError::NotReady(other)),
        }
    }

    /// Run a mutator, commit one change, and emit `Change` then
    /// `HeadsChanged` if the heads moved. Requires READY.
    pub fn change<F>(&self, f: F) -> Result<Vec<ChangeHash>, HandleError>
    where
        F: FnOnce(&mut AutoCommit),
    {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready => {}
            HandleState::Deleted => return Err(HandleError::Deleted),
            other => return Err(HandleError::NotReady(other)),
        }
        f(&mut core.doc);
        core.doc.commit();
        Ok(self.inner.note_heads(&mut core))
    }

    /// As `change`, but commits as if the document were at `heads`.
    /// Returns the resulting (possibly concurrent) heads.
    pub fn change_at<F>(&self, heads: &[ChangeHash], f: F) -> Result<Vec<ChangeHash>, HandleError>
    where
        F: FnOnce(&mut AutoCommit),
    {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready => {}
            HandleState::Deleted => return Err(HandleError::Deleted),
            other => return Err(HandleError::NotReady(other)),
        }
        core.doc.isolate(heads);
        f(&mut core.doc);
        core.doc.commit();
        core.doc.integrate();
        Ok(self.inner.note_heads(&mut core))
    }

    /// A read-only view of the document at some past heads. Requires READY.
    pub fn view(&self, heads: &[ChangeHash]) -> Result<AutoCommit, HandleError> {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready => Ok(core.doc.fork_at(heads)?),
            HandleState::Deleted => Err(HandleError::Deleted),
            other => Err(HandleError::NotReady(other)),
        }
    }

    /// The patches that move the document from `from` to `to` (current
    /// heads when `to` is `None`). Requires READY.
    pub fn diff(
        &self,
        from: &[ChangeHash],
        to: Option<&[ChangeHash]>,
    ) -> Result<Vec<Patch>, HandleError> {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready => {}
            HandleState::Deleted => return Err(HandleError::Deleted),
            other => return Err(HandleError::NotReady(other)),
        }
        let to = match to {
            Some(heads) => heads.to_vec(),
            None => core.doc.get_heads(),
        };
        Ok(core.doc.diff(from, &to))
    }

    /// Merge another handle's document into this one. Both must be READY.
    pub fn merge(&self, other: &DocHandle) -> Result<Vec<ChangeHash>, HandleError> {
        let mut other_doc = match other.state() {
            HandleState::Ready => other.inner.core.lock().unwrap().doc.clone(),
            HandleState::Unavailable => return Err(HandleError::Unavailable),
            HandleState::Deleted => return Err(HandleError::Deleted),
            other_state => return Err(HandleError::NotReady(other_state)),
        };
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready => {}
            HandleState::Deleted => return Err(HandleError::Deleted),
            other_state => return Err(HandleError::NotReady(other_state)),
        }
        core.doc.merge(&mut other_doc)?;
        Ok(self.inner.note_heads(&mut core))
    }

    /// Queue an outbound ephemeral broadcast. Requires READY.
    pub fn broadcast(&self, payload: Vec<u8>) -> Result<(), HandleError> {
        let core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready => {}
            HandleState::Deleted => return Err(HandleError::Deleted),
            other => return Err(HandleError::NotReady(other)),
        }
        drop(core);
        self.inner.emit(HandleEvent::EphemeralOutbound { data: payload });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transitions driven by the repo and the synchronizer.
    // ------------------------------------------------------------------

    /// IDLE -> LOADING.
    pub(crate) fn begin_loading(&self) {
        let mut core = self.inner.core.lock().unwrap();
        if core.state == HandleState::Idle {
            self.inner.set_state(&mut core, HandleState::Loading);
        } else {
            log::warn!(
                "begin_loading on {} in state {:?}, ignored",
                self.inner.document_id,
                core.state
            );
        }
    }

    /// LOADING -> READY with a document found in storage. The loaded copy
    /// is merged into the handle's document so nothing received meanwhile
    /// is lost.
    pub(crate) fn done_loading(&self, mut loaded: AutoCommit) {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Loading | HandleState::Requesting | HandleState::Unavailable => {}
            HandleState::Ready => {}
            other => {
                log::warn!(
                    "done_loading on {} in state {:?}, ignored",
                    self.inner.document_id,
                    other
                );
                return;
            }
        }
        if let Err(e) = core.doc.merge(&mut loaded) {
            log::error!("merging loaded document {}: {e}", self.inner.document_id);
        }
        self.inner.set_state(&mut core, HandleState::Ready);
        self.inner.note_heads(&mut core);
    }

    /// LOADING -> REQUESTING. Arms the unavailability timeout if configured.
    pub(crate) fn request(&self) {
        {
            let mut core = self.inner.core.lock().unwrap();
            match core.state {
                HandleState::Loading | HandleState::Idle => {
                    self.inner.set_state(&mut core, HandleState::Requesting);
                }
                other => {
                    log::warn!(
                        "request on {} in state {:?}, ignored",
                        self.inner.document_id,
                        other
                    );
                    return;
                }
            }
        }
        if let Some(delay) = self.inner.timeout_delay {
            let weak: Weak<HandleInner> = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.mark_unavailable();
                }
            });
        }
    }

    /// REQUESTING|UNAVAILABLE -> READY, keeping whatever sync already
    /// delivered into the internal document.
    pub(crate) fn mark_ready(&self) {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Requesting | HandleState::Unavailable | HandleState::Loading => {
                self.inner.set_state(&mut core, HandleState::Ready);
                self.inner.note_heads(&mut core);
            }
            HandleState::Ready => {}
            other => {
                log::warn!(
                    "mark_ready on {} in state {:?}, ignored",
                    self.inner.document_id,
                    other
                );
            }
        }
    }

    /// REQUESTING -> UNAVAILABLE. Emitted events always arrive on a later
    /// scheduling turn than the triggering call.
    pub(crate) fn unavailable(&self) {
        self.inner.mark_unavailable();
    }

    /// Re-announce unavailability to newly attached listeners.
    pub(crate) fn reannounce_unavailable(&self) {
        let announced = {
            let core = self.inner.core.lock().unwrap();
            core.state == HandleState::Unavailable
        };
        if announced {
            self.inner.emit(HandleEvent::Unavailable);
        }
    }

    /// READY|UNAVAILABLE -> UNLOADED. The document is retained so a later
    /// `reload` can skip storage.
    pub(crate) fn unload(&self) {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready | HandleState::Unavailable => {
                self.inner.set_state(&mut core, HandleState::Unloaded);
            }
            other => {
                log::warn!(
                    "unload on {} in state {:?}, ignored",
                    self.inner.document_id,
                    other
                );
            }
        }
    }

    /// UNLOADED -> READY (document retained) or LOADING.
    pub(crate) fn reload(&self) {
        let mut core = self.inner.core.lock().unwrap();
        if core.state != HandleState::Unloaded {
            log::warn!(
                "reload on {} in state {:?}, ignored",
                self.inner.document_id,
                core.state
            );
            return;
        }
        if core.last_heads.is_empty() {
            self.inner.set_state(&mut core, HandleState::Loading);
        } else {
            self.inner.set_state(&mut core, HandleState::Ready);
        }
    }

    /// any -> DELETED. Terminal.
    pub(crate) fn delete(&self) {
        let mut core = self.inner.core.lock().unwrap();
        if core.state == HandleState::Deleted {
            return;
        }
        self.inner.set_state(&mut core, HandleState::Deleted);
        drop(core);
        self.inner.emit(HandleEvent::Delete);
    }

    // ------------------------------------------------------------------
    // Sync-protocol entry points. The synchronizer mutates the document
    // only through these, never through fields.
    // ------------------------------------------------------------------

    /// Produce the next sync message for a peer, if the protocol has one.
    pub(crate) fn generate_sync_message(
        &self,
        sync_state: &mut automerge::sync::State,
    ) -> Option<Vec<u8>> {
        use automerge::sync::SyncDoc;
        let mut core = self.inner.core.lock().unwrap();
        let msg = core
            .doc
            .sync()
            .generate_sync_message(sync_state)
            .map(|m| m.encode());
        msg
    }

    /// Apply an inbound sync message. Returns whether the heads moved;
    /// change events fire before this returns.
    pub(crate) fn receive_sync_message(
        &self,
        sync_state: &mut automerge::sync::State,
        data: &[u8],
    ) -> Result<bool, HandleError> {
        use automerge::sync::SyncDoc;
        let message = automerge::sync::Message::decode(data)
            .map_err(|e| HandleError::Crdt(e.to_string()))?;
        let mut core = self.inner.core.lock().unwrap();
        if core.state == HandleState::Deleted {
            return Err(HandleError::Deleted);
        }
        let before = core.last_heads.clone();
        core.doc
            .sync()
            .receive_sync_message(sync_state, message)
            .map_err(|e| HandleError::Crdt(e.to_string()))?;
        let after = self.inner.note_heads(&mut core);
        Ok(before != after)
    }

    /// Whether the internal document has any history yet. Used by the
    /// synchronizer to distinguish `sync` from `request`.
    pub(crate) fn has_history(&self) -> bool {
        let mut core = self.inner.core.lock().unwrap();
        !core.doc.get_heads().is_empty()
    }

    /// Snapshot the internal document regardless of state. Only the save
    /// path uses this; user-facing reads stay gated on READY.
    pub(crate) fn clone_doc(&self) -> AutoCommit {
        self.inner.core.lock().unwrap().doc.clone()
    }

    /// Serialize the full document. Requires READY.
    pub(crate) fn save(&self) -> Result<Vec<u8>, HandleError> {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            HandleState::Ready | HandleState::Unloaded => Ok(core.doc.save()),
            HandleState::Deleted => Err(HandleError::Deleted),
            other => Err(HandleError::NotReady(other)),
        }
    }

    /// Record heads observed on behalf of a remote storage and notify
    /// subscribers.
    pub(crate) fn set_remote_heads(&self, storage_id: StorageId, heads: Vec<ChangeHash>) {
        let mut core = self.inner.core.lock().unwrap();
        core.remote_heads.insert(storage_id.clone(), heads.clone());
        drop(core);
        self.inner.emit(HandleEvent::RemoteHeads { storage_id, heads });
    }

    /// Last known heads for a remote storage, if any were gossiped.
    pub fn remote_heads(&self, storage_id: &StorageId) -> Option<Vec<ChangeHash>> {
        self.inner.core.lock().unwrap().remote_heads.get(storage_id).cloned()
    }

    /// Deliver an inbound ephemeral message to listeners.
    pub(crate) fn deliver_ephemeral(&self, sender_id: PeerId, data: Vec<u8>) {
        self.inner.emit(HandleEvent::EphemeralMessage { sender_id, data });
    }
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("document_id", &self.inner.document_id)
            .field("state", &self.state())
            .finish()
    }
}
