//! Per-document and collection-wide synchronization.
//!
//! A `DocSynchronizer` runs the sync protocol for one document against every
//! eligible peer. The `CollectionSynchronizer` owns the set of them, routes
//! peer and document events, and applies the share policy. Both emit the
//! same `SyncEvent` stream, so the repo observes one event source.

pub mod collection;
pub mod doc;

pub use collection::{CollectionSynchronizer, ShareAll, SharePolicy};
pub use doc::DocSynchronizer;

use crate::ids::{DocumentId, PeerId};
use crate::protocol::RepoMessage;

/// What we know about a peer's copy of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerDocStatus {
    /// No exchange yet.
    #[default]
    Unknown,
    /// The peer has (some version of) the document.
    Has,
    /// The peer asked for the document but does not have it.
    Wants,
    /// The peer reported it cannot provide the document.
    Unavailable,
}

/// Events synchronizers emit towards the repo.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// An outbound message ready for the network subsystem.
    Message(RepoMessage),
    /// A peer's sync state changed; the repo may persist it.
    SyncState {
        document_id: DocumentId,
        peer_id: PeerId,
        sync_state: automerge::sync::State,
    },
    /// First successful exchange of a document with a peer.
    OpenDoc {
        document_id: DocumentId,
        peer_id: PeerId,
    },
}
