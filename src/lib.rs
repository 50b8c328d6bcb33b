//! # docsync — client-side coordinator for collaborative documents
//!
//! A `Repo` owns a set of document handles. For each handle it orchestrates
//! loading and persisting the document through a pluggable storage backend,
//! discovering peers through pluggable network adapters, and running a
//! per-document sync protocol with each eligible peer, so that all
//! participants converge on the same automerge state.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ change   ┌────────────────┐  messages  ┌────────────┐
//! │ DocHandle  │ ───────► │ DocSynchronizer│ ─────────► │  Network   │
//! │ (state     │          │ (one sync state│            │ Subsystem  │
//! │  machine)  │ ◄─────── │  per peer)     │ ◄───────── │ (adapters) │
//! └─────┬──────┘  patches └───────┬────────┘   inbound  └────────────┘
//!       │ heads-changed          │ owned by
//!       ▼                        ▼
//! ┌────────────┐          ┌────────────────────┐   ┌──────────────────┐
//! │ Storage    │          │ Collection         │   │ RemoteHeads      │
//! │ Subsystem  │          │ Synchronizer       │   │ Subscriptions    │
//! │ (debounced │          │ (share policy,     │   │ (heads gossip)   │
//! │  saves)    │          │  peer × document)  │   └──────────────────┘
//! └────────────┘          └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`repo`] — the facade: create/find/delete/import/export/flush
//! - [`handle`] — per-document state machine and event hub
//! - [`storage`] — storage adapter seam and content-addressed persistence
//! - [`network`] — network adapter seam, routing, ephemeral dedupe
//! - [`synchronizer`] — per-document and collection-wide sync engines
//! - [`remote_heads`] — subscribe/notify of heads seen by remote storages
//! - [`ids`] — document/peer/storage identifiers and the URL codec
//! - [`protocol`] — wire message types
//!
//! ## Example
//!
//! ```no_run
//! use docsync::{Repo, RepoConfig};
//! use automerge::{transaction::Transactable, ROOT};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Repo::new(RepoConfig::default()).await?;
//! let handle = repo.create().await?;
//! handle.change(|doc| {
//!     doc.put(ROOT, "title", "shopping list").unwrap();
//! })?;
//! println!("share this: {}", handle.url());
//! # Ok(())
//! # }
//! ```

pub mod debounce;
pub mod handle;
pub mod ids;
pub mod network;
pub mod protocol;
pub mod remote_heads;
pub mod repo;
pub mod storage;
pub mod synchronizer;

pub use handle::{DocHandle, HandleError, HandleEvent, HandleOptions, HandleState};
pub use ids::{DocumentId, InvalidDocumentId, PeerId, PeerMetadata, StorageId};
pub use network::{
    AdapterEvent, DummyNetworkAdapter, MemoryNetworkAdapter, NetworkAdapter, NetworkError,
    NetworkSubsystem,
};
pub use protocol::{HeadsAtTime, ProtocolError, RepoMessage};
pub use remote_heads::{RemoteHeadsEvent, RemoteHeadsSubscriptions};
pub use repo::{Repo, RepoConfig, RepoError};
pub use storage::{
    InMemoryStorageAdapter, StorageAdapter, StorageError, StorageKey, StorageSubsystem,
};
pub use synchronizer::{
    CollectionSynchronizer, DocSynchronizer, ShareAll, SharePolicy, SyncEvent,
};

// The CRDT engine is part of the public API surface: handles hand out
// automerge documents and heads.
pub use automerge;
