//! Persistence: the adapter seam and the content-addressed policy on top.
//!
//! A `StorageAdapter` is a key-value store keyed by path vectors. The
//! `StorageSubsystem` layers the document persistence policy over it:
//!
//! ```text
//! [doc, "incremental", <change-hash>]  one key per new CRDT change
//! [doc, "snapshot", <fingerprint>]     compacted full document
//! [doc, "sync-state", <storage-id>]    persisted per-backend sync state
//! ["storage-adapter-id"]               this backend's stable identity
//! ```
//!
//! Incremental writes are keyed by change hash, so re-persisting a change
//! is a no-op. Loading reads the snapshot plus all incrementals and applies
//! them in any order; CRDT commutativity makes the order irrelevant. When
//! the incremental set outgrows the last snapshot, the subsystem compacts:
//! it writes a fresh snapshot and deletes the chunks it has itself written.

pub mod memory;

use async_trait::async_trait;
use automerge::AutoCommit;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::ids::{DocumentId, StorageId};

pub use memory::InMemoryStorageAdapter;

/// A storage key: a path vector of strings.
pub type StorageKey = Vec<String>;

/// Compact once this many incremental chunks accumulate, regardless of size.
const COMPACTION_CHUNK_LIMIT: usize = 64;

/// Key under which a backend stores its stable identity.
const ADAPTER_ID_KEY: &str = "storage-adapter-id";

/// Storage failures. Logged by the repo; surfaced only through `flush`.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// The backing adapter failed.
    Backend(String),
    /// Stored bytes did not decode.
    Codec(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "storage backend error: {e}"),
            Self::Codec(e) => write!(f, "storage codec error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// The pluggable persistence seam.
///
/// All operations are async and may fail; failures propagate to the caller.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Load the value at a key, if present.
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError>;
    /// Save a value at a key, overwriting.
    async fn save(&self, key: &StorageKey, value: &[u8]) -> Result<(), StorageError>;
    /// Remove a key if present.
    async fn remove(&self, key: &StorageKey) -> Result<(), StorageError>;
    /// Load every (key, value) under a key prefix.
    async fn load_range(
        &self,
        prefix: &StorageKey,
    ) -> Result<Vec<(StorageKey, Vec<u8>)>, StorageError>;
    /// Remove every key under a key prefix.
    async fn remove_range(&self, prefix: &StorageKey) -> Result<(), StorageError>;
}

/// Per-document bookkeeping of the chunks this process wrote or loaded.
/// Compaction only deletes keys recorded here.
#[derive(Default)]
struct ChunkBook {
    incremental: Vec<(StorageKey, usize)>,
    snapshots: Vec<(StorageKey, usize)>,
    /// Heads covered by everything persisted so far.
    stored_heads: Vec<automerge::ChangeHash>,
}

impl ChunkBook {
    fn incremental_bytes(&self) -> usize {
        self.incremental.iter().map(|(_, n)| n).sum()
    }

    fn snapshot_bytes(&self) -> usize {
        self.snapshots.iter().map(|(_, n)| n).sum()
    }

    fn should_compact(&self) -> bool {
        self.incremental.len() >= COMPACTION_CHUNK_LIMIT
            || (!self.incremental.is_empty() && self.incremental_bytes() > self.snapshot_bytes())
    }
}

/// Thin content-addressed wrapper over a `StorageAdapter`.
pub struct StorageSubsystem {
    adapter: Arc<dyn StorageAdapter>,
    books: Mutex<HashMap<DocumentId, ChunkBook>>,
    storage_id: tokio::sync::Mutex<Option<StorageId>>,
}

impl StorageSubsystem {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            books: Mutex::new(HashMap::new()),
            storage_id: tokio::sync::Mutex::new(None),
        }
    }

    /// The stable identity of the backend, minted and persisted on first use.
    pub async fn id(&self) -> Result<StorageId, StorageError> {
        let mut cached = self.storage_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let key: StorageKey = vec![ADAPTER_ID_KEY.to_string()];
        let id = match self.adapter.load(&key).await? {
            Some(bytes) => {
                let s = String::from_utf8(bytes).map_err(|e| StorageError::Codec(e.to_string()))?;
                StorageId::from(s)
            }
            None => {
                let id = StorageId::random();
                self.adapter.save(&key, id.as_str().as_bytes()).await?;
                id
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }

    /// Load a document from its snapshot and incremental chunks.
    ///
    /// Returns `None` when nothing is stored under the document's prefix.
    pub async fn load_doc(&self, id: DocumentId) -> Result<Option<AutoCommit>, StorageError> {
        let prefix: StorageKey = vec![id.to_string()];
        let entries = self.adapter.load_range(&prefix).await?;

        let mut doc = AutoCommit::new();
        let mut book = ChunkBook::default();
        let mut found = false;
        for (key, value) in entries {
            let kind = key.get(1).map(String::as_str);
            match kind {
                Some("snapshot") => book.snapshots.push((key.clone(), value.len())),
                Some("incremental") => book.incremental.push((key.clone(), value.len())),
                // Sync states and anything else under the prefix are not
                // document data.
                _ => continue,
            }
            doc.load_incremental(&value)
                .map_err(|e| StorageError::Codec(e.to_string()))?;
            found = true;
        }
        if !found {
            return Ok(None);
        }

        book.stored_heads = doc.get_heads();
        self.books.lock().unwrap().insert(id, book);
        Ok(Some(doc))
    }

    /// Persist the changes of `doc` not yet stored, compacting when the
    /// incremental set has outgrown the snapshot. Re-saving already stored
    /// changes is a no-op by construction of the keys.
    pub async fn save_doc(&self, id: DocumentId, doc: &mut AutoCommit) -> Result<(), StorageError> {
        let stored_heads = {
            let books = self.books.lock().unwrap();
            books.get(&id).map(|b| b.stored_heads.clone()).unwrap_or_default()
        };

        let changes: Vec<(StorageKey, Vec<u8>)> = doc
            .get_changes(&stored_heads)
            .iter()
            .map(|change| {
                let key = vec![
                    id.to_string(),
                    "incremental".to_string(),
                    hex::encode(change.hash().0),
                ];
                (key, change.raw_bytes().to_vec())
            })
            .collect();

        for (key, bytes) in &changes {
            self.adapter.save(key, bytes).await?;
        }

        let heads = doc.get_heads();
        let should_compact = {
            let mut books = self.books.lock().unwrap();
            let book = books.entry(id).or_default();
            for (key, bytes) in &changes {
                book.incremental.push((key.clone(), bytes.len()));
            }
            book.stored_heads = heads;
            book.should_compact()
        };

        if should_compact {
            self.compact(id, doc).await?;
        }
        Ok(())
    }

    /// Replace the incremental chunks with one fresh snapshot.
    async fn compact(&self, id: DocumentId, doc: &mut AutoCommit) -> Result<(), StorageError> {
        let snapshot = doc.save();
        let key = vec![
            id.to_string(),
            "snapshot".to_string(),
            format!("{:016x}", content_fingerprint(&snapshot)),
        ];
        self.adapter.save(&key, &snapshot).await?;

        let stale: Vec<StorageKey> = {
            let mut books = self.books.lock().unwrap();
            let book = books.entry(id).or_default();
            let stale = book
                .incremental
                .drain(..)
                .chain(book.snapshots.drain(..))
                .map(|(k, _)| k)
                .filter(|k| *k != key)
                .collect();
            book.snapshots.push((key, snapshot.len()));
            book.stored_heads = doc.get_heads();
            stale
        };

        for old in stale {
            self.adapter.remove(&old).await?;
        }
        log::debug!("compacted document {id} into a {} byte snapshot", snapshot.len());
        Ok(())
    }

    /// Delete everything stored under the document's prefix.
    pub async fn remove_doc(&self, id: DocumentId) -> Result<(), StorageError> {
        self.books.lock().unwrap().remove(&id);
        self.adapter.remove_range(&vec![id.to_string()]).await
    }

    /// Load the persisted sync state for `(document, storage backend)`.
    pub async fn load_sync_state(
        &self,
        id: DocumentId,
        storage_id: &StorageId,
    ) -> Result<Option<automerge::sync::State>, StorageError> {
        let key = sync_state_key(id, storage_id);
        match self.adapter.load(&key).await? {
            None => Ok(None),
            Some(bytes) => match automerge::sync::State::decode(&bytes) {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    // A corrupt sync state only costs a full resync.
                    log::warn!("discarding undecodable sync state for {id}: {e}");
                    Ok(None)
                }
            },
        }
    }

    /// Persist the sync state for `(document, storage backend)`.
    pub async fn save_sync_state(
        &self,
        id: DocumentId,
        storage_id: &StorageId,
        state: &automerge::sync::State,
    ) -> Result<(), StorageError> {
        let key = sync_state_key(id, storage_id);
        self.adapter.save(&key, &state.encode()).await
    }
}

fn sync_state_key(id: DocumentId, storage_id: &StorageId) -> StorageKey {
    vec![id.to_string(), "sync-state".to_string(), storage_id.to_string()]
}

/// FNV-1a fold over content bytes, used to name snapshot chunks.
fn content_fingerprint(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::transaction::Transactable;
    use automerge::{ReadDoc, ROOT};

    fn subsystem() -> StorageSubsystem {
        StorageSubsystem::new(Arc::new(InMemoryStorageAdapter::new()))
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let storage = subsystem();
        let id = DocumentId::random();
        let mut doc = AutoCommit::new();
        doc.put(ROOT, "n", 1).unwrap();
        doc.commit();

        storage.save_doc(id, &mut doc).await.unwrap();
        let mut loaded = storage.load_doc(id).await.unwrap().unwrap();
        assert_eq!(loaded.get_heads(), doc.get_heads());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let storage = subsystem();
        assert!(storage.load_doc(DocumentId::random()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let adapter = Arc::new(InMemoryStorageAdapter::new());
        let storage = StorageSubsystem::new(adapter.clone());
        let id = DocumentId::random();
        let mut doc = AutoCommit::new();
        doc.put(ROOT, "n", 1).unwrap();
        doc.commit();

        storage.save_doc(id, &mut doc).await.unwrap();
        let first = adapter.len().await;

        // Saving the same state again writes nothing new.
        storage.save_doc(id, &mut doc).await.unwrap();
        assert_eq!(adapter.len().await, first);

        let mut loaded = storage.load_doc(id).await.unwrap().unwrap();
        assert_eq!(loaded.get_heads(), doc.get_heads());
    }

    #[tokio::test]
    async fn test_incremental_saves_accumulate_changes() {
        let storage = subsystem();
        let id = DocumentId::random();
        let mut doc = AutoCommit::new();
        for i in 0..5 {
            doc.put(ROOT, "n", i).unwrap();
            doc.commit();
            storage.save_doc(id, &mut doc).await.unwrap();
        }

        let mut loaded = storage.load_doc(id).await.unwrap().unwrap();
        assert_eq!(loaded.get_heads(), doc.get_heads());
        let (value, _) = loaded.get(ROOT, "n").unwrap().unwrap();
        assert_eq!(value.to_i64(), Some(4));
    }

    #[tokio::test]
    async fn test_compaction_replaces_chunks_with_snapshot() {
        let adapter = Arc::new(InMemoryStorageAdapter::new());
        let storage = StorageSubsystem::new(adapter.clone());
        let id = DocumentId::random();
        let mut doc = AutoCommit::new();

        // Enough change volume to trip the byte-ratio rule repeatedly.
        for i in 0..COMPACTION_CHUNK_LIMIT + 8 {
            doc.put(ROOT, "n", i as i64).unwrap();
            doc.commit();
            storage.save_doc(id, &mut doc).await.unwrap();
        }

        let keys = adapter.keys_under(&vec![id.to_string()]).await;
        let snapshots = keys.iter().filter(|k| k.get(1).map(String::as_str) == Some("snapshot"));
        assert_eq!(snapshots.count(), 1, "exactly one snapshot after compaction");

        let mut loaded = storage.load_doc(id).await.unwrap().unwrap();
        assert_eq!(loaded.get_heads(), doc.get_heads());
    }

    #[tokio::test]
    async fn test_remove_doc_clears_prefix() {
        let adapter = Arc::new(InMemoryStorageAdapter::new());
        let storage = StorageSubsystem::new(adapter.clone());
        let id = DocumentId::random();
        let mut doc = AutoCommit::new();
        doc.put(ROOT, "n", 1).unwrap();
        doc.commit();
        storage.save_doc(id, &mut doc).await.unwrap();

        storage.remove_doc(id).await.unwrap();
        assert!(adapter.keys_under(&vec![id.to_string()]).await.is_empty());
        assert!(storage.load_doc(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_state_roundtrip() {
        let storage = subsystem();
        let id = DocumentId::random();
        let backend = StorageId::from("backend-1");

        assert!(storage.load_sync_state(id, &backend).await.unwrap().is_none());

        let state = automerge::sync::State::new();
        storage.save_sync_state(id, &backend, &state).await.unwrap();
        assert!(storage.load_sync_state(id, &backend).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stable_storage_id() {
        let adapter = Arc::new(InMemoryStorageAdapter::new());
        let a = StorageSubsystem::new(adapter.clone());
        let id1 = a.id().await.unwrap();
        assert_eq!(a.id().await.unwrap(), id1);

        // A second subsystem over the same adapter sees the same id.
        let b = StorageSubsystem::new(adapter);
        assert_eq!(b.id().await.unwrap(), id1);
    }

    #[test]
    fn test_content_fingerprint_is_stable() {
        assert_eq!(content_fingerprint(b"abc"), content_fingerprint(b"abc"));
        assert_ne!(content_fingerprint(b"abc"), content_fingerprint(b"abd"));
    }
}
