//! Wire protocol between repos.
//!
//! Messages are bincode-encoded and opaque to the transport. Sync payloads
//! (`data` fields) are automerge sync-protocol bytes and are handed to the
//! CRDT engine verbatim.
//!
//! Message types:
//! ```text
//! sync / request          per-document sync protocol rounds
//! doc-unavailable         "I do not have this document"
//! ephemeral               application broadcast, deduped by (session, count)
//! remote-subscription-change   subscribe to heads gossip for storage ids
//! remote-heads-changed    heads observed on behalf of remote storages
//! ```
//!
//! Required fields are encoded as non-optional struct fields, so a decoded
//! message is a valid message; anything else fails `decode` and is rejected
//! at the adapter boundary.

use automerge::ChangeHash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::{DocumentId, PeerId, StorageId};

/// Heads advertised on behalf of a storage, with the advertiser's clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadsAtTime {
    /// Lowercase-hex change hashes.
    pub heads: Vec<String>,
    /// Milliseconds since the epoch at the observing peer.
    pub timestamp: i64,
}

/// A message exchanged between two repos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RepoMessage {
    /// A sync-protocol round for a document both ends may have.
    Sync {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        data: Vec<u8>,
    },
    /// A sync-protocol round for a document the sender does not have yet.
    Request {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        data: Vec<u8>,
    },
    /// The sender has no copy of the document and cannot provide one.
    DocUnavailable {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
    },
    /// Application-level broadcast, not persisted in the CRDT.
    Ephemeral {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        /// Monotonically increasing per-session counter.
        count: u32,
        /// Random id for the sender's run, used for dedupe.
        session_id: String,
        data: Vec<u8>,
    },
    /// Subscribe/unsubscribe to heads gossip for the named storages.
    RemoteSubscriptionChange {
        sender_id: PeerId,
        target_id: PeerId,
        add: Vec<StorageId>,
        remove: Vec<StorageId>,
    },
    /// Heads the sender has observed on behalf of one or more storages.
    RemoteHeadsChanged {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        new_heads: HashMap<StorageId, HeadsAtTime>,
    },
}

impl RepoMessage {
    /// The peer that produced this message.
    pub fn sender_id(&self) -> &PeerId {
        match self {
            Self::Sync { sender_id, .. }
            | Self::Request { sender_id, .. }
            | Self::DocUnavailable { sender_id, .. }
            | Self::Ephemeral { sender_id, .. }
            | Self::RemoteSubscriptionChange { sender_id, .. }
            | Self::RemoteHeadsChanged { sender_id, .. } => sender_id,
        }
    }

    /// The peer this message is addressed to.
    pub fn target_id(&self) -> &PeerId {
        match self {
            Self::Sync { target_id, .. }
            | Self::Request { target_id, .. }
            | Self::DocUnavailable { target_id, .. }
            | Self::Ephemeral { target_id, .. }
            | Self::RemoteSubscriptionChange { target_id, .. }
            | Self::RemoteHeadsChanged { target_id, .. } => target_id,
        }
    }

    /// The document this message concerns, if any.
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            Self::Sync { document_id, .. }
            | Self::Request { document_id, .. }
            | Self::DocUnavailable { document_id, .. }
            | Self::Ephemeral { document_id, .. }
            | Self::RemoteHeadsChanged { document_id, .. } => Some(document_id),
            Self::RemoteSubscriptionChange { .. } => None,
        }
    }

    /// Stable wire name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::Request { .. } => "request",
            Self::DocUnavailable { .. } => "doc-unavailable",
            Self::Ephemeral { .. } => "ephemeral",
            Self::RemoteSubscriptionChange { .. } => "remote-subscription-change",
            Self::RemoteHeadsChanged { .. } => "remote-heads-changed",
        }
    }

    /// Overwrite the sender. The network subsystem tags every outbound
    /// message with the local peer id before it reaches an adapter.
    pub fn set_sender(&mut self, peer: PeerId) {
        match self {
            Self::Sync { sender_id, .. }
            | Self::Request { sender_id, .. }
            | Self::DocUnavailable { sender_id, .. }
            | Self::Ephemeral { sender_id, .. }
            | Self::RemoteSubscriptionChange { sender_id, .. }
            | Self::RemoteHeadsChanged { sender_id, .. } => *sender_id = peer,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Encode heads as lowercase-hex strings for the wire.
pub fn heads_to_wire(heads: &[ChangeHash]) -> Vec<String> {
    heads.iter().map(|h| hex::encode(h.0)).collect()
}

/// Decode wire heads back into change hashes.
pub fn heads_from_wire(heads: &[String]) -> Result<Vec<ChangeHash>, ProtocolError> {
    heads
        .iter()
        .map(|s| {
            let bytes = hex::decode(s).map_err(|e| ProtocolError::BadHeads(e.to_string()))?;
            ChangeHash::try_from(bytes.as_slice())
                .map_err(|e| ProtocolError::BadHeads(e.to_string()))
        })
        .collect()
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A wire heads list did not decode to 32-byte change hashes.
    BadHeads(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            Self::BadHeads(e) => write!(f, "bad heads encoding: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
