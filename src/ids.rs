//! Identifiers exchanged between repos, peers, and storage backends.
//!
//! A `DocumentId` is an opaque 16-byte value with three lossless external
//! forms: the raw bytes, a base58check string, and a URL of the form
//! `automerge:<base58check>`. A legacy hyphenated UUID form is accepted on
//! input only and logged as deprecated.
//!
//! `PeerId` names a running process; `StorageId` names a storage backend.
//! Several peers may share one `StorageId` (two tabs on the same disk), and
//! ephemeral peers have none.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// URL scheme prefix for document URLs.
pub const URL_PREFIX: &str = "automerge:";

/// An opaque 16-byte document identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId([u8; 16]);

impl DocumentId {
    /// Mint a fresh random (128-bit) document id.
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Build from a raw 16-byte buffer.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw 16-byte form.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The base58check string form.
    pub fn to_base58check(&self) -> String {
        bs58::encode(&self.0).with_check().into_string()
    }

    /// The URL form, `automerge:<base58check>`.
    pub fn to_url(&self) -> String {
        format!("{URL_PREFIX}{}", self.to_base58check())
    }

    /// Parse any accepted external form: a document URL, a bare base58check
    /// string, or (deprecated) a hyphenated UUID.
    ///
    /// Parsing rejects extra characters, bad checksums, and payloads that are
    /// not exactly 16 bytes.
    pub fn parse(input: &str) -> Result<Self, InvalidDocumentId> {
        let payload = input.strip_prefix(URL_PREFIX).unwrap_or(input);

        // Hyphens never occur in base58; a hyphenated payload is the legacy
        // UUID form.
        if payload.contains('-') {
            let uuid = Uuid::parse_str(payload)
                .map_err(|e| InvalidDocumentId::BadUuid(e.to_string()))?;
            log::warn!("deprecated hyphenated UUID document id accepted: {payload}");
            return Ok(Self(*uuid.as_bytes()));
        }

        let bytes = bs58::decode(payload)
            .with_check(None)
            .into_vec()
            .map_err(|e| InvalidDocumentId::BadChecksum(e.to_string()))?;
        let bytes: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| InvalidDocumentId::WrongLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base58check())
    }
}

// Debug delegates to Display so ids log as their external form.
impl std::fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = InvalidDocumentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Document id parse failure.
#[derive(Debug, Clone)]
pub enum InvalidDocumentId {
    /// Base58check decode failed (bad alphabet, checksum mismatch, extra
    /// characters).
    BadChecksum(String),
    /// Decoded payload was not 16 bytes.
    WrongLength(usize),
    /// Legacy UUID form did not parse.
    BadUuid(String),
}

impl std::fmt::Display for InvalidDocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadChecksum(e) => write!(f, "invalid document id: {e}"),
            Self::WrongLength(n) => write!(f, "invalid document id: {n} byte payload, expected 16"),
            Self::BadUuid(e) => write!(f, "invalid document id: {e}"),
        }
    }
}

impl std::error::Error for InvalidDocumentId {}

/// A free-form process-unique peer name.
///
/// Two equal `PeerId`s name the same logical peer, including across
/// reconnects.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Mint a random peer id for this process.
    pub fn random() -> Self {
        Self(format!("peer-{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A stable identifier for a storage backend.
///
/// This names the backend, not the peer: two processes sharing one disk
/// share a `StorageId`, and ephemeral peers have none.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageId(String);

impl StorageId {
    /// Mint a fresh random storage id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StorageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StorageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for StorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for StorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Peer capabilities exchanged once at connection setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    /// The peer's storage backend, if it has one.
    pub storage_id: Option<StorageId>,
    /// Whether the peer keeps no durable state.
    pub is_ephemeral: bool,
}
