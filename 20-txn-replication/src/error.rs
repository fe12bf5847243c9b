//! Error types for the stores and the applier.

use std::borrow::Cow;

use thiserror::Error;

/// Renders a key for error messages and log fields.
pub(crate) fn display_key(key: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(key)
}

/// Failures raised by a [`Store`](crate::store::Store) backing.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Snapshot image could not be serialized.
    #[error("failed to encode snapshot: {0}")]
    SnapshotEncode(#[source] bincode::Error),

    /// Snapshot stream could not be parsed.
    #[error("failed to decode snapshot: {0}")]
    SnapshotDecode(#[source] bincode::Error),

    /// Snapshot was written by an incompatible format version.
    #[error("unsupported snapshot version {found}, expected {expected}")]
    SnapshotVersion { found: u32, expected: u32 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`ApplyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    UnknownRequestType,
    KeyAlreadyLocked,
    KeyNotLocked,
    Store,
}

/// Failure of a single log entry.
///
/// Every replica reaches the same error for the same entry, so returning it
/// never breaks determinism.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Entry bytes are not a valid request.
    #[error("failed to decode request: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Mutation op or transaction phase outside the known set.
    #[error("unknown request type: {what} code {code}")]
    UnknownRequestType { what: &'static str, code: i32 },

    /// PREPARE found a live lock held by another transaction.
    #[error("key already locked: {}", display_key(.key))]
    KeyAlreadyLocked { key: Vec<u8> },

    /// COMMIT found no live lock for a key.
    #[error("key not locked: {}", display_key(.key))]
    KeyNotLocked { key: Vec<u8> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApplyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode(_) => ErrorKind::Decode,
            Self::UnknownRequestType { .. } => ErrorKind::UnknownRequestType,
            Self::KeyAlreadyLocked { .. } => ErrorKind::KeyAlreadyLocked,
            Self::KeyNotLocked { .. } => ErrorKind::KeyNotLocked,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    pub(crate) fn unknown_op(code: i32) -> Self {
        Self::UnknownRequestType { what: "op", code }
    }

    pub(crate) fn unknown_phase(code: i32) -> Self {
        Self::UnknownRequestType { what: "phase", code }
    }
}
