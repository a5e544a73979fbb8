/// Error types for the vibe library
///
/// Codec errors come from untrusted, user-picked bytes and are always
/// returned as values. Storage errors carry the failing operation and path
/// so callers can report "not saved" while the cause goes to the log.
use std::path::PathBuf;
use thiserror::Error;

/// Failures while decoding or encoding vibe payloads
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Not a parseable PNG (bad signature, CRC, or missing critical chunks)
    #[error("invalid image format: {0}")]
    InvalidImageFormat(String),

    /// Envelope text that is not the expected shape
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Input rejected before any parsing because of its size
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Well-formed envelope whose values are unusable
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Bundle container with a bad header, index table, or block
    #[error("malformed bundle: {0}")]
    MalformedBundle(String),

    /// The encode step for a raw image did not complete
    #[error("encoding failed: {0}")]
    EncodingFailed(String),
}

impl CodecError {
    /// Single explanatory line suitable for showing to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            CodecError::InvalidImageFormat(_) => "This file is not a valid PNG image.",
            CodecError::PayloadTooLarge { .. } => "This vibe data is too large to import.",
            CodecError::EncodingFailed(_) => "The image could not be encoded as a vibe.",
            CodecError::MalformedEnvelope(_)
            | CodecError::InvalidPayload(_)
            | CodecError::MalformedBundle(_) => "This file has no usable vibe data.",
        }
    }
}

/// Failures in the catalog, file store, or migration driver
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{op} failed for {}: {source}", path.display())]
    FileIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("catalog record could not be (de)serialized: {0}")]
    Record(#[from] serde_json::Error),

    #[error("no library entry with id {0}")]
    NotFound(String),

    #[error("another entry is already named '{0}'")]
    NameTaken(String),

    #[error("migration step failed for entry {entry_id}: {reason}")]
    MigrationStepFailed { entry_id: String, reason: String },

    #[error("catalog schema migration has not completed")]
    MigrationPending,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl StorageError {
    /// Build a `FileIo` error from an operation name and path
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::FileIo {
            op,
            path: path.into(),
            source,
        }
    }

    /// User-facing text; never includes paths or raw causes
    pub fn user_message(&self) -> &'static str {
        match self {
            StorageError::Codec(e) => e.user_message(),
            StorageError::NotFound(_) => "This vibe no longer exists in the library.",
            StorageError::NameTaken(_) => "Another vibe in the library already has this name.",
            StorageError::MigrationStepFailed { .. } | StorageError::MigrationPending => {
                "The vibe library is being upgraded. Please try again."
            }
            StorageError::FileIo { .. }
            | StorageError::Catalog(_)
            | StorageError::Record(_) => "Could not save or delete the vibe.",
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;
pub type StorageResult<T> = Result<T, StorageError>;
