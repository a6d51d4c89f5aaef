//! Custom error types for the backup engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::snapshot::SnapshotError;
use crate::store::StoreError;

/// Everything that can make an operation fail, with enough context to
/// diagnose and safely retry.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("no backup state at {path}; run `init` first")]
    NotInitialized { path: PathBuf },

    #[error("backup state already exists at {path}; refusing to overwrite it")]
    AlreadyInitialized { path: PathBuf },

    #[error("backup state at {path} is unreadable: {source}")]
    StateCorrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("state at {path} is locked by {holder}; remove the lock file if that process is gone")]
    StateLocked { path: PathBuf, holder: String },

    #[error("failed to create snapshot {snapshot}: {source}")]
    SnapshotCreation {
        snapshot: String,
        source: SnapshotError,
    },

    #[error("send stream for {group} broke mid-transfer: {source}")]
    StreamRead {
        group: String,
        source: std::io::Error,
    },

    #[error("upload of chunk {key} failed: {source}")]
    ChunkUpload { key: String, source: StoreError },

    #[error("chunk group {group} is missing chunk {index}")]
    MissingChunk { group: String, index: u64 },

    #[error("could not persist updated state to {path}: {source}")]
    StatePersist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("snapshot operation failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
