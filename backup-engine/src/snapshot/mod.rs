//! Snapshot naming and the snapshot-filesystem collaborator contract.

pub mod zfs;

use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Byte stream produced by a snapshot send operation. Forward-only; the
/// engine consumes it in a single pass, never seeking.
pub type SendStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of [`SnapshotEngine::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The snapshot was already there. A previous run got this far before
    /// failing, and this run is the retry.
    AlreadyExists,
}

/// Next snapshot identifier for a chain position.
///
/// Pure function of the persisted index: a failed run recomputes the same
/// name on retry, because the caller advances the index only after a run
/// fully succeeds.
pub fn next_snapshot_name(prefix: &str, next_index: u64) -> String {
    format!("{prefix}{next_index}")
}

/// Index encoded in a snapshot identifier, if `name` follows `prefix`'s
/// naming scheme.
pub fn snapshot_index(prefix: &str, name: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// The filesystem's snapshot primitives, behind a trait so tests can run
/// against a simulated dataset.
#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    /// Make sure `dataset@snapshot` exists.
    async fn create(&self, dataset: &str, snapshot: &str)
        -> Result<CreateOutcome, SnapshotError>;

    /// Stream carrying the complete dataset state at `snapshot`.
    async fn send_full(&self, dataset: &str, snapshot: &str) -> Result<SendStream, SnapshotError>;

    /// Stream carrying only the difference between `from` and `to`.
    async fn send_incremental(
        &self,
        dataset: &str,
        from: &str,
        to: &str,
    ) -> Result<SendStream, SnapshotError>;

    /// Apply a previously sent stream to `dataset`. Restore-path only; the
    /// backup operations never call this.
    async fn receive(&self, dataset: &str, stream: SendStream) -> Result<(), SnapshotError>;
}
