//! Backup target configuration and per-run options.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Identity of one backed-up dataset+destination pair.
///
/// Captured once at `init` and stored inside the state file, so later runs
/// cannot accidentally pair one dataset's chain with another's destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Dataset to back up, e.g. `tank/photos`.
    pub dataset: String,

    /// Destination bucket.
    pub bucket: String,

    /// Snapshots are named `{snapshot_prefix}{index}`: `backup0`, `backup1`, ...
    pub snapshot_prefix: String,

    /// Remote object keys start with this, e.g. `photos/`.
    pub object_prefix: String,
}

/// Options for a single `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum size of one uploaded object, in bytes. Streams larger than
    /// this are split into sequentially numbered chunks.
    pub chunk_size: NonZeroUsize,

    /// Storage class forwarded to the object store (e.g. `DEEP_ARCHIVE`).
    pub storage_class: Option<String>,

    /// Use this object-key prefix instead of the configured one.
    pub object_prefix_override: Option<String>,
}

impl RunOptions {
    /// Effective object-key prefix for this run.
    pub fn object_prefix<'a>(&'a self, config: &'a BackupConfig) -> &'a str {
        self.object_prefix_override
            .as_deref()
            .unwrap_or(&config.object_prefix)
    }
}
