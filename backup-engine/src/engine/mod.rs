//! Top-level driver for the backup operations.
//!
//! Everything here is sequenced so that the persisted state only ever
//! advances after a fully successful run: snapshot → plan → send → upload →
//! commit. A failure at any earlier point leaves the state file
//! byte-for-byte as it was, which is what makes a run safe to retry.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::{BackupConfig, RunOptions};
use crate::snapshot::{self, CreateOutcome, SnapshotEngine};
use crate::state::lock::StateLock;
use crate::state::{BackupState, StateStore};
use crate::store::ObjectStore;
use crate::transfer::uploader::upload_chunked;
use crate::transfer::{self, TransferMode};
use crate::utils::errors::{BackupError, Result};

/// How often to retry the final state persist before giving up. The upload
/// has already succeeded by then, so the record is worth fighting for.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(250);

/// What a successful run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub snapshot: String,
    pub mode: TransferMode,
    pub group: String,
    pub chunks: u64,
    pub bytes: u64,
}

/// Create the state record for a new dataset+destination pair. Fails if
/// one already exists at the path.
pub async fn init(state_store: &StateStore, config: BackupConfig) -> Result<BackupState> {
    let state = state_store.initialize(config).await?;
    info!(
        dataset = %state.config.dataset,
        bucket = %state.config.bucket,
        path = %state_store.path().display(),
        "backup state initialized"
    );
    Ok(state)
}

/// Composes the snapshot engine and object store into the `run` operation.
pub struct BackupEngine<'a> {
    snapshots: &'a dyn SnapshotEngine,
    store: &'a dyn ObjectStore,
}

impl<'a> BackupEngine<'a> {
    pub fn new(snapshots: &'a dyn SnapshotEngine, store: &'a dyn ObjectStore) -> Self {
        Self { snapshots, store }
    }

    /// Take the next snapshot and ship the next link of the chain.
    pub async fn run(&self, state_store: &StateStore, options: &RunOptions) -> Result<RunReport> {
        let lock = StateLock::acquire(state_store.path()).await?;
        let mut state = state_store.load().await?;

        let snapshot =
            snapshot::next_snapshot_name(&state.config.snapshot_prefix, state.next_index);
        match self.snapshots.create(&state.config.dataset, &snapshot).await {
            Ok(CreateOutcome::Created) => info!(%snapshot, "created snapshot"),
            Ok(CreateOutcome::AlreadyExists) => {
                // A previous run made it this far and failed later; reuse
                // the snapshot and re-attempt the same transfer.
                warn!(%snapshot, "snapshot already exists, resuming from it");
            }
            Err(source) => return Err(BackupError::SnapshotCreation { snapshot, source }),
        }

        let spec = transfer::plan(
            options.object_prefix(&state.config),
            state.chain_head.as_deref(),
            &snapshot,
        );
        let mut stream = match spec.from.as_deref() {
            None => {
                info!(group = %spec.group, "starting full transfer");
                self.snapshots
                    .send_full(&state.config.dataset, &spec.to)
                    .await?
            }
            Some(from) => {
                info!(group = %spec.group, %from, "starting incremental transfer");
                self.snapshots
                    .send_incremental(&state.config.dataset, from, &spec.to)
                    .await?
            }
        };

        let summary = upload_chunked(
            self.store,
            &mut stream,
            &spec.group,
            options.chunk_size,
            options.storage_class.as_deref(),
        )
        .await?;
        info!(
            group = %spec.group,
            chunks = summary.chunks,
            bytes = summary.bytes,
            "upload complete"
        );

        state.chain_head = Some(spec.to.clone());
        state.next_index += 1;
        persist_with_retry(state_store, &state).await?;

        // The run is committed at this point; a failure to clean up the
        // lock file must not turn it into a reported failure.
        if let Err(e) = lock.release().await {
            warn!("could not release state lock: {e}");
        }
        Ok(RunReport {
            snapshot: spec.to,
            mode: spec.mode,
            group: spec.group,
            chunks: summary.chunks,
            bytes: summary.bytes,
        })
    }

    /// Remote chunk groups under `state`'s object prefix, in chain order
    /// with their chunk counts. Read-only; used by the status command.
    pub async fn remote_groups(&self, state: &BackupState) -> Result<Vec<(String, u64)>> {
        let keys = self.store.list(&state.config.object_prefix).await?;
        let groups =
            transfer::groups_from_keys(&state.config.object_prefix, keys.iter().map(String::as_str));
        Ok(transfer::chain_order(&state.config.snapshot_prefix, groups))
    }
}

async fn persist_with_retry(state_store: &StateStore, state: &BackupState) -> Result<()> {
    let mut attempt = 1;
    loop {
        match state_store.save(state).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < PERSIST_ATTEMPTS => {
                warn!(attempt, "state persist failed, retrying: {e}");
                tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::testutil::{FlakyStore, MockSnapshots};
    use crate::transfer::downloader::{chunk_count, download_chunked};
    use std::io::Cursor;
    use std::num::NonZeroUsize;
    use tempfile::tempdir;

    fn config() -> BackupConfig {
        BackupConfig {
            dataset: "zpool/dataset".to_string(),
            bucket: "zfs-sends".to_string(),
            snapshot_prefix: "backup".to_string(),
            object_prefix: "dataset/".to_string(),
        }
    }

    fn options(chunk_size: usize) -> RunOptions {
        RunOptions {
            chunk_size: NonZeroUsize::new(chunk_size).unwrap(),
            storage_class: None,
            object_prefix_override: None,
        }
    }

    async fn restore_group(store: &MemoryStore, target: &MockSnapshots, group: &str) {
        let count = chunk_count(store, group).await.unwrap();
        let mut stream = Vec::new();
        download_chunked(store, group, count, &mut stream)
            .await
            .unwrap();
        target
            .receive("zpool/dataset", Box::pin(Cursor::new(stream)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn scenario_a_full_then_incremental_chain_restores() {
        let dir = tempdir().unwrap();
        let state_store = StateStore::new(dir.path().join("state.json"));
        let store = MemoryStore::new();
        let source = MockSnapshots::new("zpool/dataset");
        let engine = BackupEngine::new(&source, &store);

        init(&state_store, config()).await.unwrap();

        source.write_file("file_0.txt", "zero");
        let first = engine.run(&state_store, &options(7)).await.unwrap();
        assert_eq!(first.snapshot, "backup0");
        assert_eq!(first.mode, TransferMode::Full);
        assert_eq!(first.group, "dataset/backup0");

        source.write_file("file_1.txt", "one");
        let second = engine.run(&state_store, &options(7)).await.unwrap();
        assert_eq!(second.snapshot, "backup1");
        assert_eq!(second.mode, TransferMode::Incremental);
        assert_eq!(second.group, "dataset/backup0_backup1");

        let target = MockSnapshots::new("zpool/dataset");
        restore_group(&store, &target, "dataset/backup0").await;
        restore_group(&store, &target, "dataset/backup0_backup1").await;

        let restored = target.restored_files();
        assert_eq!(restored.get("file_0.txt").map(String::as_str), Some("zero"));
        assert_eq!(restored.get("file_1.txt").map(String::as_str), Some("one"));
        assert_eq!(target.restored_head().as_deref(), Some("backup1"));
    }

    #[tokio::test]
    async fn scenario_b_restoring_only_the_full_group_stops_there() {
        let dir = tempdir().unwrap();
        let state_store = StateStore::new(dir.path().join("state.json"));
        let store = MemoryStore::new();
        let source = MockSnapshots::new("zpool/dataset");
        let engine = BackupEngine::new(&source, &store);

        init(&state_store, config()).await.unwrap();

        source.write_file("file_0.txt", "zero");
        engine.run(&state_store, &options(7)).await.unwrap();
        source.write_file("file_1.txt", "one");
        engine.run(&state_store, &options(7)).await.unwrap();

        let target = MockSnapshots::new("zpool/dataset");
        restore_group(&store, &target, "dataset/backup0").await;

        let restored = target.restored_files();
        assert!(restored.contains_key("file_0.txt"));
        assert!(!restored.contains_key("file_1.txt"));
        assert_eq!(target.restored_head().as_deref(), Some("backup0"));
    }

    #[tokio::test]
    async fn committed_runs_number_snapshots_without_gaps() {
        let dir = tempdir().unwrap();
        let state_store = StateStore::new(dir.path().join("state.json"));
        let store = MemoryStore::new();
        let source = MockSnapshots::new("zpool/dataset");
        let engine = BackupEngine::new(&source, &store);

        init(&state_store, config()).await.unwrap();

        for expected in ["backup0", "backup1", "backup2"] {
            source.write_file("churn.txt", expected);
            let report = engine.run(&state_store, &options(64)).await.unwrap();
            assert_eq!(report.snapshot, expected);
        }

        let state = state_store.load().await.unwrap();
        assert_eq!(state.chain_head.as_deref(), Some("backup2"));
        assert_eq!(state.next_index, 3);
    }

    #[tokio::test]
    async fn failed_upload_leaves_state_untouched_and_run_is_retriable() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let state_store = StateStore::new(&state_path);
        let source = MockSnapshots::new("zpool/dataset");

        init(&state_store, config()).await.unwrap();
        source.write_file("file_0.txt", "zero");
        let before = std::fs::read(&state_path).unwrap();

        let flaky = FlakyStore::failing_after(0);
        let engine = BackupEngine::new(&source, &flaky);
        let err = engine.run(&state_store, &options(4)).await.unwrap_err();
        assert!(matches!(err, BackupError::ChunkUpload { .. }));
        assert_eq!(std::fs::read(&state_path).unwrap(), before);

        // Retry with a working store: the same snapshot name is replanned,
        // the existing snapshot is reused, and the run commits.
        let store = MemoryStore::new();
        let engine = BackupEngine::new(&source, &store);
        let report = engine.run(&state_store, &options(4)).await.unwrap();
        assert_eq!(report.snapshot, "backup0");
        assert_eq!(
            state_store.load().await.unwrap().chain_head.as_deref(),
            Some("backup0")
        );
    }

    #[tokio::test]
    async fn run_without_init_reports_not_initialized() {
        let dir = tempdir().unwrap();
        let state_store = StateStore::new(dir.path().join("state.json"));
        let store = MemoryStore::new();
        let source = MockSnapshots::new("zpool/dataset");
        let engine = BackupEngine::new(&source, &store);

        assert!(matches!(
            engine.run(&state_store, &options(4)).await,
            Err(BackupError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn remote_groups_come_back_in_chain_order() {
        let dir = tempdir().unwrap();
        let state_store = StateStore::new(dir.path().join("state.json"));
        let store = MemoryStore::new();
        let source = MockSnapshots::new("zpool/dataset");
        let engine = BackupEngine::new(&source, &store);

        init(&state_store, config()).await.unwrap();
        for contents in ["a", "b", "c"] {
            source.write_file("churn.txt", contents);
            engine.run(&state_store, &options(16)).await.unwrap();
        }

        let state = state_store.load().await.unwrap();
        let groups = engine.remote_groups(&state).await.unwrap();
        let names: Vec<_> = groups.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["backup0", "backup0_backup1", "backup1_backup2"]);
        assert!(groups.iter().all(|(_, chunks)| *chunks > 0));
    }
}
