//! Test doubles: a simulated snapshot filesystem and a fault-injecting
//! object store.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::snapshot::{CreateOutcome, SendStream, SnapshotEngine, SnapshotError};
use crate::store::memory::MemoryStore;
use crate::store::{ObjectStore, StoreError};

type Files = BTreeMap<String, String>;

/// What a mock send stream carries. Receiving validates the chain the same
/// way a real snapshot filesystem rejects an out-of-order incremental.
#[derive(Debug, Serialize, Deserialize)]
struct SendPayload {
    from: Option<String>,
    to: String,
    files: Files,
}

#[derive(Debug, Default)]
struct Sim {
    live: Files,
    snapshots: Vec<(String, Files)>,
    restored: Files,
    restored_head: Option<String>,
}

/// In-memory stand-in for the snapshot filesystem. One instance simulates
/// one dataset: mutate its live files, snapshot them, send and receive
/// payload streams.
pub struct MockSnapshots {
    dataset: String,
    sim: Mutex<Sim>,
}

impl MockSnapshots {
    pub fn new(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            sim: Mutex::new(Sim::default()),
        }
    }

    /// Create or overwrite a live file.
    pub fn write_file(&self, name: &str, contents: &str) {
        self.sim
            .lock()
            .unwrap()
            .live
            .insert(name.to_string(), contents.to_string());
    }

    /// Files as reconstructed by `receive` calls so far.
    pub fn restored_files(&self) -> Files {
        self.sim.lock().unwrap().restored.clone()
    }

    /// Snapshot the restored state currently corresponds to.
    pub fn restored_head(&self) -> Option<String> {
        self.sim.lock().unwrap().restored_head.clone()
    }

    fn check_dataset(&self, dataset: &str) -> Result<(), SnapshotError> {
        if dataset == self.dataset {
            Ok(())
        } else {
            Err(sim_error(format!(
                "unknown dataset {dataset:?} (simulating {:?})",
                self.dataset
            )))
        }
    }

    fn snapshot_files(&self, snapshot: &str) -> Result<Files, SnapshotError> {
        self.sim
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .find(|(name, _)| name == snapshot)
            .map(|(_, files)| files.clone())
            .ok_or_else(|| sim_error(format!("no such snapshot {snapshot:?}")))
    }
}

fn sim_error(message: String) -> SnapshotError {
    SnapshotError::Io(std::io::Error::other(message))
}

fn payload_stream(payload: &SendPayload) -> Result<SendStream, SnapshotError> {
    let encoded = serde_json::to_vec(payload)
        .map_err(|e| sim_error(format!("encode payload: {e}")))?;
    Ok(Box::pin(Cursor::new(encoded)))
}

#[async_trait]
impl SnapshotEngine for MockSnapshots {
    async fn create(
        &self,
        dataset: &str,
        snapshot: &str,
    ) -> Result<CreateOutcome, SnapshotError> {
        self.check_dataset(dataset)?;
        let mut sim = self.sim.lock().unwrap();
        if sim.snapshots.iter().any(|(name, _)| name == snapshot) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let files = sim.live.clone();
        sim.snapshots.push((snapshot.to_string(), files));
        Ok(CreateOutcome::Created)
    }

    async fn send_full(&self, dataset: &str, snapshot: &str) -> Result<SendStream, SnapshotError> {
        self.check_dataset(dataset)?;
        payload_stream(&SendPayload {
            from: None,
            to: snapshot.to_string(),
            files: self.snapshot_files(snapshot)?,
        })
    }

    async fn send_incremental(
        &self,
        dataset: &str,
        from: &str,
        to: &str,
    ) -> Result<SendStream, SnapshotError> {
        self.check_dataset(dataset)?;
        self.snapshot_files(from)?;
        payload_stream(&SendPayload {
            from: Some(from.to_string()),
            to: to.to_string(),
            files: self.snapshot_files(to)?,
        })
    }

    async fn receive(&self, dataset: &str, mut stream: SendStream) -> Result<(), SnapshotError> {
        self.check_dataset(dataset)?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        let payload: SendPayload = serde_json::from_slice(&raw)
            .map_err(|e| sim_error(format!("decode payload: {e}")))?;

        let mut sim = self.sim.lock().unwrap();
        if payload.from != sim.restored_head {
            return Err(sim_error(format!(
                "stream expects base {:?} but restored head is {:?}",
                payload.from, sim.restored_head
            )));
        }
        sim.restored = payload.files;
        sim.restored_head = Some(payload.to);
        Ok(())
    }
}

/// Delegates to a [`MemoryStore`] but fails every put once the budget of
/// successful puts is spent.
pub struct FlakyStore {
    inner: MemoryStore,
    puts_left: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_after(successful_puts: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            puts_left: AtomicUsize::new(successful_puts),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        storage_class: Option<&str>,
    ) -> Result<(), StoreError> {
        let allowed = self
            .puts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(StoreError::Request(format!("injected put failure: {key}")));
        }
        self.inner.put(key, data, storage_class).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix).await
    }
}
