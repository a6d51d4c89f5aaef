//! Durable backup-chain state.
//!
//! One state file records everything the engine needs to chain runs: the
//! immutable target identity and the current position of the chain. It is
//! the single source of truth for "what has already been backed up", so it
//! is only ever rewritten atomically, and only after a run fully succeeds.

pub mod lock;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::BackupConfig;
use crate::utils::errors::{BackupError, Result};

/// Persisted record for one dataset+destination pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupState {
    /// Immutable copy of the identity captured at init.
    pub config: BackupConfig,

    /// Most recently backed-up snapshot. `None` until the first run
    /// succeeds; when present, its whole transfer chain is uploaded.
    pub chain_head: Option<String>,

    /// Index used for the next snapshot name.
    pub next_index: u64,
}

impl BackupState {
    pub fn new(config: BackupConfig) -> Self {
        Self {
            config,
            chain_head: None,
            next_index: 0,
        }
    }
}

/// Loads and persists [`BackupState`] at a fixed path.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file. `NotInitialized` when it does not exist.
    pub async fn load(&self) -> Result<BackupState> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::NotInitialized {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|source| BackupError::StateCorrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Durably replace the state file.
    ///
    /// Writes a sibling temp file, syncs it, and renames it over the real
    /// path, so a crash leaves either the old or the new record on disk,
    /// never a torn one.
    pub async fn save(&self, state: &BackupState) -> Result<()> {
        let payload = serde_json::to_string_pretty(state)?;
        let tmp = self.tmp_path();
        let written: std::io::Result<()> = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(payload.as_bytes()).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &self.path).await
        }
        .await;
        written.map_err(|source| BackupError::StatePersist {
            path: self.path.clone(),
            source,
        })
    }

    /// Create the initial record. Refuses to touch an existing one, so a
    /// second `init` can never wipe backup history.
    pub async fn initialize(&self, config: BackupConfig) -> Result<BackupState> {
        let state = BackupState::new(config);
        let payload = serde_json::to_string_pretty(&state)?;
        let mut file = match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BackupError::AlreadyInitialized {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(payload.as_bytes()).await?;
        file.sync_all().await?;
        Ok(state)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> BackupConfig {
        BackupConfig {
            dataset: "zpool/dataset".to_string(),
            bucket: "zfs-sends".to_string(),
            snapshot_prefix: "backup".to_string(),
            object_prefix: "dataset/".to_string(),
        }
    }

    #[tokio::test]
    async fn initialize_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let created = store.initialize(config()).await.unwrap();
        assert_eq!(created.chain_head, None);
        assert_eq!(created.next_index, 0);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn initialize_twice_is_rejected() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        store.initialize(config()).await.unwrap();
        assert!(matches!(
            store.initialize(config()).await,
            Err(BackupError::AlreadyInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn load_without_init_reports_not_initialized() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("missing.json"));

        assert!(matches!(
            store.load().await,
            Err(BackupError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn save_replaces_state_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        let mut state = store.initialize(config()).await.unwrap();
        state.chain_head = Some("backup0".to_string());
        state.next_index = 1;
        store.save(&state).await.unwrap();

        assert_eq!(store.load().await.unwrap(), state);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_state_is_reported_as_such() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json at all").unwrap();

        let store = StateStore::new(&path);
        assert!(matches!(
            store.load().await,
            Err(BackupError::StateCorrupt { .. })
        ));
    }
}
