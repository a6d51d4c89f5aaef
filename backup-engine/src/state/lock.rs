//! Exclusive advisory lock for the state file.
//!
//! At most one run may mutate a given state path at a time, so the engine
//! holds a lock file next to the state for the whole load→upload→persist
//! span. Acquisition uses create-new semantics; whoever creates the file
//! owns the lock.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::utils::errors::{BackupError, Result};

/// Contents of the lock file, so the holder can be named in errors.
#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// A held lock. Dropping it removes the lock file; a lock left behind by a
/// crashed process has to be removed by hand.
pub struct StateLock {
    path: PathBuf,
    released: bool,
}

impl StateLock {
    /// Take the lock for `state_path`, failing fast if it is already held.
    pub async fn acquire(state_path: &Path) -> Result<StateLock> {
        let path = lock_path(state_path);
        let mut file = match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BackupError::StateLocked {
                    path: state_path.to_path_buf(),
                    holder: read_holder(&path).await,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let entry = LockEntry {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        file.write_all(&serde_json::to_vec(&entry)?).await?;
        Ok(StateLock {
            path,
            released: false,
        })
    }

    /// Remove the lock file.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path).await?;
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("could not remove lock file {}: {e}", self.path.display());
            }
        }
    }
}

fn lock_path(state_path: &Path) -> PathBuf {
    let mut name = state_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

async fn read_holder(path: &Path) -> String {
    let entry = fs::read_to_string(path)
        .await
        .ok()
        .and_then(|raw| serde_json::from_str::<LockEntry>(&raw).ok());
    match entry {
        Some(entry) => format!(
            "{} (pid {}, since {})",
            entry.hostname,
            entry.pid,
            entry.acquired_at.to_rfc3339()
        ),
        None => "an unknown holder".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_acquire_names_the_holder() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let held = StateLock::acquire(&state_path).await.unwrap();
        let denied = StateLock::acquire(&state_path).await;
        match denied {
            Err(BackupError::StateLocked { holder, .. }) => {
                assert!(holder.contains(&format!("pid {}", std::process::id())));
            }
            Err(other) => panic!("expected StateLocked, got {other:?}"),
            Ok(_) => panic!("expected StateLocked, but the lock was acquired"),
        }
        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_allows_reacquisition() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let held = StateLock::acquire(&state_path).await.unwrap();
        held.release().await.unwrap();

        let again = StateLock::acquire(&state_path).await.unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_guard_releases() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        {
            let _held = StateLock::acquire(&state_path).await.unwrap();
        }
        let again = StateLock::acquire(&state_path).await.unwrap();
        again.release().await.unwrap();
    }
}
