//! Checkpoint persistence
//!
//! The primary record is only ever replaced atomically. When the replace
//! keeps failing (the file is locked by another process), the checkpoint is
//! written to a clearly-named backup record instead so progress is not lost.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::types::Checkpoint;
use crate::error::{Result, SplitError};
use crate::utils::durable::{write_atomic, write_durable, RetryPolicy};

/// Primary checkpoint record name
pub const PRIMARY_FILE: &str = "progress.json";

/// Backup checkpoint record name
pub const BACKUP_FILE: &str = "progress.backup.json";

/// Where a checkpoint ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Primary record replaced
    Primary,
    /// Primary could not be replaced, backup record written instead
    Backup,
}

enum RecordState {
    Missing,
    Corrupt(String),
    Valid(Checkpoint),
}

/// Durable checkpoint store living in the output directory
pub struct CheckpointStore {
    primary: PathBuf,
    backup: PathBuf,
    retry: RetryPolicy,
}

impl CheckpointStore {
    /// Create a store for the given output directory
    pub fn new(dir: &Path, retry: RetryPolicy) -> Self {
        CheckpointStore {
            primary: dir.join(PRIMARY_FILE),
            backup: dir.join(BACKUP_FILE),
            retry,
        }
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Load the most advanced valid checkpoint.
    ///
    /// Returns `Ok(None)` when no record exists and `CorruptCheckpoint` when
    /// records exist but none of them can be decoded.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let primary = read_record(&self.primary).await;
        let backup = read_record(&self.backup).await;

        match (primary, backup) {
            (RecordState::Missing, RecordState::Missing) => Ok(None),
            (RecordState::Valid(p), RecordState::Valid(b)) => {
                if b.progress_key() > p.progress_key() {
                    info!(
                        last_written = b.last_written_message_index,
                        "Backup checkpoint is more recent than primary, using backup"
                    );
                    Ok(Some(b))
                } else {
                    Ok(Some(p))
                }
            }
            (RecordState::Valid(p), RecordState::Corrupt(reason)) => {
                warn!(reason = %reason, "Ignoring unreadable backup checkpoint");
                Ok(Some(p))
            }
            (RecordState::Valid(p), RecordState::Missing) => Ok(Some(p)),
            (RecordState::Missing, RecordState::Corrupt(reason)) => {
                warn!(reason = %reason, "Ignoring unreadable backup checkpoint");
                Ok(None)
            }
            (primary, RecordState::Valid(b)) => {
                if let RecordState::Corrupt(reason) = primary {
                    warn!(reason = %reason, "Primary checkpoint unreadable, falling back to backup");
                } else {
                    info!("Primary checkpoint missing, using backup record");
                }
                Ok(Some(b))
            }
            (primary, backup) => {
                let reasons: Vec<String> = [primary, backup]
                    .into_iter()
                    .filter_map(|state| match state {
                        RecordState::Corrupt(reason) => Some(reason),
                        _ => None,
                    })
                    .collect();
                Err(SplitError::CorruptCheckpoint(reasons.join("; ")))
            }
        }
    }

    /// Persist a checkpoint.
    ///
    /// Falls back to the backup record when the primary cannot be replaced;
    /// fails with `OutputUnavailable` only when neither can be written.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<SaveOutcome> {
        let json = serde_json::to_vec_pretty(checkpoint)?;

        match write_atomic(&self.primary, &json, &self.retry).await {
            Ok(()) => {
                self.remove_stale_backup().await;
                debug!(
                    last_written = checkpoint.last_written_message_index,
                    offset = checkpoint.last_consumed_byte_offset,
                    "Checkpoint saved"
                );
                Ok(SaveOutcome::Primary)
            }
            Err(primary_err) => {
                warn!(
                    path = %self.primary.display(),
                    error = %primary_err,
                    "Could not replace primary checkpoint, writing backup record"
                );

                let written = match write_atomic(&self.backup, &json, &RetryPolicy::once()).await {
                    Ok(()) => Ok(()),
                    Err(_) => write_durable(&self.backup, &json).await,
                };

                match written {
                    Ok(()) => Ok(SaveOutcome::Backup),
                    Err(source) => Err(SplitError::OutputUnavailable {
                        path: self.backup.clone(),
                        source,
                    }),
                }
            }
        }
    }

    async fn remove_stale_backup(&self) {
        match fs::remove_file(&self.backup).await {
            Ok(()) => debug!(path = %self.backup.display(), "Removed stale backup checkpoint"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.backup.display(),
                error = %e,
                "Failed to remove stale backup checkpoint"
            ),
        }
    }
}

async fn read_record(path: &Path) -> RecordState {
    match fs::read(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => RecordState::Missing,
        Err(e) => RecordState::Corrupt(format!("{}: {}", path.display(), e)),
        Ok(bytes) => match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(checkpoint) => RecordState::Valid(checkpoint),
            Err(e) => RecordState::Corrupt(format!("{}: {}", path.display(), e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), fast_retry());

        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), fast_retry());
        let checkpoint = Checkpoint::new(1000, 1734, 912_345, 40_000);

        let outcome = store.save(&checkpoint).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Primary);

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn test_corrupt_primary_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), fast_retry());
        let checkpoint = Checkpoint::new(1000, 100, 5000, 5000);

        std::fs::write(store.primary_path(), b"{\"last_written_message_index\": 1").unwrap();
        std::fs::write(store.backup_path(), serde_json::to_vec(&checkpoint).unwrap()).unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn test_corrupt_records_fail_with_corrupt_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), fast_retry());

        std::fs::write(store.primary_path(), b"not json").unwrap();
        std::fs::write(store.backup_path(), b"\x00\x01").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, SplitError::CorruptCheckpoint(_)));
    }

    #[tokio::test]
    async fn test_corrupt_primary_without_backup_fails() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), fast_retry());

        std::fs::write(store.primary_path(), b"").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, SplitError::CorruptCheckpoint(_)));
    }

    #[tokio::test]
    async fn test_most_advanced_record_wins() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), fast_retry());
        let older = Checkpoint::new(1000, 200, 9000, 9000);
        let newer = Checkpoint::new(1000, 300, 13500, 13500);

        std::fs::write(store.primary_path(), serde_json::to_vec(&older).unwrap()).unwrap();
        std::fs::write(store.backup_path(), serde_json::to_vec(&newer).unwrap()).unwrap();

        assert_eq!(store.load().await.unwrap().unwrap(), newer);
    }

    #[tokio::test]
    async fn test_save_falls_back_to_backup_when_primary_blocked() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), fast_retry());

        // A non-empty directory in place of the primary record makes every rename fail
        std::fs::create_dir(store.primary_path()).unwrap();
        std::fs::write(store.primary_path().join("lock"), b"held").unwrap();

        let checkpoint = Checkpoint::new(1000, 42, 4200, 4200);
        let outcome = store.save(&checkpoint).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Backup);

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn test_primary_save_removes_stale_backup() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), fast_retry());

        std::fs::write(
            store.backup_path(),
            serde_json::to_vec(&Checkpoint::new(1000, 1, 10, 10)).unwrap(),
        )
        .unwrap();

        store.save(&Checkpoint::new(1000, 2, 20, 20)).await.unwrap();

        assert!(!store.backup_path().exists());
        assert_eq!(store.load().await.unwrap().unwrap().last_written_message_index, 2);
    }
}
