//! Durable file writes
//!
//! Records that must never be observed half-written are replaced by writing
//! a temp file in the same directory, syncing it, then renaming it over the
//! target. Renames are retried with exponential backoff while another
//! process holds the target open.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bounded retry schedule for transient filesystem failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once
    pub fn once() -> Self {
        RetryPolicy {
            attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// The last error is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Transient filesystem failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Temp file path next to `target`, so the final rename never crosses filesystems
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string());

    target.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Atomically replace `target` with `contents`.
///
/// Readers observe either the complete old file or the complete new one.
/// On failure the temp file is removed and `target` is left untouched.
pub async fn write_atomic(target: &Path, contents: &[u8], policy: &RetryPolicy) -> io::Result<()> {
    let tmp = temp_path_for(target);

    if let Err(e) = write_durable(&tmp, contents).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }

    let from = tmp.as_path();
    if let Err(e) = retry_with_backoff(policy, "rename", move || fs::rename(from, target)).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }

    sync_parent_dir(target).await;

    debug!(
        path = %target.display(),
        bytes = contents.len(),
        "Replaced record atomically"
    );
    Ok(())
}

/// Create or truncate `path`, write `contents` and sync to storage.
///
/// Not atomic: a crash mid-write can leave a truncated file.
pub async fn write_durable(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(contents).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(unix)]
async fn sync_parent_dir(path: &Path) {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    if let Ok(dir) = File::open(parent).await {
        let _ = dir.sync_all().await;
    }
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn leftover_temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn test_write_atomic_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("progress.json");

        write_atomic(&target, b"first", &RetryPolicy::default()).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first");

        write_atomic(&target, b"second record", &RetryPolicy::default()).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second record");

        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_write_atomic_missing_directory_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("missing").join("progress.json");

        let result = write_atomic(&target, b"data", &RetryPolicy::once()).await;
        assert!(result.is_err());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_write_atomic_rename_onto_directory_keeps_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("progress.json");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();

        let policy = RetryPolicy {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let result = write_atomic(&target, b"data", &policy).await;

        assert!(result.is_err());
        assert!(target.is_dir());
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_retry_with_backoff_eventually_succeeds() {
        let policy = RetryPolicy {
            attempts: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let mut calls = 0u32;

        let value = retry_with_backoff(&policy, "test", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(io::Error::new(io::ErrorKind::Other, "locked"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_gives_up() {
        let policy = RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let mut calls = 0u32;

        let result: io::Result<()> = retry_with_backoff(&policy, "test", || {
            calls += 1;
            async { Err(io::Error::new(io::ErrorKind::Other, "locked")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            attempts: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
        };

        assert_eq!(policy.backoff_for(1), Duration::from_millis(50));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(300));
        assert_eq!(policy.backoff_for(9), Duration::from_millis(300));
    }

    #[test]
    fn test_temp_path_is_sibling_and_hidden() {
        let target = Path::new("/data/out/progress.json");
        let tmp = temp_path_for(target);

        assert_eq!(tmp.parent(), target.parent());
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".progress.json."));
        assert!(name.ends_with(".tmp"));
    }
}
