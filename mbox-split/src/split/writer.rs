//! Part file writer
//!
//! Appends whole messages to the active `part_<N>.mbox` file and rotates to
//! the next part once it holds `capacity` messages. A sealed part is flushed,
//! synced and never written again.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::error::{Result, SplitError};
use crate::utils::durable::{retry_with_backoff, RetryPolicy};

const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// File name of the 1-based part `index`
pub fn part_file_name(index: u64) -> String {
    format!("part_{}.mbox", index)
}

/// Part index encoded in a part file name, if it is one
pub fn parse_part_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("part_")?
        .strip_suffix(".mbox")?
        .parse()
        .ok()
}

/// A closed part and the messages it holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPart {
    pub index: u64,
    /// 1-based number of the first message in the part
    pub first_message: u64,
    /// 1-based number of the last message in the part
    pub last_message: u64,
    pub message_count: u64,
    pub bytes: u64,
    pub path: PathBuf,
}

/// Writer owning the active part file
pub struct PartWriter {
    output_dir: PathBuf,
    capacity: u64,
    retry: RetryPolicy,
    index: u64,
    message_count: u64,
    bytes_written: u64,
    path: PathBuf,
    file: BufWriter<File>,
}

impl PartWriter {
    /// Open part `index` empty, replacing any previous content
    pub async fn open(output_dir: &Path, capacity: u64, index: u64, retry: RetryPolicy) -> Result<Self> {
        check_capacity(capacity)?;

        let path = output_dir.join(part_file_name(index));
        let file = open_part_file(&path, &retry, true).await?;

        debug!(part = index, path = %path.display(), "Opened part");

        Ok(PartWriter {
            output_dir: output_dir.to_path_buf(),
            capacity,
            retry,
            index,
            message_count: 0,
            bytes_written: 0,
            path,
            file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
        })
    }

    /// Reopen a partially filled part.
    ///
    /// The file is cut back to `bytes_written`, dropping anything appended
    /// after the checkpoint that recorded it.
    pub async fn resume(
        output_dir: &Path,
        capacity: u64,
        index: u64,
        message_count: u64,
        bytes_written: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        check_capacity(capacity)?;

        if message_count >= capacity {
            return Err(SplitError::CorruptCheckpoint(format!(
                "part {} cannot already hold {} of {} messages",
                index, message_count, capacity
            )));
        }

        let path = output_dir.join(part_file_name(index));
        let mut file = open_part_file(&path, &retry, false).await?;

        let on_disk = file
            .metadata()
            .await
            .map_err(|source| output_error(&path, source))?
            .len();

        if on_disk < bytes_written {
            return Err(SplitError::CorruptCheckpoint(format!(
                "{} holds {} bytes, checkpoint expects {}",
                path.display(),
                on_disk,
                bytes_written
            )));
        }

        if on_disk > bytes_written {
            warn!(
                part = index,
                discarded = on_disk - bytes_written,
                "Discarding bytes written after the last checkpoint"
            );
            file.set_len(bytes_written)
                .await
                .map_err(|source| output_error(&path, source))?;
        }

        file.seek(SeekFrom::Start(bytes_written))
            .await
            .map_err(|source| output_error(&path, source))?;

        debug!(part = index, message_count, bytes_written, "Reopened part");

        Ok(PartWriter {
            output_dir: output_dir.to_path_buf(),
            capacity,
            retry,
            index,
            message_count,
            bytes_written,
            path,
            file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
        })
    }

    /// Append one message's raw bytes.
    ///
    /// The message only counts once every byte has been handed to the file.
    pub async fn append(&mut self, message: &[u8]) -> Result<()> {
        self.file
            .write_all(message)
            .await
            .map_err(|source| output_error(&self.path, source))?;

        self.message_count += 1;
        self.bytes_written += message.len() as u64;
        Ok(())
    }

    /// True once the active part holds `capacity` messages
    pub fn should_rotate(&self) -> bool {
        self.message_count >= self.capacity
    }

    /// Seal the active part and open the next one
    pub async fn rotate(&mut self) -> Result<SealedPart> {
        self.flush_and_sync().await?;
        let sealed = self.sealed();

        let next_index = self.index + 1;
        let next_path = self.output_dir.join(part_file_name(next_index));
        let next_file = open_part_file(&next_path, &self.retry, true).await?;

        // The previous handle is dropped here, after its data was synced
        self.file = BufWriter::with_capacity(WRITE_BUFFER_SIZE, next_file);
        self.index = next_index;
        self.path = next_path;
        self.message_count = 0;
        self.bytes_written = 0;

        debug!(part = next_index, "Rotated to next part");
        Ok(sealed)
    }

    /// Flush buffered bytes and sync file data to storage
    pub async fn sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|source| output_error(&self.path, source))?;
        self.file
            .get_ref()
            .sync_data()
            .await
            .map_err(|source| output_error(&self.path, source))
    }

    /// Close the active part without sealing it; it stays resumable
    pub async fn close(mut self) -> Result<()> {
        self.flush_and_sync().await?;
        debug!(part = self.index, messages = self.message_count, "Closed partial part");
        Ok(())
    }

    /// Close the active part at end of input.
    ///
    /// Returns `None` when the part holds no message. An empty part after
    /// the first one only exists because the previous part filled up
    /// exactly, so its file is removed.
    pub async fn finalize(mut self) -> Result<Option<SealedPart>> {
        self.flush_and_sync().await?;

        if self.message_count > 0 {
            return Ok(Some(self.sealed()));
        }

        if self.index > 1 {
            let PartWriter { file, path, .. } = self;
            drop(file);
            fs::remove_file(&path)
                .await
                .map_err(|source| output_error(&path, source))?;
            debug!(path = %path.display(), "Removed empty trailing part");
        }

        Ok(None)
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush_and_sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|source| output_error(&self.path, source))?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(|source| output_error(&self.path, source))
    }

    fn sealed(&self) -> SealedPart {
        let first_message = (self.index - 1) * self.capacity + 1;
        SealedPart {
            index: self.index,
            first_message,
            last_message: first_message + self.message_count - 1,
            message_count: self.message_count,
            bytes: self.bytes_written,
            path: self.path.clone(),
        }
    }
}

/// Remove part files numbered above `last_index`, left over from an
/// earlier run over different input.
pub async fn remove_parts_after(output_dir: &Path, last_index: u64) -> Result<u64> {
    let mut removed = 0;
    let mut entries = fs::read_dir(output_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(index) = name.to_str().and_then(parse_part_file_name) else {
            continue;
        };

        if index > last_index {
            let path = entry.path();
            fs::remove_file(&path)
                .await
                .map_err(|source| output_error(&path, source))?;
            warn!(path = %path.display(), "Removed stale part file");
            removed += 1;
        }
    }

    Ok(removed)
}

fn check_capacity(capacity: u64) -> Result<()> {
    if capacity == 0 {
        return Err(SplitError::InvalidConfiguration(
            "messages_per_part must be at least 1".to_string(),
        ));
    }
    Ok(())
}

async fn open_part_file(path: &Path, retry: &RetryPolicy, truncate: bool) -> Result<File> {
    retry_with_backoff(retry, "open part", move || async move {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)
            .await
    })
    .await
    .map_err(|source| output_error(path, source))
}

fn output_error(path: &Path, source: std::io::Error) -> SplitError {
    SplitError::OutputUnavailable {
        path: path.to_path_buf(),
        source,
    }
}
