//! Split controller
//!
//! Drives one run: `Initializing → Resuming → Streaming → Finalizing`, ending
//! in `Completed`, `Interrupted` or `Failed`. Whatever stops a run, the same
//! exit path closes the active part and records a checkpoint that never
//! counts a message whose bytes are not durably in its part.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sink::{ProgressSink, SplitEvent};
use super::types::{RunOutcome, SplitReport, SplitState};
use super::writer::{part_file_name, remove_parts_after, PartWriter, SealedPart};
use crate::checkpoint::{Checkpoint, CheckpointStore, SaveOutcome};
use crate::config::SplitConfig;
use crate::error::{Result, SplitError};
use crate::mbox::scanner::{BoundaryScanner, BOUNDARY_MARKER};

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Everything a run holds open while streaming
struct Session {
    scanner: BoundaryScanner<BufReader<File>>,
    writer: PartWriter,
    /// Messages fully appended, across all runs
    written: u64,
    written_this_run: u64,
    /// Last checkpoint known to be durable
    last_checkpoint: Option<Checkpoint>,
}

enum StreamEnd {
    Exhausted,
    Cancelled,
}

/// Orchestrates a resumable split of one input into part files
pub struct SplitController {
    config: SplitConfig,
    store: CheckpointStore,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    state: SplitState,
}

impl SplitController {
    pub fn new(config: SplitConfig, sink: Arc<dyn ProgressSink>, cancel: CancellationToken) -> Self {
        let store = CheckpointStore::new(&config.output_dir, config.retry);
        SplitController {
            config,
            store,
            sink,
            cancel,
            state: SplitState::Initializing,
        }
    }

    pub fn state(&self) -> SplitState {
        self.state
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run the split until the input is exhausted, the token is cancelled
    /// or an error stops it.
    pub async fn run(&mut self) -> SplitReport {
        let started = Instant::now();
        self.transition(SplitState::Initializing);

        let input_len = match self.initialize().await {
            Ok(len) => len,
            Err(e) => return self.fail_early(e, started),
        };

        self.transition(SplitState::Resuming);
        let mut session = match self.resume(input_len).await {
            Ok(session) => session,
            Err(e) => return self.fail_early(e, started),
        };

        self.transition(SplitState::Streaming);
        match self.stream(&mut session).await {
            Ok(StreamEnd::Exhausted) => {
                self.transition(SplitState::Finalizing);
                self.finalize(session, started).await
            }
            Ok(StreamEnd::Cancelled) => self.interrupt(session, started).await,
            Err(e) => self.abort(session, e, started).await,
        }
    }

    /// Validate configuration, input and output location; returns the input length
    async fn initialize(&self) -> Result<u64> {
        self.config.validate()?;

        let input = &self.config.input_path;
        let metadata = fs::metadata(input)
            .await
            .map_err(|source| input_error(input, source))?;

        if !metadata.is_file() {
            return Err(input_error(
                input,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        // Opening proves the input is readable, not just present
        File::open(input)
            .await
            .map_err(|source| input_error(input, source))?;

        let output = &self.config.output_dir;
        fs::create_dir_all(output).await.map_err(|e| {
            SplitError::InvalidConfiguration(format!(
                "output directory {} cannot be created: {}",
                output.display(),
                e
            ))
        })?;

        let output_meta = fs::metadata(output).await.map_err(|e| {
            SplitError::InvalidConfiguration(format!(
                "output directory {} is not accessible: {}",
                output.display(),
                e
            ))
        })?;
        if !output_meta.is_dir() {
            return Err(SplitError::InvalidConfiguration(format!(
                "output path {} is not a directory",
                output.display()
            )));
        }
        if output_meta.permissions().readonly() {
            return Err(SplitError::InvalidConfiguration(format!(
                "output directory {} is read-only",
                output.display()
            )));
        }

        info!(
            input = %input.display(),
            input_bytes = metadata.len(),
            output = %output.display(),
            messages_per_part = self.config.messages_per_part,
            checkpoint_interval = self.config.checkpoint_interval,
            "Split configured"
        );

        Ok(metadata.len())
    }

    /// Load and verify the checkpoint, then position input and output on it
    async fn resume(&self, input_len: u64) -> Result<Session> {
        let loaded = match self.store.load().await {
            Ok(Some(checkpoint)) => match self.verify_checkpoint(&checkpoint, input_len).await {
                Ok(()) => Some(checkpoint),
                Err(e) => {
                    warn!(kind = %e.kind(), error = %e, "Checkpoint does not match input or parts, starting fresh");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Checkpoint unreadable, starting fresh");
                None
            }
        };

        let capacity = self.config.messages_per_part;
        let writer = match &loaded {
            Some(checkpoint) => {
                PartWriter::resume(
                    &self.config.output_dir,
                    capacity,
                    checkpoint.active_part_index(),
                    checkpoint.messages_in_active_part(),
                    checkpoint.part_bytes_written,
                    self.config.retry,
                )
                .await?
            }
            None => PartWriter::open(&self.config.output_dir, capacity, 1, self.config.retry).await?,
        };

        let start = loaded.clone().unwrap_or_else(|| Checkpoint::fresh(capacity));
        let offset = start.last_consumed_byte_offset;

        let input = &self.config.input_path;
        let mut file = File::open(input)
            .await
            .map_err(|source| input_error(input, source))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| input_error(input, source))?;

        let reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        let scanner = BoundaryScanner::resume(reader, offset, start.last_written_message_index);

        if loaded.is_some() {
            self.sink.emit(SplitEvent::Resumed {
                from_index: start.last_written_message_index,
                from_offset: offset,
            });
        }
        self.sink.emit(SplitEvent::PartOpened { index: writer.index() });

        Ok(Session {
            scanner,
            writer,
            written: start.last_written_message_index,
            written_this_run: 0,
            last_checkpoint: loaded,
        })
    }

    /// Reject checkpoints that would not resume exactly on a message boundary
    async fn verify_checkpoint(&self, checkpoint: &Checkpoint, input_len: u64) -> Result<()> {
        let offset = checkpoint.last_consumed_byte_offset;
        let written = checkpoint.last_written_message_index;

        if checkpoint.messages_per_part != self.config.messages_per_part {
            return Err(corrupt(format!(
                "checkpoint was taken with {} messages per part, run uses {}",
                checkpoint.messages_per_part, self.config.messages_per_part
            )));
        }

        if offset > input_len {
            return Err(corrupt(format!(
                "offset {} is past end of input ({} bytes)",
                offset, input_len
            )));
        }
        if (offset == 0) != (written == 0) {
            return Err(corrupt(format!(
                "offset {} does not fit {} written messages",
                offset, written
            )));
        }
        if offset > 0 && offset < input_len && !self.boundary_at(offset).await {
            return Err(corrupt(format!("offset {} is not at a message boundary", offset)));
        }

        let in_part = checkpoint.messages_in_active_part();
        if (in_part == 0) != (checkpoint.part_bytes_written == 0) {
            return Err(corrupt(format!(
                "{} bytes recorded for {} messages in the active part",
                checkpoint.part_bytes_written, in_part
            )));
        }

        if checkpoint.part_bytes_written > 0 {
            let part = self
                .config
                .output_dir
                .join(part_file_name(checkpoint.active_part_index()));
            let on_disk = fs::metadata(&part)
                .await
                .map(|m| m.len())
                .map_err(|e| corrupt(format!("{}: {}", part.display(), e)))?;
            if on_disk < checkpoint.part_bytes_written {
                return Err(corrupt(format!(
                    "{} holds {} bytes, checkpoint expects {}",
                    part.display(),
                    on_disk,
                    checkpoint.part_bytes_written
                )));
            }
        }

        Ok(())
    }

    /// True when a boundary marker starts a line at `offset`
    async fn boundary_at(&self, offset: u64) -> bool {
        let mut expected = Vec::with_capacity(BOUNDARY_MARKER.len() + 1);
        expected.push(b'\n');
        expected.extend_from_slice(BOUNDARY_MARKER);

        let mut actual = vec![0u8; expected.len()];
        let read = async {
            let mut file = File::open(&self.config.input_path).await?;
            file.seek(SeekFrom::Start(offset - 1)).await?;
            file.read_exact(&mut actual).await?;
            Ok::<(), std::io::Error>(())
        };

        let result = read.await;
        match result {
            Ok(()) => actual == expected,
            Err(e) => {
                debug!(offset, error = %e, "Could not read input at checkpoint offset");
                false
            }
        }
    }

    async fn stream(&self, session: &mut Session) -> Result<StreamEnd> {
        loop {
            // Cancellation is only observed between messages
            if self.cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            let message = match session.scanner.next_message().await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(StreamEnd::Exhausted),
                Err(SplitError::MalformedMessageBoundary {
                    start_offset,
                    end_offset,
                    reason,
                }) => {
                    warn!(start_offset, end_offset, reason = %reason, "Skipping malformed message");
                    self.sink.emit(SplitEvent::MessageSkipped {
                        start_offset,
                        end_offset,
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            session.writer.append(&message.raw_content).await?;
            session.written += 1;
            session.written_this_run += 1;

            self.sink.emit(SplitEvent::MessageWritten {
                index: session.written,
                part: session.writer.index(),
            });

            if session.writer.should_rotate() {
                let sealed = session.writer.rotate().await?;
                self.emit_sealed(&sealed);
                self.sink.emit(SplitEvent::PartOpened {
                    index: session.writer.index(),
                });
            }

            if session.written % self.config.checkpoint_interval == 0 {
                self.checkpoint(session).await?;
            }
        }
    }

    /// Make the active part durable, then record the position after it
    async fn checkpoint(&self, session: &mut Session) -> Result<()> {
        session.writer.sync().await?;

        let checkpoint = Checkpoint::new(
            self.config.messages_per_part,
            session.written,
            session.scanner.resume_offset(),
            session.writer.bytes_written(),
        );
        self.save(&checkpoint).await?;
        session.last_checkpoint = Some(checkpoint);
        Ok(())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let outcome = self.store.save(checkpoint).await?;
        if outcome == SaveOutcome::Backup {
            warn!(
                path = %self.store.backup_path().display(),
                "Checkpoint stored in backup record"
            );
        }

        self.sink.emit(SplitEvent::CheckpointSaved {
            last_written: checkpoint.last_written_message_index,
            offset: checkpoint.last_consumed_byte_offset,
            backup: outcome == SaveOutcome::Backup,
        });
        Ok(())
    }

    async fn finalize(&mut self, session: Session, started: Instant) -> SplitReport {
        let Session {
            scanner,
            writer,
            written,
            written_this_run,
            last_checkpoint,
        } = session;

        let capacity = self.config.messages_per_part;
        let part_bytes = writer.bytes_written();
        // A zero-message input still leaves part_1
        let parts = filled_parts(written, capacity).max(1);

        let finished = async {
            if let Some(sealed) = writer.finalize().await? {
                self.emit_sealed(&sealed);
            }
            remove_parts_after(&self.config.output_dir, parts).await?;

            let checkpoint = Checkpoint::new(capacity, written, scanner.resume_offset(), part_bytes);
            self.save(&checkpoint).await?;
            Ok::<Checkpoint, SplitError>(checkpoint)
        };

        let result = finished.await;
        match result {
            Ok(checkpoint) => {
                self.transition(SplitState::Completed);
                self.sink.emit(SplitEvent::RunCompleted {
                    messages: written,
                    parts,
                });
                SplitReport {
                    outcome: RunOutcome::Completed,
                    messages_written: written,
                    messages_this_run: written_this_run,
                    parts,
                    resume_point: Some(checkpoint),
                    elapsed: started.elapsed(),
                }
            }
            Err(e) => {
                self.transition(SplitState::Failed);
                self.emit_failed(&e);
                SplitReport {
                    outcome: RunOutcome::Failed(e),
                    messages_written: written,
                    messages_this_run: written_this_run,
                    parts,
                    resume_point: last_checkpoint,
                    elapsed: started.elapsed(),
                }
            }
        }
    }

    async fn interrupt(&mut self, session: Session, started: Instant) -> SplitReport {
        let written = session.written;
        let written_this_run = session.written_this_run;
        let parts = filled_parts(written, self.config.messages_per_part);
        let previous = session.last_checkpoint.clone();

        match self.close_and_checkpoint(session).await {
            Ok(checkpoint) => {
                self.transition(SplitState::Interrupted);
                self.sink.emit(SplitEvent::RunInterrupted {
                    resume_index: checkpoint.last_written_message_index,
                    resume_offset: checkpoint.last_consumed_byte_offset,
                });
                SplitReport {
                    outcome: RunOutcome::Interrupted,
                    messages_written: written,
                    messages_this_run: written_this_run,
                    parts,
                    resume_point: Some(checkpoint),
                    elapsed: started.elapsed(),
                }
            }
            Err(e) => {
                self.transition(SplitState::Failed);
                self.emit_failed(&e);
                SplitReport {
                    outcome: RunOutcome::Failed(e),
                    messages_written: written,
                    messages_this_run: written_this_run,
                    parts,
                    resume_point: previous,
                    elapsed: started.elapsed(),
                }
            }
        }
    }

    async fn abort(&mut self, session: Session, error: SplitError, started: Instant) -> SplitReport {
        let written = session.written;
        let written_this_run = session.written_this_run;
        let parts = filled_parts(written, self.config.messages_per_part);
        let previous = session.last_checkpoint.clone();

        let resume_point = match self.close_and_checkpoint(session).await {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(error = %e, "Could not record progress after failure, keeping previous checkpoint");
                previous
            }
        };

        self.transition(SplitState::Failed);
        self.emit_failed(&error);
        SplitReport {
            outcome: RunOutcome::Failed(error),
            messages_written: written,
            messages_this_run: written_this_run,
            parts,
            resume_point,
            elapsed: started.elapsed(),
        }
    }

    /// Close the active part unsealed and checkpoint exactly what it holds.
    ///
    /// No checkpoint is written when the part cannot be made durable, so the
    /// previous one stays authoritative.
    async fn close_and_checkpoint(&self, session: Session) -> Result<Checkpoint> {
        let Session {
            scanner,
            writer,
            written,
            ..
        } = session;

        let capacity = self.config.messages_per_part;
        // After a failed rotation the full part is already synced and the
        // checkpoint points at its successor
        let part_bytes = if writer.should_rotate() {
            0
        } else {
            writer.bytes_written()
        };
        writer.close().await?;

        let checkpoint = Checkpoint::new(capacity, written, scanner.resume_offset(), part_bytes);
        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    fn fail_early(&mut self, error: SplitError, started: Instant) -> SplitReport {
        self.transition(SplitState::Failed);
        self.emit_failed(&error);
        SplitReport {
            outcome: RunOutcome::Failed(error),
            messages_written: 0,
            messages_this_run: 0,
            parts: 0,
            resume_point: None,
            elapsed: started.elapsed(),
        }
    }

    fn emit_sealed(&self, sealed: &SealedPart) {
        self.sink.emit(SplitEvent::PartSealed {
            index: sealed.index,
            first: sealed.first_message,
            last: sealed.last_message,
        });
    }

    fn emit_failed(&self, error: &SplitError) {
        self.sink.emit(SplitEvent::RunFailed {
            kind: error.kind(),
            detail: error.to_string(),
        });
    }

    fn transition(&mut self, next: SplitState) {
        debug!(from = %self.state, to = %next, "Split state change");
        self.state = next;
    }
}

/// Parts holding at least one of `written` messages
fn filled_parts(written: u64, capacity: u64) -> u64 {
    written.div_ceil(capacity.max(1))
}

fn corrupt(reason: String) -> SplitError {
    SplitError::CorruptCheckpoint(reason)
}

fn input_error(path: &Path, source: std::io::Error) -> SplitError {
    SplitError::InputUnavailable {
        path: path.to_path_buf(),
        source,
    }
}
