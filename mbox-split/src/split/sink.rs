//! Progress events
//!
//! Sinks observe a run; they never influence it. `emit` is synchronous and
//! must return quickly, so slow consumers drop events instead of stalling
//! the split.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::error::ErrorKind;
use crate::split::writer::part_file_name;

/// Event emitted by the split controller
///
/// Message and part numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitEvent {
    PartOpened { index: u64 },
    MessageWritten { index: u64, part: u64 },
    PartSealed { index: u64, first: u64, last: u64 },
    Resumed { from_index: u64, from_offset: u64 },
    CheckpointSaved { last_written: u64, offset: u64, backup: bool },
    MessageSkipped { start_offset: u64, end_offset: u64 },
    RunCompleted { messages: u64, parts: u64 },
    RunInterrupted { resume_index: u64, resume_offset: u64 },
    RunFailed { kind: ErrorKind, detail: String },
}

/// Receiver of split progress events
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: SplitEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(SplitEvent) + Send + Sync,
{
    fn emit(&self, event: SplitEvent) {
        self(event)
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: SplitEvent) {}
}

/// Renders events as tracing records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: SplitEvent) {
        match event {
            SplitEvent::PartOpened { index } => {
                info!(part = index, "Creating '{}'", part_file_name(index));
            }
            SplitEvent::MessageWritten { index, part } => {
                trace!(message = index, part, "Message written");
            }
            SplitEvent::PartSealed { index, first, last } => {
                info!(
                    part = index,
                    first,
                    last,
                    "File '{}' written: messages {} to {}",
                    part_file_name(index),
                    first,
                    last
                );
            }
            SplitEvent::Resumed { from_index, from_offset } => {
                info!(
                    last_written = from_index,
                    offset = from_offset,
                    "Resuming after message {}",
                    from_index
                );
            }
            SplitEvent::CheckpointSaved { last_written, offset, backup } => {
                debug!(last_written, offset, backup, "Checkpoint saved");
            }
            SplitEvent::MessageSkipped { start_offset, end_offset } => {
                warn!(start_offset, end_offset, "Skipped malformed message");
            }
            SplitEvent::RunCompleted { messages, parts } => {
                info!(messages, parts, "Split completed");
            }
            SplitEvent::RunInterrupted { resume_index, resume_offset } => {
                warn!(resume_index, resume_offset, "Split interrupted, progress saved");
            }
            SplitEvent::RunFailed { kind, detail } => {
                error!(kind = %kind, "Split failed: {}", detail);
            }
        }
    }
}

/// Forwards events over a bounded channel, dropping them when it is full
pub struct ChannelSink {
    tx: mpsc::Sender<SplitEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SplitEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = ChannelSink {
            tx,
            dropped: AtomicU64::new(0),
        };
        (sink, rx)
    }

    /// Events lost because the receiver lagged or was gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: SplitEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
