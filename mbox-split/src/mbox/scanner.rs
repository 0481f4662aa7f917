//! MBOX boundary scanning
//!
//! Splits a byte stream into messages at lines starting with `From `.
//! Messages are yielded verbatim: nothing is parsed, unescaped or trimmed,
//! so concatenating every message reproduces the scanned bytes exactly.
//!
//! Body lines that begin with `From ` are expected to have been escaped by
//! whoever wrote the archive (`>From `). An unescaped one starts a new
//! message here, as it does for every naive mbox reader.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{Result, SplitError};

/// Marker that starts a message when found at the beginning of a line
pub const BOUNDARY_MARKER: &[u8] = b"From ";

/// Check whether a line (including its terminator) starts a message
pub fn is_boundary_line(line: &[u8]) -> bool {
    line.starts_with(BOUNDARY_MARKER)
}

/// A message found in the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// 0-based position in scan order
    pub sequence_index: u64,
    /// Absolute offset of the first byte
    pub start_offset: u64,
    /// Absolute offset one past the last byte
    pub end_offset: u64,
    /// The raw bytes in `start_offset..end_offset`
    pub raw_content: Vec<u8>,
}

impl Message {
    /// Size of the message in bytes
    pub fn size(&self) -> u64 {
        self.end_offset - self.start_offset
    }
}

struct PendingMessage {
    start_offset: u64,
    bytes: Vec<u8>,
    /// Started mid-stream without a boundary line in front of it
    detached: bool,
}

/// Incremental scanner over an MBOX byte stream
///
/// Offsets are absolute: a scanner created at `start_offset` on a reader
/// already positioned there reports the same offsets a scan from zero would.
pub struct BoundaryScanner<R> {
    reader: R,
    offset: u64,
    next_index: u64,
    pending: Option<PendingMessage>,
    line: Vec<u8>,
    eof: bool,
}

impl<R: AsyncBufRead + Unpin> BoundaryScanner<R> {
    /// Scan from the start of a stream
    pub fn new(reader: R) -> Self {
        Self::resume(reader, 0, 0)
    }

    /// Scan a reader already positioned at `start_offset`, numbering the
    /// first message found there `first_index`.
    pub fn resume(reader: R, start_offset: u64, first_index: u64) -> Self {
        Self {
            reader,
            offset: start_offset,
            next_index: first_index,
            pending: None,
            line: Vec::new(),
            eof: false,
        }
    }

    /// Offset of the first byte not yet handed out as part of a message.
    ///
    /// Between messages this is the start of the next boundary line, or the
    /// end of the stream once it has been fully consumed.
    pub fn resume_offset(&self) -> u64 {
        self.pending
            .as_ref()
            .map(|p| p.start_offset)
            .unwrap_or(self.offset)
    }

    /// Index the next yielded message will carry
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Read the next complete message.
    ///
    /// Returns `Ok(None)` at end of stream. A `MalformedMessageBoundary`
    /// error covers one skipped fragment; scanning may continue after it.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        while !self.eof {
            self.line.clear();
            let bytes_read = self.reader.read_until(b'\n', &mut self.line).await?;

            if bytes_read == 0 {
                self.eof = true;
                break;
            }

            let line_start = self.offset;
            self.offset += bytes_read as u64;

            if is_boundary_line(&self.line) {
                let next = PendingMessage {
                    start_offset: line_start,
                    bytes: std::mem::take(&mut self.line),
                    detached: false,
                };

                // A boundary closes whatever message was in progress
                if let Some(done) = self.pending.replace(next) {
                    return self.seal(done, line_start).map(Some);
                }
            } else {
                match self.pending.as_mut() {
                    Some(pending) => pending.bytes.extend_from_slice(&self.line),
                    None => {
                        self.pending = Some(PendingMessage {
                            start_offset: line_start,
                            bytes: std::mem::take(&mut self.line),
                            detached: line_start > 0,
                        });
                    }
                }
            }
        }

        match self.pending.take() {
            Some(done) => {
                let end = self.offset;
                self.seal(done, end).map(Some)
            }
            None => Ok(None),
        }
    }

    fn seal(&mut self, done: PendingMessage, end_offset: u64) -> Result<Message> {
        if done.detached {
            return Err(SplitError::MalformedMessageBoundary {
                start_offset: done.start_offset,
                end_offset,
                reason: "content does not begin at a message boundary".to_string(),
            });
        }

        if done.bytes.len() as u64 != end_offset - done.start_offset {
            return Err(SplitError::MalformedMessageBoundary {
                start_offset: done.start_offset,
                end_offset,
                reason: format!(
                    "buffered {} bytes for a {} byte range",
                    done.bytes.len(),
                    end_offset - done.start_offset
                ),
            });
        }

        let message = Message {
            sequence_index: self.next_index,
            start_offset: done.start_offset,
            end_offset,
            raw_content: done.bytes,
        };
        self.next_index += 1;

        Ok(message)
    }
}

/// Count messages in an MBOX stream without buffering them
pub async fn count_messages<R: AsyncBufRead + Unpin>(mut reader: R) -> Result<u64> {
    let mut count = 0u64;
    let mut line = Vec::new();
    let mut first_line = true;

    loop {
        line.clear();
        let bytes_read = reader.read_until(b'\n', &mut line).await?;

        if bytes_read == 0 {
            break;
        }

        // Content before the first boundary forms a message of its own
        if first_line && !is_boundary_line(&line) {
            count += 1;
        }
        first_line = false;

        if is_boundary_line(&line) {
            count += 1;
        }
    }

    Ok(count)
}
