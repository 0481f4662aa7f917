//! mbox-split: Resumable MBOX archive splitter
//!
//! Splits one large MBOX archive into numbered part files holding a fixed
//! number of messages each, and survives interruption without losing or
//! duplicating a message.
//!
//! # Features
//!
//! - **Streaming**: Messages are found by a sequential line scan; the input
//!   is never loaded whole and never modified
//! - **Resumable**: A checkpoint records the written message count and the
//!   byte offset of the next message, so a restart seeks straight there
//! - **Crash-safe**: Checkpoints are replaced atomically and only ever count
//!   bytes already synced to their part file
//!
//! # Example
//!
//! ```no_run
//! use mbox_split::config::SplitConfig;
//! use mbox_split::split::{SplitController, TracingSink};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SplitConfig::new("archive.mbox", "split_output", 1000);
//!     let mut controller = SplitController::new(
//!         config,
//!         Arc::new(TracingSink),
//!         CancellationToken::new(),
//!     );
//!
//!     let report = controller.run().await;
//!     println!("{} messages in {} parts", report.messages_written, report.parts);
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`checkpoint`]: Checkpoint record and durable store
//! - [`mbox`]: Message boundary scanning
//! - [`split`]: Part writer, controller and progress events
//! - [`utils`]: Durable atomic writes

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod mbox;
pub mod split;
pub mod utils;

// Re-export commonly used types
pub use crate::config::{Config, SplitConfig};
pub use crate::error::{ErrorKind, Result, SplitError};
pub use crate::split::{SplitController, SplitReport, SplitState};
