//! Split module
//!
//! Resumable splitting of an MBOX archive into numbered part files:
//! - [`controller`]: Drives a run and implements the recovery protocol
//! - [`writer`]: Owns the active part file and rotates at capacity
//! - [`sink`]: Observational progress events
//! - [`types`]: Run states and reports

pub mod controller;
pub mod sink;
pub mod types;
pub mod writer;

pub use controller::SplitController;
pub use sink::{ChannelSink, NullSink, ProgressSink, SplitEvent, TracingSink};
pub use types::{RunOutcome, SplitReport, SplitState};
pub use writer::{part_file_name, PartWriter, SealedPart};
