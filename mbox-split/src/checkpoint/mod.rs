//! Checkpoint module
//!
//! Durable resume position for a split run: how many messages are fully
//! written, and where in the input the next unconsumed message starts.

pub mod store;
pub mod types;

pub use store::{CheckpointStore, SaveOutcome};
pub use types::Checkpoint;
