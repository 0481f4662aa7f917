//! Split run types

use std::fmt;
use std::time::Duration;

use crate::checkpoint::Checkpoint;
use crate::error::SplitError;

/// Lifecycle of a split run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitState {
    /// Validating configuration, input and output location
    Initializing,
    /// Loading the checkpoint and positioning input and output
    Resuming,
    /// Scanning messages and writing parts
    Streaming,
    /// Sealing the last part and writing the final checkpoint
    Finalizing,
    /// Whole input split
    Completed,
    /// Stopped on request, resumable
    Interrupted,
    /// Stopped by an error
    Failed,
}

impl SplitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SplitState::Completed | SplitState::Interrupted | SplitState::Failed
        )
    }
}

impl fmt::Display for SplitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitState::Initializing => write!(f, "Initializing"),
            SplitState::Resuming => write!(f, "Resuming"),
            SplitState::Streaming => write!(f, "Streaming"),
            SplitState::Finalizing => write!(f, "Finalizing"),
            SplitState::Completed => write!(f, "Completed"),
            SplitState::Interrupted => write!(f, "Interrupted"),
            SplitState::Failed => write!(f, "Failed"),
        }
    }
}

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Interrupted,
    Failed(SplitError),
}

/// Summary of a finished run
#[derive(Debug)]
pub struct SplitReport {
    pub outcome: RunOutcome,
    /// Messages written across all runs so far
    pub messages_written: u64,
    /// Messages written by this run
    pub messages_this_run: u64,
    /// Part files holding the written messages
    pub parts: u64,
    /// Last durable checkpoint; where the next run continues
    pub resume_point: Option<Checkpoint>,
    pub elapsed: Duration,
}

impl SplitReport {
    pub fn state(&self) -> SplitState {
        match self.outcome {
            RunOutcome::Completed => SplitState::Completed,
            RunOutcome::Interrupted => SplitState::Interrupted,
            RunOutcome::Failed(_) => SplitState::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }

    pub fn error(&self) -> Option<&SplitError> {
        match &self.outcome {
            RunOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}
