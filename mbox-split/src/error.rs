use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Input unavailable: {}: {source}", path.display())]
    InputUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("Output unavailable: {}: {source}", path.display())]
    OutputUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed message boundary at bytes {start_offset}..{end_offset}: {reason}")]
    MalformedMessageBoundary {
        start_offset: u64,
        end_offset: u64,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Coarse classification of a [`SplitError`], used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfiguration,
    InputUnavailable,
    CorruptCheckpoint,
    OutputUnavailable,
    MalformedMessageBoundary,
    Io,
    Encoding,
}

impl SplitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SplitError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            SplitError::InputUnavailable { .. } => ErrorKind::InputUnavailable,
            SplitError::CorruptCheckpoint(_) => ErrorKind::CorruptCheckpoint,
            SplitError::OutputUnavailable { .. } => ErrorKind::OutputUnavailable,
            SplitError::MalformedMessageBoundary { .. } => ErrorKind::MalformedMessageBoundary,
            SplitError::Io(_) => ErrorKind::Io,
            SplitError::Encoding(_) => ErrorKind::Encoding,
        }
    }

    /// True for errors raised before any streaming starts (bad configuration or input).
    pub fn is_preflight(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidConfiguration | ErrorKind::InputUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidConfiguration => write!(f, "InvalidConfiguration"),
            ErrorKind::InputUnavailable => write!(f, "InputUnavailable"),
            ErrorKind::CorruptCheckpoint => write!(f, "CorruptCheckpoint"),
            ErrorKind::OutputUnavailable => write!(f, "OutputUnavailable"),
            ErrorKind::MalformedMessageBoundary => write!(f, "MalformedMessageBoundary"),
            ErrorKind::Io => write!(f, "Io"),
            ErrorKind::Encoding => write!(f, "Encoding"),
        }
    }
}

pub type Result<T> = std::result::Result<T, SplitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let err = SplitError::InvalidConfiguration("messages_per_part must be >= 1".to_string());
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(err.is_preflight());

        let err = SplitError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!err.is_preflight());
    }

    #[test]
    fn test_error_display_includes_path() {
        let err = SplitError::OutputUnavailable {
            path: PathBuf::from("/tmp/out/part_3.mbox"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let text = err.to_string();
        assert!(text.contains("part_3.mbox"));
        assert!(text.contains("denied"));
    }
}
