//! Unified error types for aaremu

use std::io;
use thiserror::Error;

/// Main error type for recording and playback operations
#[derive(Error, Debug)]
pub enum AaremuError {
    /// Producer queue full - frame dropped
    #[error("Backpressure: frame queue full, frame at {timestamp}ms dropped")]
    Backpressure { timestamp: i64 },

    /// One record could not be written - record skipped
    #[error("Failed to write frame at {timestamp}ms: {source}")]
    WriteFailure {
        timestamp: i64,
        #[source]
        source: io::Error,
    },

    /// No populated bucket within tolerance of the query bearing
    #[error("No frame within tolerance of bearing {bearing:.1}")]
    Gap { bearing: f32 },

    /// Store is empty or uninitialized
    #[error("Recording contains no frames")]
    NotFound,

    /// Reading the backing store failed during playback
    #[error("Frame store I/O failure: {0}")]
    StoreIo(#[source] io::Error),

    /// Backing store content could not be parsed
    #[error("Corrupt recording '{path}': {message}")]
    CorruptStore { path: String, message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current state
    #[error("Invalid state transition: cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: String,
    },

    /// Session already running
    #[error("Session already running")]
    AlreadyRunning,

    /// Thread communication error
    #[error("Thread communication error: {0}")]
    ChannelError(String),

    /// Generic I/O error outside a running session
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for aaremu operations
pub type Result<T> = std::result::Result<T, AaremuError>;

impl AaremuError {
    /// Create a corrupt store error with context
    pub fn corrupt(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptStore {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid state error for a rejected transition
    pub fn invalid_state(action: &'static str, state: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            action,
            state: format!("{:?}", state),
        }
    }

    /// Check if this error is recoverable (session can continue)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AaremuError::Backpressure { .. }
                | AaremuError::WriteFailure { .. }
                | AaremuError::Gap { .. }
                | AaremuError::NotFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(AaremuError::Backpressure { timestamp: 1 }.is_recoverable());
        assert!(AaremuError::Gap { bearing: 10.0 }.is_recoverable());
        assert!(AaremuError::NotFound.is_recoverable());
        assert!(!AaremuError::StoreIo(io::Error::new(io::ErrorKind::Other, "x")).is_recoverable());
        assert!(!AaremuError::AlreadyRunning.is_recoverable());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = AaremuError::invalid_state("pause", "Idle");
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot pause while \"Idle\""
        );
    }
}
