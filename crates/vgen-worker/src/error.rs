//! Worker error types.

use thiserror::Error;

use vgen_media::MediaError;
use vgen_models::{JobState, ModelError, Stage};
use vgen_providers::ProviderError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// A caller of an internal API broke a precondition.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("{stage} stage failed: {message}")]
    StageFailed { stage: Stage, message: String },

    #[error("Job is already {0}")]
    AlreadyFinal(JobState),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Provider error: {0}")]
    Provider(ProviderError),

    #[error("Media error: {0}")]
    Media(MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] vgen_queue::QueueError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn stage_failed(stage: Stage, msg: impl Into<String>) -> Self {
        Self::StageFailed {
            stage,
            message: msg.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Cancellation is a terminal outcome, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WorkerError::NotFound(_))
    }

    /// Check if error is retryable by requeueing the whole request.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Provider(e) => e.is_transient(),
            WorkerError::Queue(_) | WorkerError::Io(_) => true,
            _ => false,
        }
    }
}

impl From<ProviderError> for WorkerError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => WorkerError::Cancelled,
            ProviderError::InvalidInput(msg) => WorkerError::InvalidInput(msg),
            other => WorkerError::Provider(other),
        }
    }
}

impl From<MediaError> for WorkerError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::Cancelled => WorkerError::Cancelled,
            MediaError::InvalidInput(msg) => WorkerError::InvalidInput(msg),
            other => WorkerError::Media(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_not_wrapped() {
        assert!(WorkerError::from(ProviderError::Cancelled).is_cancelled());
        assert!(WorkerError::from(MediaError::Cancelled).is_cancelled());
        assert!(!WorkerError::invalid_input("bad").is_cancelled());
    }

    #[test]
    fn test_invalid_input_is_flattened() {
        let err = WorkerError::from(ProviderError::invalid_input("empty brief"));
        assert!(matches!(err, WorkerError::InvalidInput(ref m) if m == "empty brief"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_stage_failure_message() {
        let err = WorkerError::stage_failed(Stage::Voice, "piper exited with status 1");
        assert_eq!(err.to_string(), "voice stage failed: piper exited with status 1");
    }
}
