//! Error types for media and subprocess operations.

use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while running external processes.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found in PATH")]
    BinaryNotFound(String),

    #[error("{name} failed: {message}")]
    ProcessFailed {
        name: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Invalid render input: {0}")]
    InvalidInput(String),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// Create a process failure error.
    pub fn process_failed(
        name: impl Into<String>,
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::ProcessFailed {
            name: name.into(),
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MediaError::Cancelled)
    }

    /// Exit diagnostics for a failed process, if any.
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            MediaError::ProcessFailed {
                stderr, exit_code, ..
            } => {
                let code = exit_code
                    .map(|c| format!("exit code {c}"))
                    .unwrap_or_else(|| "terminated by signal".to_string());
                Some(match stderr {
                    Some(s) if !s.is_empty() => format!("{code}: {s}"),
                    _ => code,
                })
            }
            _ => None,
        }
    }
}
