//! Model error types.

use thiserror::Error;

use crate::job::JobState;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Invalid request: {0}")]
    Validation(String),
}

impl ModelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
