//! Provider error types.

use thiserror::Error;

use vgen_media::MediaError;
use vgen_models::{Capability, ProbeAttempt};

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// No live candidate exists for a capability.
///
/// Carries every candidate that was considered, with the reason it was
/// rejected, so the failure can be explained to the caller.
#[derive(Debug, Clone, Error)]
#[error("no {capability} provider available (attempted: {})", format_attempts(.attempts))]
pub struct NoProviderAvailable {
    pub capability: Capability,
    pub attempts: Vec<ProbeAttempt>,
}

fn format_attempts(attempts: &[ProbeAttempt]) -> String {
    if attempts.is_empty() {
        return "none registered".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by providers and provider selection.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Unavailable(#[from] NoProviderAvailable),

    #[error("{provider}: {message}")]
    Transient { provider: String, message: String },

    #[error("{provider} rejected the request (HTTP {status}): {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider} returned an invalid response: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Process error: {0}")]
    Process(MediaError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn invalid_response(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Map a transport-level reqwest failure.
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::invalid_response(provider, err.to_string())
        } else {
            Self::transient(provider, err.to_string())
        }
    }

    /// Whether the next provider in the chain should be tried.
    ///
    /// Input errors would fail identically on every provider and
    /// cancellation must stop the chain.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, ProviderError::InvalidInput(_) | ProviderError::Cancelled)
    }

    /// Whether the provider itself should be considered unhealthy.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transient { .. } | ProviderError::Io(_) => true,
            ProviderError::Rejected { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Process(e) => !matches!(e, MediaError::InvalidInput(_)),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    /// Exit diagnostics for subprocess failures.
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            ProviderError::Process(e) => e.diagnostics(),
            _ => None,
        }
    }
}

impl From<MediaError> for ProviderError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::Cancelled => ProviderError::Cancelled,
            MediaError::InvalidInput(msg) => ProviderError::InvalidInput(msg),
            other => ProviderError::Process(other),
        }
    }
}

/// Turn a non-success HTTP response into a [`ProviderError::Rejected`].
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> ProviderResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message: String = body.chars().take(500).collect();
    Err(ProviderError::Rejected {
        provider: provider.to_string(),
        status: status.as_u16(),
        message,
    })
}
