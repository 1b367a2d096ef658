//! Structured job logging utilities.
//!
//! Every line logged on behalf of a job carries its id, the operation and
//! the caller's correlation id, so one request can be followed end to end.

use tracing::{error, info, warn, Span};
use vgen_models::JobId;

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: String,
    correlation_id: String,
}

impl JobLogger {
    /// Create a new job logger for a specific job and operation.
    ///
    /// # Arguments
    /// * `job_id` - The unique identifier for the job
    /// * `operation` - The type of operation (e.g., "generate", "export")
    /// * `correlation_id` - Caller supplied tracing id
    pub fn new(job_id: &JobId, operation: &str, correlation_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }

    /// Log the start of a job operation.
    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            correlation_id = %self.correlation_id,
            "Job started: {}", message
        );
    }

    /// Log a progress update during job execution.
    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            correlation_id = %self.correlation_id,
            "Job progress: {}", message
        );
    }

    /// Log a warning during job execution.
    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = %self.operation,
            correlation_id = %self.correlation_id,
            "Job warning: {}", message
        );
    }

    /// Log an error during job execution.
    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = %self.operation,
            correlation_id = %self.correlation_id,
            "Job error: {}", message
        );
    }

    /// Log a cancelled job. Cancellation is caller-initiated, so info level.
    pub fn log_cancelled(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            correlation_id = %self.correlation_id,
            "Job cancelled: {}", message
        );
    }

    /// Log the completion of a job operation.
    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            correlation_id = %self.correlation_id,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Create a tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = %self.operation,
            correlation_id = %self.correlation_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let job_id = JobId::new();
        let logger = JobLogger::new(&job_id, "generate", "corr-42");

        assert_eq!(logger.job_id(), job_id.to_string());
        assert_eq!(logger.operation(), "generate");
        assert_eq!(logger.correlation_id(), "corr-42");
    }
}
