//! Generation job definitions and lifecycle state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};
use crate::stage::{Stage, StageRecord};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle state.
///
/// `Queued -> Running -> {Completed | Failed | Cancelled}`. The three
/// right-hand states are terminal. A queued job may also be cancelled or
/// failed before it ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running)
            | (JobState::Queued, JobState::Failed)
            | (JobState::Queued, JobState::Cancelled) => true,
            (JobState::Running, JobState::Completed)
            | (JobState::Running, JobState::Failed)
            | (JobState::Running, JobState::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generation job tracked by the runner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Cross-system tracing identifier
    pub correlation_id: String,

    /// Current lifecycle state
    #[serde(default)]
    pub state: JobState,

    /// Progress (0-100)
    #[serde(default)]
    pub progress: u8,

    /// Stage currently executing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,

    /// Ordered record of completed/failed stage attempts
    #[serde(default)]
    pub stages: Vec<StageRecord>,

    /// Final rendered artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    /// Error message (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Started at timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Completed at timestamp (set on any terminal state)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(correlation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            correlation_id: correlation_id.into(),
            state: JobState::Queued,
            progress: 0,
            current_stage: None,
            stages: Vec::new(),
            output_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, next: JobState) -> ModelResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
            self.current_stage = None;
        }
        Ok(())
    }

    /// Move a queued job to running.
    pub fn start(&mut self) -> ModelResult<()> {
        self.transition(JobState::Running)?;
        self.started_at = Some(self.updated_at);
        Ok(())
    }

    /// Mark the job as completed with its output artifact.
    pub fn complete(&mut self, output_path: impl Into<String>) -> ModelResult<()> {
        let output_path = output_path.into();
        if output_path.trim().is_empty() {
            return Err(ModelError::validation(
                "completed job requires a non-empty output path",
            ));
        }
        self.transition(JobState::Completed)?;
        self.progress = 100;
        self.output_path = Some(output_path);
        Ok(())
    }

    /// Mark the job as failed.
    pub fn fail(&mut self, error: impl Into<String>) -> ModelResult<()> {
        self.transition(JobState::Failed)?;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Mark the job as cancelled.
    pub fn cancel(&mut self) -> ModelResult<()> {
        self.transition(JobState::Cancelled)
    }

    /// Update progress. Progress never moves backwards.
    pub fn set_progress(&mut self, stage: Option<Stage>, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
        if stage.is_some() {
            self.current_stage = stage;
        }
        self.updated_at = Utc::now();
    }

    /// Append a stage attempt to the job record.
    pub fn record_stage(&mut self, record: StageRecord) {
        self.stages.push(record);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageOutcome;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_job_state_transitions() {
        let mut job = Job::new("corr-1");
        assert_eq!(job.state, JobState::Queued);

        assert_ok!(job.start());
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());

        assert_ok!(job.complete("/tmp/out.mp4"));
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            for next in [
                JobState::Queued,
                JobState::Running,
                JobState::Completed,
                JobState::Failed,
                JobState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_cannot_leave_cancelled() {
        let mut job = Job::new("corr-1");
        job.start().unwrap();
        job.cancel().unwrap();

        let err = job.fail("late failure").unwrap_err();
        assert_eq!(
            err,
            ModelError::InvalidTransition {
                from: JobState::Cancelled,
                to: JobState::Failed
            }
        );
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn test_complete_requires_output() {
        let mut job = Job::new("corr-1");
        assert_ok!(job.start());
        assert_err!(job.complete("  "));
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let mut job = Job::new("corr-1");
        job.set_progress(Some(Stage::Voice), 40);
        job.set_progress(None, 20);
        assert_eq!(job.progress, 40);
        assert_eq!(job.current_stage, Some(Stage::Voice));

        job.set_progress(None, 250);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_stage_records_keep_order() {
        let mut job = Job::new("corr-1");
        job.record_stage(StageRecord::new(Stage::Script, "ollama", StageOutcome::Failed, "timeout"));
        job.record_stage(StageRecord::new(Stage::Script, "template", StageOutcome::Completed, "ok"));
        let providers: Vec<_> = job.stages.iter().map(|s| s.provider.as_deref()).collect();
        assert_eq!(providers, vec![Some("ollama"), Some("template")]);
    }
}
