//! Progress events and status snapshots delivered to subscribers.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, JobState};
use crate::stage::Stage;

/// Kind of progress milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// Job moved to another lifecycle state
    StateChanged,
    /// A stage began
    StageStarted,
    /// A provider was chosen and invoked for a stage
    ProviderAttempt,
    /// A provider attempt failed; fallback may follow
    ProviderFailed,
    /// A provider attempt succeeded
    ProviderSucceeded,
    /// Percentage update within a stage
    Progress,
}

/// A single progress milestone for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Per-job sequence number (monotonically increasing)
    pub seq: u64,
    pub kind: ProgressKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Overall job percentage (0-100)
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, kind: ProgressKind, percent: u8, message: impl Into<String>) -> Self {
        Self {
            job_id,
            seq: 0,
            kind,
            stage: None,
            provider: None,
            percent: percent.min(100),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// Point-in-time view of a job, as delivered to status queries and streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub correlation_id: String,
    pub state: JobState,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Message of the most recent progress event
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Sequence number of the most recent progress event
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn from_job(job: &Job, last_event: Option<&ProgressEvent>) -> Self {
        Self {
            job_id: job.id.clone(),
            correlation_id: job.correlation_id.clone(),
            state: job.state,
            percent: job.progress,
            stage: job.current_stage,
            message: last_event.map(|e| e.message.clone()).unwrap_or_default(),
            output_path: job.output_path.clone(),
            error_message: job.error_message.clone(),
            seq: last_event.map(|e| e.seq).unwrap_or(0),
            updated_at: job.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_from_job() {
        let mut job = Job::new("corr-9");
        job.start().unwrap();
        job.set_progress(Some(Stage::Script), 10);

        let mut event = ProgressEvent::new(job.id.clone(), ProgressKind::Progress, 10, "Writing script")
            .with_stage(Stage::Script);
        event.seq = 3;

        let snap = JobSnapshot::from_job(&job, Some(&event));
        assert_eq!(snap.state, JobState::Running);
        assert_eq!(snap.percent, 10);
        assert_eq!(snap.seq, 3);
        assert_eq!(snap.message, "Writing script");
        assert!(!snap.is_terminal());
    }

    #[test]
    fn test_event_serializes_snake_case() {
        let event = ProgressEvent::new(JobId::from_string("j1"), ProgressKind::ProviderFailed, 5, "down")
            .with_provider("ollama");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "provider_failed");
        assert_eq!(json["provider"], "ollama");
        assert!(json.get("stage").is_none());
    }
}
