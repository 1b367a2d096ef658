//! Persisted queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vgen_models::{GenerationRequest, JobId};

/// Lifecycle of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting to be dispatched
    Pending,
    /// Handed to a job runner
    Dispatched,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Dispatched => "dispatched",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Failed)
    }
}

/// One persisted generation request.
///
/// Entries are stored whole; re-reading one after a crash yields the same
/// request, retry count and dispatch state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry_id: String,
    pub request: GenerationRequest,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: EntryStatus,

    /// Not dispatched before this instant (retry backoff)
    pub available_at: DateTime<Utc>,

    /// Job created for the current dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,

    /// Last liveness signal from the worker running the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Last failure (kept across retries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueEntry {
    pub fn new(request: GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            entry_id: Uuid::new_v4().to_string(),
            request,
            enqueued_at: now,
            retry_count: 0,
            status: EntryStatus::Pending,
            available_at: now,
            job_id: None,
            dispatched_at: None,
            heartbeat_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }

    /// Most recent sign of life while dispatched.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.heartbeat_at.or(self.dispatched_at)
    }

    pub(crate) fn dispatch(&mut self, job_id: &JobId) {
        let now = Utc::now();
        self.status = EntryStatus::Dispatched;
        self.job_id = Some(job_id.clone());
        self.dispatched_at = Some(now);
        self.heartbeat_at = Some(now);
    }

    pub(crate) fn finish(&mut self, status: EntryStatus, error: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
    }

    pub(crate) fn requeue(&mut self, error: &str, available_at: DateTime<Utc>) {
        self.status = EntryStatus::Pending;
        self.retry_count += 1;
        self.available_at = available_at;
        self.job_id = None;
        self.dispatched_at = None;
        self.heartbeat_at = None;
        self.error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_lifecycle() {
        let mut entry = QueueEntry::new(GenerationRequest::new("Volcanoes", 30));
        assert!(entry.is_pending());
        assert!(entry.last_seen().is_none());

        let job_id = JobId::new();
        entry.dispatch(&job_id);
        assert_eq!(entry.status, EntryStatus::Dispatched);
        assert_eq!(entry.job_id.as_ref(), Some(&job_id));
        assert!(entry.last_seen().is_some());

        entry.requeue("worker lost", Utc::now());
        assert!(entry.is_pending());
        assert_eq!(entry.retry_count, 1);
        assert!(entry.job_id.is_none());
        assert_eq!(entry.error.as_deref(), Some("worker lost"));

        entry.finish(EntryStatus::Completed, None);
        assert!(entry.status.is_finished());
        assert_eq!(entry.error.as_deref(), Some("worker lost"));
    }

    #[test]
    fn test_entry_json_is_rereadable() {
        let entry = QueueEntry::new(GenerationRequest::new("Volcanoes", 30));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
