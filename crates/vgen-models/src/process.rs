//! Tracked subprocess records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// An OS process spawned on behalf of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TrackedProcess {
    /// OS process identifier
    pub pid: u32,
    /// Human-readable name (e.g. "ffmpeg", "piper")
    pub name: String,
    /// Owning job
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
}

impl TrackedProcess {
    pub fn new(pid: u32, name: impl Into<String>, job_id: JobId) -> Self {
        Self {
            pid,
            name: name.into(),
            job_id,
            started_at: Utc::now(),
        }
    }
}
