//! Export (render-only) jobs.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobState};

/// Export jobs share the generation job state machine.
pub type ExportStatus = JobState;

/// Everything the render stage needs; produced by script/voice/visuals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExportRequest {
    /// Narration track
    pub audio_path: String,
    /// Ordered still images, one per scene
    pub visuals: Vec<String>,
    /// Seconds each visual stays on screen (same length as `visuals`)
    pub scene_durations: Vec<f64>,
    /// Where the rendered file is written
    pub output_path: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

impl ExportRequest {
    pub fn total_duration_secs(&self) -> f64 {
        self.scene_durations.iter().sum()
    }
}

/// A render/export job, optionally linked to a parent generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExportJob {
    pub id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<JobId>,
    pub request: ExportRequest,
    pub status: ExportStatus,
    /// Progress (0-100)
    pub percent: u8,
    /// Set if and only if `status == Completed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    pub fn new(request: ExportRequest, parent_job_id: Option<JobId>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            parent_job_id,
            request,
            status: ExportStatus::Queued,
            percent: 0,
            output_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
