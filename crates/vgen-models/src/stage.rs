//! Pipeline stages and per-stage attempt records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::provider::Capability;

/// One step of the generation pipeline. Stages run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Script,
    Voice,
    Visuals,
    Render,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Script, Stage::Voice, Stage::Visuals, Stage::Render];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Script => "script",
            Stage::Voice => "voice",
            Stage::Visuals => "visuals",
            Stage::Render => "render",
        }
    }

    /// Provider capability serving this stage. Render is served by the
    /// export service, not by a provider.
    pub fn capability(&self) -> Option<Capability> {
        match self {
            Stage::Script => Some(Capability::Script),
            Stage::Voice => Some(Capability::Voice),
            Stage::Visuals => Some(Capability::Visual),
            Stage::Render => None,
        }
    }

    /// Overall progress range `[start, end)` covered by this stage.
    pub fn progress_range(&self) -> (u8, u8) {
        match self {
            Stage::Script => (0, 25),
            Stage::Voice => (25, 50),
            Stage::Visuals => (50, 75),
            Stage::Render => (75, 100),
        }
    }

    /// Map a stage-local percentage onto the overall job percentage.
    pub fn scale(&self, local_percent: f64) -> u8 {
        let (start, end) = self.progress_range();
        let local = local_percent.clamp(0.0, 100.0) / 100.0;
        (start as f64 + (end - start) as f64 * local).round() as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Failed,
}

/// Record of one stage attempt against one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageRecord {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub outcome: StageOutcome,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(
        stage: Stage,
        provider: impl Into<String>,
        outcome: StageOutcome,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            provider: Some(provider.into()),
            outcome,
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// Record for a stage that has no provider (render, or selection failure).
    pub fn without_provider(stage: Stage, outcome: StageOutcome, message: impl Into<String>) -> Self {
        Self {
            stage,
            provider: None,
            outcome,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
