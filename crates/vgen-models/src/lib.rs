//! Shared data models for the VGen backend.
//!
//! This crate provides Serde-serializable types for:
//! - Generation jobs and their state machine
//! - Export (render) jobs linked to a parent job
//! - Provider descriptors, tiers and profiles
//! - Progress events and status snapshots
//! - Tracked subprocess records

pub mod error;
pub mod event;
pub mod export;
pub mod job;
pub mod process;
pub mod provider;
pub mod request;
pub mod stage;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use event::{JobSnapshot, ProgressEvent, ProgressKind};
pub use export::{ExportJob, ExportRequest, ExportStatus};
pub use job::{Job, JobId, JobState};
pub use process::TrackedProcess;
pub use provider::{Capability, ProbeAttempt, ProviderDescriptor, ProviderProfile, ProviderTier};
pub use request::GenerationRequest;
pub use stage::{Stage, StageOutcome, StageRecord};
