//! Video generation worker.
//!
//! This crate provides:
//! - The job runner (script, voice, visuals and render stages with provider fallback)
//! - The export service that owns render jobs
//! - Per-job status with ordered, isolated progress streams
//! - The background queue processor
//! - The [`Orchestrator`] facade tying them together

pub mod broadcast;
pub mod config;
pub mod error;
pub mod export;
pub mod logging;
pub mod metrics;
mod pipeline;
pub mod processor;
pub mod runner;
pub mod service;
pub mod status;

pub use broadcast::{Broadcaster, Subscription};
pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use export::ExportService;
pub use logging::JobLogger;
pub use processor::{MaintenanceReport, QueueProcessor};
pub use runner::{CancelOutcome, JobRunner};
pub use service::{Orchestrator, OrchestratorBuilder};
pub use status::StatusStore;
