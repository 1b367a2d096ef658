//! Subprocess plumbing for the generation pipeline.
//!
//! This crate provides:
//! - A registry of OS processes spawned on behalf of jobs
//! - A tracked process runner with cancellation and timeouts
//! - Type-safe FFmpeg command building and `-progress pipe:2` parsing
//! - The slideshow renderer used by the export stage

pub mod command;
pub mod error;
pub mod progress;
pub mod registry;
pub mod render;
pub mod runner;

pub use command::{check_ffmpeg, FfmpegCommand};
pub use error::{MediaError, MediaResult};
pub use progress::FfmpegProgress;
pub use registry::{KillOutcome, ProcessRegistry, DEFAULT_GRACE_PERIOD};
pub use render::{validate_export_request, RenderContext, RenderProgress, Renderer, SlideshowRenderer};
pub use runner::{ProcessOutput, ProcessRunner, ProcessSpec};
