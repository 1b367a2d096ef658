//! Final render: stills plus narration into one video.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::histogram;
use tokio_util::sync::CancellationToken;
use tracing::info;

use vgen_models::{ExportRequest, JobId};

use crate::command::FfmpegCommand;
use crate::error::{MediaError, MediaResult};
use crate::progress::{parse_progress_line, FfmpegProgress};
use crate::runner::ProcessRunner;

/// Callback receiving render percentage (0-100).
pub type RenderProgress = Arc<dyn Fn(f64) + Send + Sync>;

/// Per-render context.
#[derive(Clone)]
pub struct RenderContext {
    /// Job the spawned processes are attributed to
    pub job_id: JobId,
    pub cancel: CancellationToken,
    pub on_progress: RenderProgress,
}

impl RenderContext {
    pub fn new(job_id: JobId, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            cancel,
            on_progress: Arc::new(|_: f64| {}),
        }
    }

    pub fn with_progress(mut self, on_progress: RenderProgress) -> Self {
        self.on_progress = on_progress;
        self
    }
}

/// Something that turns an export request into a video file.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render and return the written output path.
    async fn render(&self, request: &ExportRequest, ctx: &RenderContext) -> MediaResult<PathBuf>;
}

/// Check that a request is internally consistent before spawning anything.
pub fn validate_export_request(request: &ExportRequest) -> MediaResult<()> {
    if request.visuals.is_empty() {
        return Err(MediaError::invalid_input("no visuals to render"));
    }
    if request.visuals.len() != request.scene_durations.len() {
        return Err(MediaError::invalid_input(format!(
            "{} visuals but {} scene durations",
            request.visuals.len(),
            request.scene_durations.len()
        )));
    }
    if request.scene_durations.iter().any(|d| !d.is_finite() || *d <= 0.0) {
        return Err(MediaError::invalid_input("scene durations must be positive"));
    }
    if request.output_path.trim().is_empty() {
        return Err(MediaError::invalid_input("output path is empty"));
    }
    Ok(())
}

/// FFmpeg concat-demuxer slideshow renderer.
pub struct SlideshowRenderer {
    runner: ProcessRunner,
    timeout: Option<Duration>,
}

impl SlideshowRenderer {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Concat demuxer script. The last file is repeated so its duration is honoured.
    fn concat_script(request: &ExportRequest) -> String {
        let mut script = String::from("ffconcat version 1.0\n");
        for (path, duration) in request.visuals.iter().zip(&request.scene_durations) {
            script.push_str(&format!("file '{}'\n", escape_concat_path(path)));
            script.push_str(&format!("duration {:.3}\n", duration));
        }
        if let Some(last) = request.visuals.last() {
            script.push_str(&format!("file '{}'\n", escape_concat_path(last)));
        }
        script
    }

    fn build_command(request: &ExportRequest, list_path: &Path) -> FfmpegCommand {
        let scale = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,fps=30",
            w = request.width,
            h = request.height
        );
        FfmpegCommand::new(list_path, &request.output_path)
            .input_args(["-f", "concat", "-safe", "0"])
            .add_input(&request.audio_path)
            .video_filter(scale)
            .video_codec("libx264")
            .pixel_format("yuv420p")
            .audio_codec("aac")
            .shortest()
    }
}

fn escape_concat_path(path: &str) -> String {
    path.replace('\'', "'\\''")
}

#[async_trait]
impl Renderer for SlideshowRenderer {
    async fn render(&self, request: &ExportRequest, ctx: &RenderContext) -> MediaResult<PathBuf> {
        validate_export_request(request)?;

        let output = PathBuf::from(&request.output_path);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let list_path = output.with_extension("ffconcat");
        tokio::fs::write(&list_path, Self::concat_script(request)).await?;

        let mut spec = Self::build_command(request, &list_path).into_spec();
        if let Some(timeout) = self.timeout {
            spec = spec.timeout(timeout);
        }

        let total_ms = (request.total_duration_secs() * 1000.0) as i64;
        let on_progress = Arc::clone(&ctx.on_progress);
        let mut current = FfmpegProgress::default();

        let started = Instant::now();
        let result = self
            .runner
            .run_with_lines(&spec, &ctx.job_id, &ctx.cancel, move |line| {
                if let Some(progress) = parse_progress_line(line, &mut current) {
                    on_progress(progress.percentage(total_ms));
                }
            })
            .await;

        let _ = tokio::fs::remove_file(&list_path).await;
        result?;

        histogram!("vgen_render_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(job_id = %ctx.job_id, output = %output.display(), "Render complete");
        (ctx.on_progress)(100.0);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExportRequest {
        ExportRequest {
            audio_path: "/work/voice.wav".into(),
            visuals: vec!["/work/scene-0.png".into(), "/work/it's.png".into()],
            scene_durations: vec![4.0, 6.5],
            output_path: "/work/out/final.mp4".into(),
            width: 1280,
            height: 720,
        }
    }

    #[test]
    fn test_concat_script_repeats_last_file() {
        let script = SlideshowRenderer::concat_script(&request());
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "ffconcat version 1.0");
        assert_eq!(lines[1], "file '/work/scene-0.png'");
        assert_eq!(lines[2], "duration 4.000");
        assert_eq!(lines[3], "file '/work/it'\\''s.png'");
        assert_eq!(lines[4], "duration 6.500");
        assert_eq!(lines[5], "file '/work/it'\\''s.png'");
    }

    #[test]
    fn test_validate_rejects_mismatched_durations() {
        let mut req = request();
        req.scene_durations.pop();
        assert!(matches!(validate_export_request(&req), Err(MediaError::InvalidInput(_))));

        let mut req = request();
        req.visuals.clear();
        req.scene_durations.clear();
        assert!(validate_export_request(&req).is_err());

        assert!(validate_export_request(&request()).is_ok());
    }

    #[test]
    fn test_build_command_has_both_inputs() {
        let args = SlideshowRenderer::build_command(&request(), Path::new("/work/out/final.ffconcat"))
            .build_args();
        assert!(args.contains(&"/work/voice.wav".to_string()));
        assert!(args.contains(&"/work/out/final.ffconcat".to_string()));
        assert_eq!(args.last().unwrap(), "/work/out/final.mp4");
    }
}
