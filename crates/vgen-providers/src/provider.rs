//! Provider traits and the artifacts they exchange.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vgen_media::ProcessRunner;
use vgen_models::{Capability, GenerationRequest, JobId, ProviderTier};

use crate::error::{ProviderError, ProviderResult};
use crate::probe::ProbeOutcome;

/// Extra time past the kill grace period for a stopped process to be reaped.
const WIND_DOWN_SLACK: Duration = Duration::from_millis(500);

/// Everything a provider needs to do work on behalf of one job.
#[derive(Clone)]
pub struct StageContext {
    pub job_id: JobId,
    /// Per-job scratch directory for generated files
    pub work_dir: PathBuf,
    pub cancel: CancellationToken,
    /// Runner for tracked subprocesses
    pub processes: ProcessRunner,
}

impl StageContext {
    pub fn new(
        job_id: JobId,
        work_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
        processes: ProcessRunner,
    ) -> Self {
        Self {
            job_id,
            work_dir: work_dir.into(),
            cancel,
            processes,
        }
    }

    /// Fail fast if the job was cancelled.
    pub fn check_cancelled(&self) -> ProviderResult<()> {
        if self.cancel.is_cancelled() {
            Err(ProviderError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Race `fut` against cancellation, dropping it as soon as the token fires.
    ///
    /// For network calls and other work that owns no subprocess.
    pub async fn interruptible<F, T>(&self, fut: F) -> ProviderResult<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProviderError::Cancelled),
            result = fut => result,
        }
    }

    /// Drive `fut` until it finishes or the job is cancelled.
    ///
    /// After cancellation `fut` keeps being polled for the registry's grace
    /// period, so tracked processes it spawned get their SIGTERM and a chance
    /// to exit before the stage is dropped. The result is
    /// [`ProviderError::Cancelled`] whenever the token fires first.
    pub async fn cancellable<F, T>(&self, fut: F) -> ProviderResult<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        self.check_cancelled()?;
        tokio::pin!(fut);
        tokio::select! {
            result = &mut fut => return result,
            _ = self.cancel.cancelled() => {}
        }

        let wind_down = self.processes.registry().grace_period() + WIND_DOWN_SLACK;
        if tokio::time::timeout(wind_down, &mut fut).await.is_err() {
            debug!(job_id = %self.job_id, "Stage did not stop within {:?}, dropping it", wind_down);
        }
        Err(ProviderError::Cancelled)
    }
}

/// Common surface of every provider.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    fn tier(&self) -> ProviderTier;

    /// Liveness check. Implementations should be cheap; the selector
    /// bounds the call with its own timeout regardless.
    async fn probe(&self) -> ProbeOutcome;
}

/// One scene of a generated script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub index: usize,
    pub narration: String,
    /// Prompt for the scene's still image
    pub visual_prompt: String,
    pub duration_secs: f64,
}

/// A generated script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    pub scenes: Vec<Scene>,
}

impl Script {
    /// Full narration text, one scene per paragraph.
    pub fn narration(&self) -> String {
        self.scenes
            .iter()
            .map(|s| s.narration.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn total_duration_secs(&self) -> f64 {
        self.scenes.iter().map(|s| s.duration_secs).sum()
    }

    pub fn scene_durations(&self) -> Vec<f64> {
        self.scenes.iter().map(|s| s.duration_secs).collect()
    }

    /// Reject scripts that downstream stages cannot use.
    pub fn ensure_usable(&self, provider: &str) -> ProviderResult<()> {
        if self.scenes.is_empty() {
            return Err(ProviderError::invalid_response(provider, "script has no scenes"));
        }
        if self.narration().is_empty() {
            return Err(ProviderError::invalid_response(provider, "script has no narration"));
        }
        Ok(())
    }
}

/// Synthesized narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceTrack {
    pub path: PathBuf,
    pub duration_secs: f64,
}

/// A still image for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualAsset {
    pub scene_index: usize,
    pub path: PathBuf,
}

/// Writes a script from a brief.
#[async_trait]
pub trait ScriptProvider: Provider {
    async fn generate_script(
        &self,
        request: &GenerationRequest,
        ctx: &StageContext,
    ) -> ProviderResult<Script>;
}

/// Turns narration text into audio.
#[async_trait]
pub trait VoiceProvider: Provider {
    async fn synthesize(&self, script: &Script, ctx: &StageContext) -> ProviderResult<VoiceTrack>;
}

/// Produces one still per scene.
#[async_trait]
pub trait VisualProvider: Provider {
    async fn generate_visuals(
        &self,
        script: &Script,
        ctx: &StageContext,
    ) -> ProviderResult<Vec<VisualAsset>>;
}

/// Registered providers per capability, in registration order.
#[derive(Clone, Default)]
pub struct ProviderSet {
    pub script: Vec<Arc<dyn ScriptProvider>>,
    pub voice: Vec<Arc<dyn VoiceProvider>>,
    pub visual: Vec<Arc<dyn VisualProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, provider: Arc<dyn ScriptProvider>) -> Self {
        self.script.push(provider);
        self
    }

    pub fn with_voice(mut self, provider: Arc<dyn VoiceProvider>) -> Self {
        self.voice.push(provider);
        self
    }

    pub fn with_visual(mut self, provider: Arc<dyn VisualProvider>) -> Self {
        self.visual.push(provider);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::Instant;
    use vgen_media::ProcessRegistry;

    fn context(grace: Duration) -> StageContext {
        StageContext::new(
            JobId::from_string("job-ctx"),
            "/tmp/vgen-ctx",
            CancellationToken::new(),
            ProcessRunner::new(Arc::new(ProcessRegistry::new(grace))),
        )
    }

    fn cancel_soon(ctx: &StageContext) {
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
    }

    #[tokio::test]
    async fn test_cancellable_skips_work_once_cancelled() {
        let ctx = context(Duration::from_millis(100));
        ctx.cancel.cancel();
        let polled = AtomicBool::new(false);
        let result = ctx
            .cancellable(async {
                polled.store(true, Ordering::SeqCst);
                Ok::<_, ProviderError>(())
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert!(!polled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_interruptible_drops_work_immediately() {
        let ctx = context(Duration::from_secs(5));
        cancel_soon(&ctx);

        let started = Instant::now();
        let result = ctx
            .interruptible(std::future::pending::<ProviderResult<()>>())
            .await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancellable_passes_through_results() {
        let ctx = context(Duration::from_millis(100));
        let value = ctx.cancellable(async { Ok::<_, ProviderError>(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancellable_lets_work_wind_down_after_cancel() {
        let ctx = context(Duration::from_millis(500));
        let cleaned_up = Arc::new(AtomicBool::new(false));

        let token = ctx.cancel.clone();
        let flag = Arc::clone(&cleaned_up);
        let work = async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, ProviderError>(())
        };

        cancel_soon(&ctx);
        let result = ctx.cancellable(work).await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancellable_drops_work_after_grace_period() {
        let ctx = context(Duration::from_millis(100));
        cancel_soon(&ctx);

        let started = Instant::now();
        let result = ctx
            .cancellable(std::future::pending::<ProviderResult<()>>())
            .await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    fn scene(index: usize, narration: &str, duration_secs: f64) -> Scene {
        Scene {
            index,
            narration: narration.into(),
            visual_prompt: format!("scene {index}"),
            duration_secs,
        }
    }

    #[test]
    fn test_script_helpers() {
        let script = Script {
            title: "Tides".into(),
            scenes: vec![scene(0, "The moon pulls.", 4.0), scene(1, "  ", 2.0), scene(2, "Water rises.", 6.0)],
        };
        assert_eq!(script.narration(), "The moon pulls.\n\nWater rises.");
        assert_eq!(script.total_duration_secs(), 12.0);
        assert_eq!(script.scene_durations(), vec![4.0, 2.0, 6.0]);
        assert!(script.ensure_usable("test").is_ok());
    }

    #[test]
    fn test_empty_script_unusable() {
        let script = Script {
            title: "Empty".into(),
            scenes: vec![],
        };
        assert!(matches!(
            script.ensure_usable("test"),
            Err(ProviderError::InvalidResponse { .. })
        ));
    }
}
