//! Shared fakes for worker integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use vgen_media::{MediaResult, ProcessSpec, RenderContext, Renderer};
use vgen_models::{Capability, ExportRequest, GenerationRequest, ProviderTier};
use vgen_providers::{
    ProbeOutcome, Provider, ProviderError, ProviderResult, ProviderSet, Scene, Script,
    ScriptProvider, StageContext, VisualAsset, VisualProvider, VoiceProvider, VoiceTrack,
};
use vgen_worker::{Orchestrator, WorkerConfig};

/// How a fake provider behaves when asked for work.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    /// Probe reports the provider as down
    Down,
    /// Work fails with an error that allows fallback
    Fail,
    /// Work fails with a transient error
    Flaky,
    /// Work spawns `n` long `sleep` processes and waits on them
    SpawnSleeps(usize),
    /// Work takes this long before succeeding
    Slow(Duration),
    /// Work runs a shell that writes this marker file when sent SIGTERM
    TrapTerm(PathBuf),
}

/// A provider that can stand in for any capability.
pub struct FakeProvider {
    name: String,
    capability: Capability,
    tier: ProviderTier,
    behavior: Behavior,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(name: &str, capability: Capability, tier: ProviderTier, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            capability,
            tier,
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn work(&self, ctx: &StageContext) -> ProviderResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed | Behavior::Down => Ok(()),
            Behavior::Fail => Err(ProviderError::invalid_response(&self.name, "boom")),
            Behavior::Flaky => Err(ProviderError::transient(&self.name, "connection reset")),
            Behavior::Slow(delay) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(*delay) => Ok(()),
                }
            }
            Behavior::SpawnSleeps(n) => {
                let runs = (0..*n).map(|i| {
                    let spec = ProcessSpec::new("sleep")
                        .arg("30")
                        .name(format!("{}-sleep-{}", self.name, i));
                    let ctx = ctx.clone();
                    async move { ctx.processes.run(&spec, &ctx.job_id, &ctx.cancel).await }
                });
                for result in futures_util::future::join_all(runs).await {
                    result?;
                }
                Ok(())
            }
            Behavior::TrapTerm(marker) => {
                let spec = ProcessSpec::new("sh")
                    .arg("-c")
                    .arg("trap 'sleep 0.2; touch \"$0\"; exit 0' TERM; while :; do sleep 0.05; done")
                    .arg(marker.display().to_string())
                    .name(format!("{}-trap", self.name));
                ctx.processes.run(&spec, &ctx.job_id, &ctx.cancel).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn tier(&self) -> ProviderTier {
        self.tier
    }

    async fn probe(&self) -> ProbeOutcome {
        match self.behavior {
            Behavior::Down => ProbeOutcome::down("not installed"),
            _ => ProbeOutcome::up(),
        }
    }
}

#[async_trait]
impl ScriptProvider for FakeProvider {
    async fn generate_script(
        &self,
        request: &GenerationRequest,
        ctx: &StageContext,
    ) -> ProviderResult<Script> {
        self.work(ctx).await?;
        Ok(Script {
            title: request.brief.clone(),
            scenes: (0..2)
                .map(|index| Scene {
                    index,
                    narration: format!("Scene {} about {}", index, request.brief),
                    visual_prompt: format!("picture {}", index),
                    duration_secs: 3.0,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl VoiceProvider for FakeProvider {
    async fn synthesize(&self, _script: &Script, ctx: &StageContext) -> ProviderResult<VoiceTrack> {
        self.work(ctx).await?;
        Ok(VoiceTrack {
            path: ctx.work_dir.join("voice.wav"),
            duration_secs: 6.0,
        })
    }
}

#[async_trait]
impl VisualProvider for FakeProvider {
    async fn generate_visuals(
        &self,
        script: &Script,
        ctx: &StageContext,
    ) -> ProviderResult<Vec<VisualAsset>> {
        self.work(ctx).await?;
        Ok(script
            .scenes
            .iter()
            .map(|scene| VisualAsset {
                scene_index: scene.index,
                path: ctx.work_dir.join(format!("scene-{:03}.png", scene.index)),
            })
            .collect())
    }
}

/// Renderer that reports a little progress and returns the requested path.
pub struct FakeRenderer {
    pub delay: Duration,
    pub fail: bool,
}

impl FakeRenderer {
    pub fn instant() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            fail: true,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, fail: false })
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, request: &ExportRequest, ctx: &RenderContext) -> MediaResult<PathBuf> {
        (ctx.on_progress)(40.0);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(vgen_media::MediaError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        if self.fail {
            return Err(vgen_media::MediaError::internal("encoder exploded"));
        }
        (ctx.on_progress)(100.0);
        Ok(PathBuf::from(&request.output_path))
    }
}

pub fn script_ok() -> Arc<FakeProvider> {
    FakeProvider::new("script-ok", Capability::Script, ProviderTier::Free, Behavior::Succeed)
}

pub fn voice_ok() -> Arc<FakeProvider> {
    FakeProvider::new("voice-ok", Capability::Voice, ProviderTier::Free, Behavior::Succeed)
}

pub fn visual_ok() -> Arc<FakeProvider> {
    FakeProvider::new("visual-ok", Capability::Visual, ProviderTier::Free, Behavior::Succeed)
}

/// A provider set where every stage has one healthy free-tier provider.
pub fn healthy_providers() -> ProviderSet {
    ProviderSet::new()
        .with_script(script_ok())
        .with_voice(voice_ok())
        .with_visual(visual_ok())
}

/// Config rooted in a temp dir with fast polling.
pub fn test_config(dir: &TempDir) -> WorkerConfig {
    WorkerConfig {
        work_dir: dir.path().join("work"),
        output_dir: dir.path().join("output"),
        kill_grace_period: Duration::from_millis(500),
        poll_interval: Duration::from_millis(20),
        maintenance_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    }
}

pub fn orchestrator(dir: &TempDir, providers: ProviderSet) -> Orchestrator {
    Orchestrator::builder(test_config(dir))
        .providers(providers)
        .renderer(FakeRenderer::instant())
        .build()
}

pub fn request(brief: &str) -> GenerationRequest {
    GenerationRequest::new(brief, 30)
}
