//! Stage execution with provider fallback.
//!
//! Stages run in order (script, voice, visuals, render), each feeding the
//! next. A provider stage walks the selector's ranked chain: a failure that
//! allows fallback moves on to the next provider, anything else ends the
//! stage. Every attempt is recorded on the job and emitted as progress.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use vgen_models::{
    ExportRequest, ExportStatus, GenerationRequest, JobId, ProgressEvent, ProgressKind, Stage,
    StageOutcome, StageRecord,
};
use vgen_providers::{
    Provider, ProviderError, ProviderResult, ProviderSelector, ProviderSet, Script, ScriptProvider,
    StageContext, VisualAsset, VisualProvider, VoiceProvider, VoiceTrack,
};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::export::ExportService;
use crate::logging::JobLogger;
use crate::metrics;
use crate::status::StatusStore;

/// One job's execution inputs.
pub(crate) struct JobRun {
    pub job_id: JobId,
    pub request: GenerationRequest,
    pub ctx: StageContext,
    pub logger: JobLogger,
}

/// Shared services the stages draw on.
#[derive(Clone)]
pub(crate) struct Pipeline {
    pub status: StatusStore,
    pub selector: Arc<ProviderSelector>,
    pub providers: ProviderSet,
    pub exports: ExportService,
    pub config: Arc<WorkerConfig>,
}

impl Pipeline {
    /// Run every stage and return the rendered output path.
    pub async fn run(&self, run: &JobRun) -> WorkerResult<String> {
        tokio::fs::create_dir_all(&run.ctx.work_dir).await?;

        let script = self
            .provider_stage(run, Stage::Script, &self.providers.script, |provider: Arc<dyn ScriptProvider>| {
                let request = run.request.clone();
                let ctx = run.ctx.clone();
                async move {
                    let script = provider.generate_script(&request, &ctx).await?;
                    script.ensure_usable(provider.name())?;
                    Ok(script)
                }
            })
            .await?;
        let script = Arc::new(script);

        let voice = self
            .provider_stage(run, Stage::Voice, &self.providers.voice, |provider: Arc<dyn VoiceProvider>| {
                let script = Arc::clone(&script);
                let ctx = run.ctx.clone();
                async move { provider.synthesize(&script, &ctx).await }
            })
            .await?;

        let visuals = self
            .provider_stage(run, Stage::Visuals, &self.providers.visual, |provider: Arc<dyn VisualProvider>| {
                let script = Arc::clone(&script);
                let ctx = run.ctx.clone();
                async move {
                    let visuals = provider.generate_visuals(&script, &ctx).await?;
                    if visuals.is_empty() {
                        return Err(ProviderError::invalid_response(provider.name(), "no visuals"));
                    }
                    Ok(visuals)
                }
            })
            .await?;

        self.render_stage(run, &script, &voice, visuals).await
    }

    fn event(run: &JobRun, kind: ProgressKind, stage: Stage, percent: u8, message: String) -> ProgressEvent {
        ProgressEvent::new(run.job_id.clone(), kind, percent, message).with_stage(stage)
    }

    /// Record an event, and optionally a stage attempt, on the running job.
    async fn publish(
        &self,
        run: &JobRun,
        event: ProgressEvent,
        record: Option<StageRecord>,
    ) -> WorkerResult<()> {
        let stage = event.stage;
        let percent = event.percent;
        self.status
            .update(&run.job_id, event, move |job| {
                if job.is_terminal() {
                    return Err(WorkerError::AlreadyFinal(job.state));
                }
                job.set_progress(stage, percent);
                if let Some(record) = record {
                    job.record_stage(record);
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn provider_stage<P, T, F, Fut>(
        &self,
        run: &JobRun,
        stage: Stage,
        candidates: &[Arc<P>],
        mut call: F,
    ) -> WorkerResult<T>
    where
        P: Provider + ?Sized,
        F: FnMut(Arc<P>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let capability = stage
            .capability()
            .ok_or_else(|| WorkerError::invariant(format!("{} stage has no providers", stage)))?;
        let (start, end) = stage.progress_range();

        run.ctx.check_cancelled()?;
        self.publish(
            run,
            Self::event(run, ProgressKind::StageStarted, stage, start, format!("Starting {} stage", stage)),
            None,
        )
        .await?;

        let selection = run
            .ctx
            .interruptible(async {
                Ok(self
                    .selector
                    .chain(capability, run.request.profile, candidates)
                    .await)
            })
            .await?;
        let chain = match selection {
            Ok(chain) => chain,
            Err(unavailable) => {
                let message = unavailable.to_string();
                run.logger.log_error(&message);
                self.publish(
                    run,
                    Self::event(run, ProgressKind::ProviderFailed, stage, start, message.clone()),
                    Some(StageRecord::without_provider(stage, StageOutcome::Failed, message)),
                )
                .await?;
                return Err(ProviderError::from(unavailable).into());
            }
        };

        let mut failures = Vec::new();
        for provider in chain {
            run.ctx.check_cancelled()?;
            let name = provider.name().to_string();
            self.publish(
                run,
                Self::event(run, ProgressKind::ProviderAttempt, stage, start, format!("Using {} for {}", name, stage))
                    .with_provider(&name),
                None,
            )
            .await?;

            let started = Instant::now();
            match run.ctx.cancellable(call(Arc::clone(&provider))).await {
                Ok(value) => {
                    metrics::record_stage_duration(stage.as_str(), &name, started.elapsed().as_secs_f64());
                    run.logger.log_progress(&format!("{} stage served by {}", stage, name));
                    self.publish(
                        run,
                        Self::event(run, ProgressKind::ProviderSucceeded, stage, end, format!("{} finished {}", name, stage))
                            .with_provider(&name),
                        Some(StageRecord::new(stage, &name, StageOutcome::Completed, "ok")),
                    )
                    .await?;
                    return Ok(value);
                }
                Err(e) if e.is_cancelled() => return Err(WorkerError::Cancelled),
                Err(e) => {
                    let message = match e.diagnostics() {
                        Some(diag) => format!("{}: {}", e, diag),
                        None => e.to_string(),
                    };
                    self.publish(
                        run,
                        Self::event(run, ProgressKind::ProviderFailed, stage, start, format!("{} failed: {}", name, message))
                            .with_provider(&name),
                        Some(StageRecord::new(stage, &name, StageOutcome::Failed, &message)),
                    )
                    .await?;

                    if !e.allows_fallback() {
                        run.logger.log_error(&format!("{} rejected {} input: {}", name, stage, message));
                        return Err(e.into());
                    }
                    if e.is_transient() {
                        self.selector
                            .mark_unavailable(capability, &name, provider.tier(), &message);
                    }
                    metrics::record_provider_fallback(stage.as_str(), &name);
                    run.logger
                        .log_warning(&format!("{} failed for {} stage, trying next provider: {}", name, stage, message));
                    failures.push(format!("{}: {}", name, message));
                }
            }
        }

        Err(WorkerError::stage_failed(
            stage,
            format!("every provider failed ({})", failures.join("; ")),
        ))
    }

    fn export_request(
        &self,
        run: &JobRun,
        script: &Script,
        voice: &VoiceTrack,
        mut visuals: Vec<VisualAsset>,
    ) -> WorkerResult<ExportRequest> {
        visuals.sort_by_key(|v| v.scene_index);

        let mut durations = Vec::with_capacity(visuals.len());
        for asset in &visuals {
            let scene = script
                .scenes
                .iter()
                .find(|s| s.index == asset.scene_index)
                .ok_or_else(|| {
                    WorkerError::invalid_input(format!("visual for unknown scene {}", asset.scene_index))
                })?;
            durations.push(scene.duration_secs);
        }

        // Stretch the slideshow to the narration when its length is known.
        let planned: f64 = durations.iter().sum();
        if voice.duration_secs > 0.0 && planned > 0.0 {
            let factor = voice.duration_secs / planned;
            durations.iter_mut().for_each(|d| *d *= factor);
        }

        let output: PathBuf = self.config.output_dir.join(format!("{}.mp4", run.job_id));
        Ok(ExportRequest {
            audio_path: voice.path.to_string_lossy().to_string(),
            visuals: visuals
                .iter()
                .map(|v| v.path.to_string_lossy().to_string())
                .collect(),
            scene_durations: durations,
            output_path: output.to_string_lossy().to_string(),
            width: self.config.video_width,
            height: self.config.video_height,
        })
    }

    async fn render_stage(
        &self,
        run: &JobRun,
        script: &Script,
        voice: &VoiceTrack,
        visuals: Vec<VisualAsset>,
    ) -> WorkerResult<String> {
        let stage = Stage::Render;
        let (start, end) = stage.progress_range();

        run.ctx.check_cancelled()?;
        self.publish(
            run,
            Self::event(run, ProgressKind::StageStarted, stage, start, "Starting render stage".to_string()),
            None,
        )
        .await?;

        let request = self.export_request(run, script, voice, visuals)?;
        let export = self
            .exports
            .queue_export(request, Some(run.job_id.clone()))
            .await?;
        let mut updates = self.exports.subscribe(&export.id).await?;

        let execute = self.exports.execute(&export.id, run.ctx.cancel.clone());
        tokio::pin!(execute);

        let result = loop {
            tokio::select! {
                result = &mut execute => break result,
                Some(update) = updates.next() => {
                    if update.status == ExportStatus::Running && update.percent > 0 {
                        let event = Self::event(
                            run,
                            ProgressKind::Progress,
                            stage,
                            stage.scale(update.percent as f64).min(end - 1),
                            format!("Rendering {}%", update.percent),
                        );
                        self.publish(run, event, None).await?;
                    }
                }
            }
        };

        match result {
            Ok(path) => {
                self.publish(
                    run,
                    Self::event(run, ProgressKind::Progress, stage, end - 1, format!("Rendered {}", path)),
                    Some(StageRecord::without_provider(
                        stage,
                        StageOutcome::Completed,
                        format!("export {}", export.id),
                    )),
                )
                .await?;
                Ok(path)
            }
            Err(WorkerError::Cancelled) => Err(WorkerError::Cancelled),
            Err(e) => {
                let message = e.to_string();
                self.publish(
                    run,
                    Self::event(run, ProgressKind::Progress, stage, start, format!("Render failed: {}", message)),
                    Some(StageRecord::without_provider(stage, StageOutcome::Failed, &message)),
                )
                .await?;
                Err(WorkerError::stage_failed(stage, message))
            }
        }
    }
}
