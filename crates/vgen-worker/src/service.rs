//! Orchestrator facade over the runner, export service and queue.

use std::sync::Arc;

use vgen_media::{KillOutcome, ProcessRegistry, ProcessRunner, Renderer, SlideshowRenderer};
use vgen_models::{
    ExportJob, GenerationRequest, Job, JobId, JobSnapshot, ProgressEvent, ProviderDescriptor,
    TrackedProcess,
};
use vgen_providers::{ProviderSelector, ProviderSet};
use vgen_queue::{QueueEntry, QueueStore};

use crate::broadcast::Subscription;
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::export::ExportService;
use crate::processor::QueueProcessor;
use crate::runner::{CancelOutcome, JobRunner};

/// Assembles an [`Orchestrator`]. Anything not supplied gets the production
/// default.
pub struct OrchestratorBuilder {
    config: WorkerConfig,
    providers: ProviderSet,
    selector: Option<Arc<ProviderSelector>>,
    renderer: Option<Arc<dyn Renderer>>,
    registry: Option<Arc<ProcessRegistry>>,
    queue: Option<Arc<dyn QueueStore>>,
}

impl OrchestratorBuilder {
    pub fn providers(mut self, providers: ProviderSet) -> Self {
        self.providers = providers;
        self
    }

    pub fn selector(mut self, selector: Arc<ProviderSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn registry(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn queue(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue = Some(store);
        self
    }

    pub fn build(self) -> Orchestrator {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ProcessRegistry::new(self.config.kill_grace_period)));
        let processes = ProcessRunner::new(registry);
        let renderer = self.renderer.unwrap_or_else(|| {
            Arc::new(
                SlideshowRenderer::new(processes.clone()).with_timeout(self.config.render_timeout),
            )
        });
        let selector = self.selector.unwrap_or_default();

        let runner = JobRunner::new(
            self.config,
            self.providers,
            selector,
            ExportService::new(renderer),
            processes,
        );
        let processor = self
            .queue
            .map(|store| QueueProcessor::new(store, runner.clone()));

        Orchestrator { runner, processor }
    }
}

/// Single entry point for submitting, observing and controlling jobs.
#[derive(Clone)]
pub struct Orchestrator {
    runner: JobRunner,
    processor: Option<QueueProcessor>,
}

impl Orchestrator {
    pub fn builder(config: WorkerConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            providers: ProviderSet::default(),
            selector: None,
            renderer: None,
            registry: None,
            queue: None,
        }
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn exports(&self) -> &ExportService {
        self.runner.exports()
    }

    /// The queue processor, when a queue store was configured.
    pub fn processor(&self) -> Option<&QueueProcessor> {
        self.processor.as_ref()
    }

    /// Start a job right away on this worker.
    pub async fn submit(&self, request: GenerationRequest) -> WorkerResult<JobId> {
        self.runner.create_and_start(request).await
    }

    /// Persist a request for whichever worker polls it first.
    pub async fn enqueue(&self, request: GenerationRequest) -> WorkerResult<QueueEntry> {
        let processor = self
            .processor
            .as_ref()
            .ok_or_else(|| WorkerError::config_error("no queue store configured"))?;
        processor.enqueue(request).await
    }

    pub async fn status(&self, job_id: &JobId) -> WorkerResult<JobSnapshot> {
        self.runner
            .get_status(job_id)
            .await
            .ok_or_else(|| WorkerError::not_found(format!("job {}", job_id)))
    }

    /// Full record including every stage attempt.
    pub async fn job(&self, job_id: &JobId) -> WorkerResult<Job> {
        self.runner
            .job(job_id)
            .await
            .ok_or_else(|| WorkerError::not_found(format!("job {}", job_id)))
    }

    pub async fn subscribe(&self, job_id: &JobId) -> WorkerResult<Subscription<JobSnapshot>> {
        self.runner.subscribe(job_id).await
    }

    pub async fn history(&self, job_id: &JobId) -> WorkerResult<Vec<ProgressEvent>> {
        self.runner.history(job_id).await
    }

    pub async fn cancel(&self, job_id: &JobId) -> WorkerResult<CancelOutcome> {
        self.runner.cancel(job_id).await
    }

    pub fn list_processes(&self) -> Vec<TrackedProcess> {
        self.runner.registry().get_active()
    }

    pub fn processes_for_job(&self, job_id: &JobId) -> Vec<TrackedProcess> {
        self.runner.registry().get_for_job(job_id)
    }

    /// Terminate one tracked process. Untracked pids are left alone.
    pub async fn kill_process(&self, pid: u32) -> WorkerResult<KillOutcome> {
        Ok(self.runner.registry().kill(pid).await?)
    }

    pub async fn export_status(&self, export_id: &JobId) -> WorkerResult<ExportJob> {
        self.exports()
            .get(export_id)
            .await
            .ok_or_else(|| WorkerError::not_found(format!("export {}", export_id)))
    }

    /// The export currently linked to a generation job.
    pub async fn export_for_job(&self, job_id: &JobId) -> WorkerResult<ExportJob> {
        self.exports()
            .export_for_parent(job_id)
            .await
            .ok_or_else(|| WorkerError::not_found(format!("export for job {}", job_id)))
    }

    pub async fn subscribe_export(&self, export_id: &JobId) -> WorkerResult<Subscription<ExportJob>> {
        self.exports().subscribe(export_id).await
    }

    pub async fn cancel_export(&self, export_id: &JobId) -> WorkerResult<CancelOutcome> {
        self.exports().cancel(export_id).await
    }

    /// Queue and start a new render from a failed or cancelled export.
    pub async fn retry_export(&self, export_id: &JobId) -> WorkerResult<ExportJob> {
        let export = self.exports().retry_export(export_id).await?;
        // The handle is dropped: progress is observed through the broadcaster.
        let _ = self.exports().start(export.id.clone());
        Ok(export)
    }

    /// Last known probe result for every provider.
    pub fn providers(&self) -> Vec<ProviderDescriptor> {
        self.runner.selector().snapshot()
    }

    pub async fn refresh_providers(&self) -> Vec<ProviderDescriptor> {
        self.runner.refresh_providers().await
    }

    /// Cancel running jobs and wait for them within the configured timeout.
    pub async fn shutdown(&self) {
        self.runner.shutdown(self.runner.config().shutdown_timeout).await;
    }
}
