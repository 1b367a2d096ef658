//! Job runner: creation, execution, cancellation and status.
//!
//! Each job runs on its own task with its own cancellation token. The token
//! is registered before the task is spawned and unregistered by a guard the
//! task owns, so the active map is cleaned up however the job ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use vgen_media::{KillOutcome, ProcessRegistry, ProcessRunner};
use vgen_models::{
    GenerationRequest, Job, JobId, JobSnapshot, JobState, ProgressEvent, ProgressKind,
    ProviderDescriptor,
};
use vgen_providers::{ProviderSelector, ProviderSet, StageContext};

use crate::broadcast::Subscription;
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::export::ExportService;
use crate::logging::JobLogger;
use crate::metrics;
use crate::pipeline::{JobRun, Pipeline};
use crate::status::StatusStore;

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Signalled; the job settles to `Cancelled` once in-flight work stops.
    Requested,
    /// The job had not started and was cancelled on the spot.
    Cancelled,
    /// Nothing to do: the job had already finished in this state.
    AlreadyFinal(JobState),
}

struct RunnerInner {
    pipeline: Pipeline,
    processes: ProcessRunner,
    config: Arc<WorkerConfig>,
    active: Mutex<HashMap<JobId, CancellationToken>>,
}

impl RunnerInner {
    fn active(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a job from the active map when its task ends.
struct ActiveGuard {
    inner: Arc<RunnerInner>,
    job_id: JobId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active().remove(&self.job_id);
    }
}

/// Creates, executes and cancels generation jobs.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl JobRunner {
    pub fn new(
        config: WorkerConfig,
        providers: ProviderSet,
        selector: Arc<ProviderSelector>,
        exports: ExportService,
        processes: ProcessRunner,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            inner: Arc::new(RunnerInner {
                pipeline: Pipeline {
                    status: StatusStore::new(config.history_limit),
                    selector,
                    providers,
                    exports,
                    config: Arc::clone(&config),
                },
                processes,
                config,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn status_store(&self) -> &StatusStore {
        &self.inner.pipeline.status
    }

    pub fn exports(&self) -> &ExportService {
        &self.inner.pipeline.exports
    }

    pub fn selector(&self) -> &Arc<ProviderSelector> {
        &self.inner.pipeline.selector
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        self.inner.processes.registry()
    }

    /// Validate, create and start a job. Returns without waiting for it.
    pub async fn create_and_start(&self, request: GenerationRequest) -> WorkerResult<JobId> {
        self.start_with_id(JobId::new(), request).await
    }

    /// Like [`JobRunner::create_and_start`] with a caller-chosen id.
    pub async fn start_with_id(&self, job_id: JobId, request: GenerationRequest) -> WorkerResult<JobId> {
        request
            .ensure_valid()
            .map_err(|e| WorkerError::invalid_input(e.to_string()))?;

        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut job = Job::new(correlation_id.clone());
        job.id = job_id.clone();

        // The token is registered before the job is visible, so a cancel
        // racing with startup always finds it and goes through the task.
        let cancel = CancellationToken::new();
        {
            let mut active = self.inner.active();
            if active.contains_key(&job_id) {
                return Err(WorkerError::conflict(format!("job {} is already running", job_id)));
            }
            active.insert(job_id.clone(), cancel.clone());
        }
        let guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            job_id: job_id.clone(),
        };

        let status = &self.inner.pipeline.status;
        status.insert(job).await?;

        status
            .update(
                &job_id,
                ProgressEvent::new(job_id.clone(), ProgressKind::StateChanged, 0, "Job started"),
                |job| Ok(job.start()?),
            )
            .await?;
        metrics::record_job_started();

        let logger = JobLogger::new(&job_id, "generate", &correlation_id);
        logger.log_start(&format!(
            "{}s video, {} profile",
            request.target_duration_secs, request.profile
        ));
        let span = logger.create_span();

        let run = JobRun {
            job_id: job_id.clone(),
            ctx: StageContext::new(
                job_id.clone(),
                self.inner.config.work_dir.join(job_id.as_str()),
                cancel,
                self.inner.processes.clone(),
            ),
            request,
            logger,
        };

        let runner = self.clone();
        tokio::spawn(async move { runner.execute(run, guard).await }.instrument(span));
        Ok(job_id)
    }

    async fn execute(self, run: JobRun, _guard: ActiveGuard) {
        let result = self.inner.pipeline.run(&run).await;
        let status = &self.inner.pipeline.status;
        let job_id = &run.job_id;

        let settled = match result {
            Ok(path) => {
                let message = format!("Video ready at {}", path);
                let settled = status
                    .update(
                        job_id,
                        ProgressEvent::new(job_id.clone(), ProgressKind::StateChanged, 100, &message),
                        |job| Ok(job.complete(path)?),
                    )
                    .await;
                if settled.is_ok() {
                    run.logger.log_completion(&message);
                }
                settled
            }
            Err(e) if e.is_cancelled() || run.ctx.cancel.is_cancelled() => {
                run.logger.log_cancelled("stopped on request");
                status
                    .update(
                        job_id,
                        ProgressEvent::new(job_id.clone(), ProgressKind::StateChanged, 0, "Job cancelled"),
                        |job| Ok(job.cancel()?),
                    )
                    .await
            }
            Err(e) => self.fail(&run, e.to_string()).await,
        };

        match settled {
            Ok(snapshot) => metrics::record_job_finished(snapshot.state.as_str()),
            Err(WorkerError::AlreadyFinal(state)) => {
                debug!(job_id = %job_id, %state, "Job already settled");
            }
            Err(e) => {
                // The only remaining way out is a failure record.
                error!(job_id = %job_id, "Failed to settle job: {}", e);
                if let Ok(snapshot) = self.fail(&run, e.to_string()).await {
                    metrics::record_job_finished(snapshot.state.as_str());
                }
            }
        }

        if run.ctx.cancel.is_cancelled() {
            // Anything the stages did not reap themselves.
            self.inner.processes.registry().kill_all_for_job(job_id).await;
        }
    }

    async fn fail(&self, run: &JobRun, message: String) -> WorkerResult<JobSnapshot> {
        run.logger.log_error(&message);
        let event = ProgressEvent::new(
            run.job_id.clone(),
            ProgressKind::StateChanged,
            0,
            format!("Job failed: {}", message),
        );
        self.inner
            .pipeline
            .status
            .update(&run.job_id, event, |job| Ok(job.fail(message)?))
            .await
    }

    /// Request cancellation of a job.
    ///
    /// Signals the job's token and tears down its tracked processes. A job
    /// that has already finished is left untouched and its state reported.
    pub async fn cancel(&self, job_id: &JobId) -> WorkerResult<CancelOutcome> {
        let Some(snapshot) = self.get_status(job_id).await else {
            // Still starting up: the task picks the signal up once it runs.
            let token = self.inner.active().get(job_id).cloned();
            return match token {
                Some(token) => {
                    token.cancel();
                    info!(job_id = %job_id, "Job cancellation requested during startup");
                    Ok(CancelOutcome::Requested)
                }
                None => Err(WorkerError::not_found(format!("job {}", job_id))),
            };
        };
        if snapshot.state.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinal(snapshot.state));
        }

        let token = self.inner.active().get(job_id).cloned();
        let Some(token) = token else {
            // No task owns it: settle directly.
            let event = ProgressEvent::new(job_id.clone(), ProgressKind::StateChanged, 0, "Job cancelled");
            return match self
                .inner
                .pipeline
                .status
                .update(job_id, event, |job| Ok(job.cancel()?))
                .await
            {
                Ok(_) => Ok(CancelOutcome::Cancelled),
                Err(WorkerError::Model(_)) => {
                    let state = self.get_status(job_id).await.map_or(snapshot.state, |s| s.state);
                    Ok(CancelOutcome::AlreadyFinal(state))
                }
                Err(e) => Err(e),
            };
        };

        token.cancel();
        info!(job_id = %job_id, "Job cancellation requested");

        let killed = self.inner.processes.registry().kill_all_for_job(job_id).await;
        let mut count = 0;
        for (pid, result) in killed {
            match result {
                Ok(KillOutcome::NotTracked) => {}
                Ok(outcome) => {
                    count += 1;
                    debug!(job_id = %job_id, pid, ?outcome, "Terminated process");
                }
                Err(e) => warn!(job_id = %job_id, pid, "Failed to terminate process: {}", e),
            }
        }
        metrics::record_processes_killed(count);
        Ok(CancelOutcome::Requested)
    }

    /// Current snapshot. Never waits on in-flight work.
    pub async fn get_status(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.inner.pipeline.status.get(job_id).await
    }

    /// Full job record, including stage attempts.
    pub async fn job(&self, job_id: &JobId) -> Option<Job> {
        self.inner.pipeline.status.job(job_id).await
    }

    pub async fn subscribe(&self, job_id: &JobId) -> WorkerResult<Subscription<JobSnapshot>> {
        self.inner
            .pipeline
            .status
            .subscribe(job_id)
            .await
            .ok_or_else(|| WorkerError::not_found(format!("job {}", job_id)))
    }

    pub async fn history(&self, job_id: &JobId) -> WorkerResult<Vec<ProgressEvent>> {
        self.inner
            .pipeline
            .status
            .history(job_id)
            .await
            .ok_or_else(|| WorkerError::not_found(format!("job {}", job_id)))
    }

    /// Wait for the job's final snapshot.
    pub async fn wait_for_terminal(&self, job_id: &JobId) -> WorkerResult<JobSnapshot> {
        let mut updates = self.subscribe(job_id).await?;
        let mut last = None;
        while let Some(snapshot) = updates.next().await {
            last = Some(snapshot);
        }
        match last {
            Some(snapshot) if snapshot.is_terminal() => Ok(snapshot),
            _ => Err(WorkerError::not_found(format!("job {} was evicted", job_id))),
        }
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.inner.active().contains_key(job_id)
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        self.inner.active().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active().len()
    }

    /// Drop finished jobs and exports past the retention window, along with
    /// the scratch files kept for export retries.
    pub async fn evict_finished(&self) -> usize {
        let retention = self.inner.config.retention;
        let jobs = self.inner.pipeline.status.evict_terminal(retention).await;
        let exports = self.inner.pipeline.exports.evict_terminal(retention).await;

        for job_id in &jobs {
            let dir = self.inner.config.work_dir.join(job_id.as_str());
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(job_id = %job_id, "Removed work dir"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(job_id = %job_id, "Failed to remove work dir {}: {}", dir.display(), e),
            }
        }
        jobs.len() + exports.len()
    }

    /// Re-probe every registered provider.
    pub async fn refresh_providers(&self) -> Vec<ProviderDescriptor> {
        let selector = &self.inner.pipeline.selector;
        let providers = &self.inner.pipeline.providers;
        let (mut script, voice, visual) = tokio::join!(
            selector.refresh(&providers.script),
            selector.refresh(&providers.voice),
            selector.refresh(&providers.visual),
        );
        script.extend(voice);
        script.extend(visual);
        script
    }

    /// Cancel every active job and wait up to `timeout` for them to settle.
    pub async fn shutdown(&self, timeout: Duration) {
        let active = self.active_jobs();
        if active.is_empty() {
            return;
        }
        info!(count = active.len(), "Cancelling active jobs for shutdown");
        for job_id in &active {
            if let Err(e) = self.cancel(job_id).await {
                warn!(job_id = %job_id, "Failed to cancel during shutdown: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.active_count() > 0 {
            warn!(count = self.active_count(), "Jobs still running at shutdown deadline");
        }
    }
}
