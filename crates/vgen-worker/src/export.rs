//! Export (render) job orchestration.
//!
//! One async mutex guards the export collection, the parent links and the
//! cancellation handles, so queueing, lookup, retry and deletion never
//! interleave. Subscriber channels live in a separate [`Broadcaster`] with
//! its own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vgen_media::{validate_export_request, RenderContext, Renderer};
use vgen_models::{ExportJob, ExportRequest, ExportStatus, JobId, ModelError};

use crate::broadcast::{Broadcaster, Subscription};
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::runner::CancelOutcome;
use crate::status::retention_cutoff;

#[derive(Default)]
struct ExportState {
    jobs: HashMap<JobId, ExportJob>,
    /// Parent generation job -> its most recent export
    parents: HashMap<JobId, JobId>,
    /// Handles for exports that are executing
    tokens: HashMap<JobId, CancellationToken>,
}

struct ExportInner {
    state: Mutex<ExportState>,
    broadcaster: Broadcaster<ExportJob>,
    renderer: Arc<dyn Renderer>,
}

/// Queues, runs and tracks export jobs.
#[derive(Clone)]
pub struct ExportService {
    inner: Arc<ExportInner>,
}

impl ExportService {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            inner: Arc::new(ExportInner {
                state: Mutex::new(ExportState::default()),
                broadcaster: Broadcaster::new(),
                renderer,
            }),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster<ExportJob> {
        &self.inner.broadcaster
    }

    /// Create a queued export, optionally linked to a parent job.
    ///
    /// A parent may have only one export that is not yet terminal.
    pub async fn queue_export(
        &self,
        request: ExportRequest,
        parent_job_id: Option<JobId>,
    ) -> WorkerResult<ExportJob> {
        validate_export_request(&request)?;

        let mut state = self.inner.state.lock().await;
        let job = ExportJob::new(request, parent_job_id);
        Self::link(&mut state, &job)?;
        state.jobs.insert(job.id.clone(), job.clone());
        drop(state);

        info!(
            export_id = %job.id,
            parent_job_id = job.parent_job_id.as_ref().map(|p| p.as_str()).unwrap_or_default(),
            "Queued export"
        );
        Ok(job)
    }

    fn link(state: &mut ExportState, job: &ExportJob) -> WorkerResult<()> {
        let Some(parent) = &job.parent_job_id else {
            return Ok(());
        };
        if let Some(active) = state
            .parents
            .get(parent)
            .and_then(|id| state.jobs.get(id))
            .filter(|existing| !existing.is_terminal())
        {
            return Err(WorkerError::conflict(format!(
                "job {} already has active export {}",
                parent, active.id
            )));
        }
        state.parents.insert(parent.clone(), job.id.clone());
        Ok(())
    }

    /// Atomically replace an export's status fields.
    ///
    /// `percent` is clamped to `[0, 100]`. A `Completed` update without a
    /// non-empty output path is rejected and leaves the export untouched.
    pub async fn update_status(
        &self,
        export_id: &JobId,
        status: ExportStatus,
        percent: i32,
        output_path: Option<String>,
        error_message: Option<String>,
    ) -> WorkerResult<ExportJob> {
        let mut state = self.inner.state.lock().await;
        self.apply(&mut state, export_id, status, percent, output_path, error_message)
    }

    fn apply(
        &self,
        state: &mut ExportState,
        export_id: &JobId,
        status: ExportStatus,
        percent: i32,
        output_path: Option<String>,
        error_message: Option<String>,
    ) -> WorkerResult<ExportJob> {
        let has_output = output_path.as_deref().is_some_and(|p| !p.trim().is_empty());
        if status == ExportStatus::Completed && !has_output {
            error!(
                export_id = %export_id,
                "Rejected completed status without an output path"
            );
            return Err(WorkerError::invariant(format!(
                "export {} cannot complete without an output path",
                export_id
            )));
        }

        let current = state
            .jobs
            .get(export_id)
            .ok_or_else(|| WorkerError::not_found(format!("export {}", export_id)))?;
        if current.is_terminal() {
            return Err(WorkerError::AlreadyFinal(current.status));
        }
        if current.status != status && !current.status.can_transition_to(status) {
            return Err(ModelError::InvalidTransition {
                from: current.status,
                to: status,
            }
            .into());
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.status = status;
        next.percent = percent.clamp(0, 100) as u8;
        next.output_path = output_path.filter(|_| status == ExportStatus::Completed);
        next.error_message = error_message;
        next.updated_at = now;
        if status == ExportStatus::Running && next.started_at.is_none() {
            next.started_at = Some(now);
        }
        if status.is_terminal() {
            next.completed_at = Some(now);
            state.tokens.remove(export_id);
        }
        state.jobs.insert(export_id.clone(), next.clone());

        self.inner.broadcaster.publish(export_id, &next);
        if next.is_terminal() {
            self.inner.broadcaster.close(export_id);
            metrics::record_export_finished(next.status.as_str());
        }
        Ok(next)
    }

    /// Render a queued export to completion.
    ///
    /// Returns the output path. Cancellation through `cancel` or
    /// [`ExportService::cancel`] settles the export as `Cancelled`.
    pub async fn execute(&self, export_id: &JobId, cancel: CancellationToken) -> WorkerResult<String> {
        let job = {
            let mut state = self.inner.state.lock().await;
            let job = state
                .jobs
                .get(export_id)
                .cloned()
                .ok_or_else(|| WorkerError::not_found(format!("export {}", export_id)))?;
            if job.status != ExportStatus::Queued {
                return Err(WorkerError::conflict(format!(
                    "export {} is already {}",
                    export_id, job.status
                )));
            }
            state.tokens.insert(export_id.clone(), cancel.clone());
            self.apply(&mut state, export_id, ExportStatus::Running, 0, None, None)?
        };

        // Processes are attributed to the parent so cancelling it reaches them.
        let owner = job.parent_job_id.clone().unwrap_or_else(|| job.id.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<f64>();
        let ctx = RenderContext::new(owner, cancel.clone()).with_progress(Arc::new(move |pct: f64| {
            let _ = tx.send(pct);
        }));

        let render = self.inner.renderer.render(&job.request, &ctx);
        tokio::pin!(render);

        let mut last_percent = 0i32;
        let result = loop {
            tokio::select! {
                result = &mut render => break result,
                Some(pct) = rx.recv() => {
                    let pct = pct.floor() as i32;
                    if pct > last_percent && pct < 100 {
                        last_percent = pct;
                        if let Err(e) = self
                            .update_status(export_id, ExportStatus::Running, pct, None, None)
                            .await
                        {
                            debug!(export_id = %export_id, "Skipped progress update: {}", e);
                        }
                    }
                }
            }
        };

        match result {
            Ok(path) => {
                let path = path.to_string_lossy().to_string();
                self.update_status(export_id, ExportStatus::Completed, 100, Some(path.clone()), None)
                    .await?;
                info!(export_id = %export_id, output = %path, "Export completed");
                Ok(path)
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                self.update_status(export_id, ExportStatus::Cancelled, last_percent, None, None)
                    .await?;
                info!(export_id = %export_id, "Export cancelled");
                Err(WorkerError::Cancelled)
            }
            Err(e) => {
                let message = match e.diagnostics() {
                    Some(diag) => format!("{}: {}", e, diag),
                    None => e.to_string(),
                };
                warn!(export_id = %export_id, "Export failed: {}", message);
                self.update_status(
                    export_id,
                    ExportStatus::Failed,
                    last_percent,
                    None,
                    Some(message),
                )
                .await?;
                Err(e.into())
            }
        }
    }

    /// Queue an export and render it on the current task.
    pub async fn render(
        &self,
        request: ExportRequest,
        parent_job_id: Option<JobId>,
        cancel: CancellationToken,
    ) -> WorkerResult<(JobId, String)> {
        let job = self.queue_export(request, parent_job_id).await?;
        let path = self.execute(&job.id, cancel).await?;
        Ok((job.id, path))
    }

    /// Run a queued export in the background.
    pub fn start(&self, export_id: JobId) -> JoinHandle<WorkerResult<String>> {
        let service = self.clone();
        tokio::spawn(async move { service.execute(&export_id, CancellationToken::new()).await })
    }

    /// Cancel an export. Terminal exports report their final status.
    pub async fn cancel(&self, export_id: &JobId) -> WorkerResult<CancelOutcome> {
        let mut state = self.inner.state.lock().await;
        let job = state
            .jobs
            .get(export_id)
            .cloned()
            .ok_or_else(|| WorkerError::not_found(format!("export {}", export_id)))?;

        if job.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinal(job.status));
        }
        if let Some(token) = state.tokens.get(export_id) {
            token.cancel();
            info!(export_id = %export_id, "Export cancellation requested");
            return Ok(CancelOutcome::Requested);
        }

        // Never started: settle it here.
        self.apply(
            &mut state,
            export_id,
            ExportStatus::Cancelled,
            job.percent as i32,
            None,
            None,
        )?;
        info!(export_id = %export_id, "Queued export cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Queue a fresh export with the request and parent of a failed or
    /// cancelled one. Script, voice and visuals are not re-run.
    pub async fn retry_export(&self, export_id: &JobId) -> WorkerResult<ExportJob> {
        let mut state = self.inner.state.lock().await;
        let previous = state
            .jobs
            .get(export_id)
            .ok_or_else(|| WorkerError::not_found(format!("export {}", export_id)))?;
        if !matches!(previous.status, ExportStatus::Failed | ExportStatus::Cancelled) {
            return Err(WorkerError::conflict(format!(
                "export {} is {} and cannot be retried",
                export_id, previous.status
            )));
        }

        let job = ExportJob::new(previous.request.clone(), previous.parent_job_id.clone());
        Self::link(&mut state, &job)?;
        state.jobs.insert(job.id.clone(), job.clone());
        info!(export_id = %job.id, retry_of = %export_id, "Queued export retry");
        Ok(job)
    }

    pub async fn get(&self, export_id: &JobId) -> Option<ExportJob> {
        self.inner.state.lock().await.jobs.get(export_id).cloned()
    }

    /// Most recent export linked to `parent_job_id`.
    pub async fn export_for_parent(&self, parent_job_id: &JobId) -> Option<ExportJob> {
        let state = self.inner.state.lock().await;
        state
            .parents
            .get(parent_job_id)
            .and_then(|id| state.jobs.get(id))
            .cloned()
    }

    /// Every known export, oldest first.
    pub async fn list(&self) -> Vec<ExportJob> {
        let state = self.inner.state.lock().await;
        let mut jobs: Vec<ExportJob> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Live snapshots of an export, starting with the current one.
    pub async fn subscribe(&self, export_id: &JobId) -> WorkerResult<Subscription<ExportJob>> {
        let state = self.inner.state.lock().await;
        let job = state
            .jobs
            .get(export_id)
            .cloned()
            .ok_or_else(|| WorkerError::not_found(format!("export {}", export_id)))?;
        Ok(self.inner.broadcaster.subscribe(export_id, job))
    }

    /// Remove a terminal export and its parent link.
    pub async fn delete(&self, export_id: &JobId) -> WorkerResult<ExportJob> {
        let mut state = self.inner.state.lock().await;
        let job = state
            .jobs
            .get(export_id)
            .ok_or_else(|| WorkerError::not_found(format!("export {}", export_id)))?;
        if !job.is_terminal() {
            return Err(WorkerError::conflict(format!(
                "export {} is {} and cannot be deleted",
                export_id, job.status
            )));
        }
        let job = Self::remove(&mut state, export_id);
        drop(state);
        self.inner.broadcaster.close(export_id);
        job.ok_or_else(|| WorkerError::not_found(format!("export {}", export_id)))
    }

    fn remove(state: &mut ExportState, export_id: &JobId) -> Option<ExportJob> {
        let job = state.jobs.remove(export_id)?;
        state.tokens.remove(export_id);
        if let Some(parent) = &job.parent_job_id {
            if state.parents.get(parent) == Some(export_id) {
                state.parents.remove(parent);
            }
        }
        Some(job)
    }

    /// Remove terminal exports finished more than `retention` ago.
    pub async fn evict_terminal(&self, retention: Duration) -> Vec<JobId> {
        let cutoff = retention_cutoff(retention);
        let mut state = self.inner.state.lock().await;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.is_terminal())
            .filter(|j| j.completed_at.is_some_and(|at| at <= cutoff))
            .map(|j| j.id.clone())
            .collect();
        for id in &expired {
            Self::remove(&mut state, id);
            self.inner.broadcaster.close(id);
        }
        expired
    }
}
