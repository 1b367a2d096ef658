//! Background queue processor.
//!
//! Pulls persisted requests from the durable queue and hands them to the
//! [`JobRunner`]. Every unit of queue work opens its own short-lived session
//! and drops it before any job work continues, so a slow job never pins a
//! queue connection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use vgen_models::{GenerationRequest, JobId, JobState};
use vgen_queue::{QueueEntry, QueueStore};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::runner::JobRunner;

/// How a dispatched job ended, as recorded on its queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed(String),
}

/// What one maintenance pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub heartbeats: usize,
    pub requeued: usize,
    pub failed: usize,
    pub written_back: usize,
    pub evicted: usize,
    pub providers_up: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives queue entries through the job runner.
#[derive(Clone)]
pub struct QueueProcessor {
    store: Arc<dyn QueueStore>,
    runner: JobRunner,
    /// Entry id -> job running for it on this worker
    inflight: Arc<Mutex<HashMap<String, JobId>>>,
    /// Finished entries whose outcome has not been stored yet
    unreported: Arc<Mutex<HashMap<String, Outcome>>>,
}

impl QueueProcessor {
    pub fn new(store: Arc<dyn QueueStore>, runner: JobRunner) -> Self {
        Self {
            store,
            runner,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            unreported: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persist a request for later dispatch.
    pub async fn enqueue(&self, request: GenerationRequest) -> WorkerResult<QueueEntry> {
        request
            .ensure_valid()
            .map_err(|e| WorkerError::invalid_input(e.to_string()))?;
        let mut session = self.store.session().await?;
        Ok(session.enqueue(request).await?)
    }

    /// Entries dispatched by this worker whose jobs are still running.
    pub fn inflight(&self) -> Vec<(String, JobId)> {
        lock(&self.inflight)
            .iter()
            .map(|(entry, job)| (entry.clone(), job.clone()))
            .collect()
    }

    /// Dispatch as many pending entries as there is capacity for.
    ///
    /// Returns the number of jobs started. Store failures skip the cycle.
    pub async fn process_next_batch(&self) -> usize {
        let config = self.runner.config();
        let capacity = config
            .max_concurrent_jobs
            .saturating_sub(self.runner.active_count())
            .min(config.batch_size);
        if capacity == 0 {
            debug!("At capacity, skipping queue poll");
            return 0;
        }

        let entries = match self.fetch(capacity).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Skipping queue poll: {}", e);
                metrics::record_queue_session_error("fetch");
                return 0;
            }
        };

        let mut dispatched = 0;
        for entry in entries {
            let entry_id = entry.entry_id.clone();
            match self.dispatch(entry).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(entry_id = %entry_id, "Failed to dispatch queue entry: {}", e);
                    metrics::record_queue_session_error("dispatch");
                }
            }
        }
        dispatched
    }

    async fn fetch(&self, limit: usize) -> WorkerResult<Vec<QueueEntry>> {
        let mut session = self.store.session().await?;
        Ok(session.fetch_pending(limit).await?)
    }

    async fn dispatch(&self, entry: QueueEntry) -> WorkerResult<bool> {
        let job_id = JobId::new();
        let claimed = {
            let mut session = self.store.session().await?;
            session.mark_dispatched(&entry.entry_id, &job_id).await?
        };
        if !claimed {
            debug!(entry_id = %entry.entry_id, "Entry claimed elsewhere");
            return Ok(false);
        }

        match self.runner.start_with_id(job_id.clone(), entry.request).await {
            Ok(_) => {
                lock(&self.inflight).insert(entry.entry_id.clone(), job_id.clone());
                metrics::record_queue_dispatch();
                info!(
                    entry_id = %entry.entry_id,
                    job_id = %job_id,
                    retry_count = entry.retry_count,
                    "Dispatched queue entry"
                );
                self.watch(entry.entry_id, job_id);
                Ok(true)
            }
            Err(e) => {
                warn!(entry_id = %entry.entry_id, "Job failed to start: {}", e);
                let mut session = self.store.session().await?;
                session.mark_failed(&entry.entry_id, &e.to_string()).await?;
                Ok(false)
            }
        }
    }

    /// Record the job's outcome on its entry once it finishes.
    fn watch(&self, entry_id: String, job_id: JobId) {
        let processor = self.clone();
        tokio::spawn(async move {
            let outcome = match processor.runner.wait_for_terminal(&job_id).await {
                Ok(snapshot) if snapshot.state == JobState::Completed => Outcome::Completed,
                Ok(snapshot) => Outcome::Failed(
                    snapshot
                        .error_message
                        .unwrap_or_else(|| snapshot.state.to_string()),
                ),
                Err(e) => Outcome::Failed(e.to_string()),
            };

            // Parked before leaving `inflight` so maintenance never sees the
            // entry as orphaned.
            lock(&processor.unreported).insert(entry_id.clone(), outcome.clone());
            lock(&processor.inflight).remove(&entry_id);

            match processor.write_back(&entry_id, &outcome).await {
                Ok(()) => {
                    lock(&processor.unreported).remove(&entry_id);
                }
                Err(e) => {
                    warn!(entry_id = %entry_id, "Failed to record job outcome, will retry: {}", e);
                    metrics::record_queue_session_error("write_back");
                }
            }
        });
    }

    async fn write_back(&self, entry_id: &str, outcome: &Outcome) -> WorkerResult<()> {
        let mut session = self.store.session().await?;
        match outcome {
            Outcome::Completed => session.mark_completed(entry_id).await?,
            Outcome::Failed(message) => session.mark_failed(entry_id, message).await?,
        }
        Ok(())
    }

    /// Retry outcome write-backs, heartbeat running entries, reap stale
    /// ones, evict old jobs and re-probe providers.
    pub async fn perform_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        let pending: Vec<(String, Outcome)> = lock(&self.unreported)
            .iter()
            .map(|(id, outcome)| (id.clone(), outcome.clone()))
            .collect();
        for (entry_id, outcome) in pending {
            match self.write_back(&entry_id, &outcome).await {
                Ok(()) => {
                    lock(&self.unreported).remove(&entry_id);
                    report.written_back += 1;
                }
                Err(e) => debug!(entry_id = %entry_id, "Write-back still failing: {}", e),
            }
        }

        if let Err(e) = self.reap_stale(&mut report).await {
            warn!("Skipping stale entry scan: {}", e);
            metrics::record_queue_session_error("maintenance");
        }

        report.evicted = self.runner.evict_finished().await;
        report.providers_up = self
            .runner
            .refresh_providers()
            .await
            .iter()
            .filter(|d| d.available)
            .count();
        report
    }

    async fn reap_stale(&self, report: &mut MaintenanceReport) -> WorkerResult<()> {
        let config = self.runner.config();
        let inflight: HashSet<String> = lock(&self.inflight).keys().cloned().collect();
        let unreported: HashSet<String> = lock(&self.unreported).keys().cloned().collect();

        let mut session = self.store.session().await?;
        for entry_id in &inflight {
            match session.heartbeat(entry_id).await {
                Ok(()) => report.heartbeats += 1,
                Err(e) => warn!(entry_id = %entry_id, "Heartbeat failed: {}", e),
            }
        }

        let stale_for = chrono::Duration::from_std(config.stale_threshold)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(stale_for)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        for entry in session.stale_dispatched(cutoff).await? {
            if inflight.contains(&entry.entry_id) || unreported.contains(&entry.entry_id) {
                continue;
            }
            if entry.retry_count < config.max_retries {
                warn!(
                    entry_id = %entry.entry_id,
                    retry_count = entry.retry_count,
                    "Requeueing stale queue entry"
                );
                session
                    .requeue(&entry.entry_id, "worker lost heartbeat", config.retry_delay)
                    .await?;
                metrics::record_stale_reaped("requeued");
                report.requeued += 1;
            } else {
                warn!(
                    entry_id = %entry.entry_id,
                    retry_count = entry.retry_count,
                    "Failing stale queue entry after max retries"
                );
                session
                    .mark_failed(
                        &entry.entry_id,
                        &format!("stale after {} retries", entry.retry_count),
                    )
                    .await?;
                metrics::record_stale_reaped("failed");
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Poll and maintain until `shutdown` flips to `true` or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = self.runner.config();
        let mut poll = tokio::time::interval(config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut maintenance = tokio::time::interval(config.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            max_jobs = config.max_concurrent_jobs,
            poll_ms = config.poll_interval.as_millis() as u64,
            "Queue processor started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    let started = self.process_next_batch().await;
                    if started > 0 {
                        debug!(started, "Queue poll dispatched jobs");
                    }
                }
                _ = maintenance.tick() => {
                    let report = self.perform_maintenance().await;
                    debug!(?report, "Maintenance pass complete");
                }
            }
        }

        info!("Queue processor stopped");
    }
}
