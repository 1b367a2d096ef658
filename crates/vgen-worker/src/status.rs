//! Status store for generation jobs.
//!
//! Owns the job collection. Every update is an atomic replace under the
//! store lock: the mutation runs on a copy, and only a successful mutation
//! is written back and published. Publishing happens under the same lock,
//! which serializes each job's events and keeps them in production order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use vgen_models::{Job, JobId, JobSnapshot, ProgressEvent};

use crate::broadcast::{Broadcaster, Subscription};
use crate::error::{WorkerError, WorkerResult};

struct JobRecord {
    job: Job,
    history: VecDeque<ProgressEvent>,
    next_seq: u64,
}

impl JobRecord {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from_job(&self.job, self.history.back())
    }
}

/// `now - retention`, saturating at the earliest representable instant.
pub(crate) fn retention_cutoff(retention: Duration) -> DateTime<Utc> {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(retention)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Job records, progress history and live subscriptions.
#[derive(Clone)]
pub struct StatusStore {
    jobs: Arc<Mutex<HashMap<JobId, JobRecord>>>,
    broadcaster: Broadcaster<JobSnapshot>,
    history_limit: usize,
}

impl StatusStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            broadcaster: Broadcaster::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster<JobSnapshot> {
        &self.broadcaster
    }

    /// Add a new job. Ids are unique for the store's lifetime.
    pub async fn insert(&self, job: Job) -> WorkerResult<JobSnapshot> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(WorkerError::conflict(format!("job {} already exists", job.id)));
        }
        let record = JobRecord {
            job,
            history: VecDeque::new(),
            next_seq: 0,
        };
        let snapshot = record.snapshot();
        jobs.insert(snapshot.job_id.clone(), record);
        Ok(snapshot)
    }

    /// Apply `mutate` to the job and record `event` as one atomic step.
    ///
    /// The event's sequence number and percentage are filled in from the
    /// store. If `mutate` fails the stored job is unchanged and nothing is
    /// published.
    pub async fn update<F>(
        &self,
        job_id: &JobId,
        mut event: ProgressEvent,
        mutate: F,
    ) -> WorkerResult<JobSnapshot>
    where
        F: FnOnce(&mut Job) -> WorkerResult<()>,
    {
        let mut jobs = self.jobs.lock().await;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| WorkerError::not_found(format!("job {}", job_id)))?;

        let mut job = record.job.clone();
        mutate(&mut job)?;

        record.next_seq += 1;
        event.job_id = job_id.clone();
        event.seq = record.next_seq;
        event.percent = job.progress;

        let snapshot = JobSnapshot::from_job(&job, Some(&event));
        record.job = job;
        record.history.push_back(event);
        while record.history.len() > self.history_limit {
            record.history.pop_front();
        }

        self.broadcaster.publish(job_id, &snapshot);
        if snapshot.is_terminal() {
            self.broadcaster.close(job_id);
        }
        Ok(snapshot)
    }

    /// Record a progress milestone on a non-terminal job.
    pub async fn progress(&self, job_id: &JobId, event: ProgressEvent) -> WorkerResult<JobSnapshot> {
        let stage = event.stage;
        let percent = event.percent;
        self.update(job_id, event, |job| {
            if job.is_terminal() {
                return Err(WorkerError::AlreadyFinal(job.state));
            }
            job.set_progress(stage, percent);
            Ok(())
        })
        .await
    }

    pub async fn get(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.jobs.lock().await.get(job_id).map(JobRecord::snapshot)
    }

    /// Full job record, including stage attempts.
    pub async fn job(&self, job_id: &JobId) -> Option<Job> {
        self.jobs.lock().await.get(job_id).map(|r| r.job.clone())
    }

    /// Retained progress events, oldest first.
    pub async fn history(&self, job_id: &JobId) -> Option<Vec<ProgressEvent>> {
        self.jobs
            .lock()
            .await
            .get(job_id)
            .map(|r| r.history.iter().cloned().collect())
    }

    /// Live snapshots for a job, starting with the current one.
    pub async fn subscribe(&self, job_id: &JobId) -> Option<Subscription<JobSnapshot>> {
        let jobs = self.jobs.lock().await;
        let snapshot = jobs.get(job_id)?.snapshot();
        Some(self.broadcaster.subscribe(job_id, snapshot))
    }

    /// Remove terminal jobs finished more than `retention` ago.
    pub async fn evict_terminal(&self, retention: Duration) -> Vec<JobId> {
        let cutoff = retention_cutoff(retention);
        let mut jobs = self.jobs.lock().await;
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|r| r.job.is_terminal())
            .filter(|r| r.job.completed_at.map_or(false, |at| at <= cutoff))
            .map(|r| r.job.id.clone())
            .collect();
        for id in &expired {
            jobs.remove(id);
            self.broadcaster.close(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Evicted finished jobs");
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}
