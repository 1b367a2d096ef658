//! Queue store and session traits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vgen_models::{GenerationRequest, JobId};

use crate::entry::QueueEntry;
use crate::error::QueueResult;

/// Hands out short-lived sessions against the durable queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Open a session. Callers drop it before doing any long-running work.
    async fn session(&self) -> QueueResult<Box<dyn QueueSession>>;
}

/// Exclusive, short-lived access to the queue.
#[async_trait]
pub trait QueueSession: Send {
    async fn enqueue(&mut self, request: GenerationRequest) -> QueueResult<QueueEntry>;

    async fn get(&mut self, entry_id: &str) -> QueueResult<Option<QueueEntry>>;

    /// Pending entries whose backoff has elapsed, oldest first.
    async fn fetch_pending(&mut self, limit: usize) -> QueueResult<Vec<QueueEntry>>;

    /// Claim a pending entry for `job_id`. Returns `false` when the entry is
    /// no longer pending (claimed elsewhere or finished).
    async fn mark_dispatched(&mut self, entry_id: &str, job_id: &JobId) -> QueueResult<bool>;

    async fn heartbeat(&mut self, entry_id: &str) -> QueueResult<()>;

    async fn mark_completed(&mut self, entry_id: &str) -> QueueResult<()>;

    async fn mark_failed(&mut self, entry_id: &str, error: &str) -> QueueResult<()>;

    /// Put a dispatched entry back to pending with `retry_count + 1`,
    /// available again after `delay`.
    async fn requeue(&mut self, entry_id: &str, error: &str, delay: Duration) -> QueueResult<()>;

    /// Dispatched entries with no sign of life since `cutoff`.
    async fn stale_dispatched(&mut self, cutoff: DateTime<Utc>) -> QueueResult<Vec<QueueEntry>>;
}

/// `now + delay`, saturating on overflow.
pub(crate) fn after(delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
