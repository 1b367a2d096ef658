//! In-memory queue store.
//!
//! A session owns the store lock for its whole lifetime, so it behaves like a
//! single exclusive connection: holding one blocks every other session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use vgen_models::{GenerationRequest, JobId};

use crate::entry::{EntryStatus, QueueEntry};
use crate::error::{QueueError, QueueResult};
use crate::store::{after, QueueSession, QueueStore};

#[derive(Default)]
struct State {
    /// Insertion sequence breaks enqueue-time ties
    next_seq: u64,
    entries: HashMap<String, (u64, QueueEntry)>,
}

impl State {
    fn ordered(&self) -> Vec<&QueueEntry> {
        let mut all: Vec<_> = self.entries.values().collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, e)| e).collect()
    }
}

/// Queue store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryQueueStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
    active_sessions: Arc<AtomicUsize>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `session()` fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sessions currently open.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Every entry, oldest first.
    pub async fn snapshot(&self) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        state.ordered().into_iter().cloned().collect()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn session(&self) -> QueueResult<Box<dyn QueueSession>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory store disabled".into()));
        }
        let guard = Arc::clone(&self.state).lock_owned().await;
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: guard,
            active_sessions: Arc::clone(&self.active_sessions),
        }))
    }
}

struct MemorySession {
    state: OwnedMutexGuard<State>,
    active_sessions: Arc<AtomicUsize>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySession {
    fn entry_mut(&mut self, entry_id: &str) -> QueueResult<&mut QueueEntry> {
        self.state
            .entries
            .get_mut(entry_id)
            .map(|(_, entry)| entry)
            .ok_or_else(|| QueueError::not_found(entry_id))
    }
}

#[async_trait]
impl QueueSession for MemorySession {
    async fn enqueue(&mut self, request: GenerationRequest) -> QueueResult<QueueEntry> {
        let entry = QueueEntry::new(request);
        let seq = self.state.next_seq;
        self.state.next_seq += 1;
        self.state
            .entries
            .insert(entry.entry_id.clone(), (seq, entry.clone()));
        Ok(entry)
    }

    async fn get(&mut self, entry_id: &str) -> QueueResult<Option<QueueEntry>> {
        Ok(self.state.entries.get(entry_id).map(|(_, e)| e.clone()))
    }

    async fn fetch_pending(&mut self, limit: usize) -> QueueResult<Vec<QueueEntry>> {
        let now = Utc::now();
        Ok(self
            .state
            .ordered()
            .into_iter()
            .filter(|e| e.is_pending() && e.available_at <= now)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&mut self, entry_id: &str, job_id: &JobId) -> QueueResult<bool> {
        let entry = self.entry_mut(entry_id)?;
        if !entry.is_pending() {
            return Ok(false);
        }
        entry.dispatch(job_id);
        Ok(true)
    }

    async fn heartbeat(&mut self, entry_id: &str) -> QueueResult<()> {
        let entry = self.entry_mut(entry_id)?;
        if entry.status == EntryStatus::Dispatched {
            entry.heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_completed(&mut self, entry_id: &str) -> QueueResult<()> {
        self.entry_mut(entry_id)?.finish(EntryStatus::Completed, None);
        Ok(())
    }

    async fn mark_failed(&mut self, entry_id: &str, error: &str) -> QueueResult<()> {
        self.entry_mut(entry_id)?
            .finish(EntryStatus::Failed, Some(error.to_string()));
        Ok(())
    }

    async fn requeue(&mut self, entry_id: &str, error: &str, delay: Duration) -> QueueResult<()> {
        self.entry_mut(entry_id)?.requeue(error, after(delay));
        Ok(())
    }

    async fn stale_dispatched(&mut self, cutoff: DateTime<Utc>) -> QueueResult<Vec<QueueEntry>> {
        Ok(self
            .state
            .ordered()
            .into_iter()
            .filter(|e| e.status == EntryStatus::Dispatched)
            .filter(|e| e.last_seen().map_or(true, |seen| seen < cutoff))
            .cloned()
            .collect())
    }
}
