//! Per-job subscriber channels.
//!
//! Each subscriber gets its own unbounded channel registered under the job
//! id. The registry lock covers only map mutation; items are pushed into the
//! channels after the lock is released. A [`Subscription`] ends itself after
//! yielding a terminal item and unregisters on drop, so no channel outlives
//! its reader or its job.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use vgen_models::{ExportJob, JobId, JobSnapshot};

/// Items that can mark the end of a job's stream.
pub trait Terminal {
    fn is_terminal(&self) -> bool;
}

impl Terminal for JobSnapshot {
    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl Terminal for ExportJob {
    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

type Channels<T> = HashMap<JobId, HashMap<u64, mpsc::UnboundedSender<T>>>;

struct Inner<T> {
    channels: Mutex<Channels<T>>,
    next_id: AtomicU64,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Channels<T>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, job_id: &JobId, id: u64) {
        let mut channels = self.lock();
        if let Some(subscribers) = channels.get_mut(job_id) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                channels.remove(job_id);
            }
        }
    }
}

/// Fan-out of per-job updates to any number of subscribers.
pub struct Broadcaster<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a channel for `job_id` whose first item is `initial`.
    ///
    /// When `initial` is terminal the channel is never registered and the
    /// subscription yields exactly that one item.
    pub fn subscribe(&self, job_id: &JobId, initial: T) -> Subscription<T>
    where
        T: Terminal,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let terminal = initial.is_terminal();
        // Receiver is alive, so this cannot fail.
        let _ = tx.send(initial);

        if terminal {
            return Subscription {
                rx,
                registration: None,
                done: false,
            };
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .entry(job_id.clone())
            .or_default()
            .insert(id, tx);
        debug!(job_id = %job_id, subscriber = id, "Subscriber registered");

        Subscription {
            rx,
            registration: Some(Registration {
                inner: Arc::clone(&self.inner),
                job_id: job_id.clone(),
                id,
            }),
            done: false,
        }
    }

    /// Deliver `item` to every subscriber of `job_id`.
    ///
    /// Callers publish one job's items from a single serialized context so
    /// they arrive in production order. Returns the number of live receivers.
    pub fn publish(&self, job_id: &JobId, item: &T) -> usize {
        let senders: Vec<(u64, mpsc::UnboundedSender<T>)> = {
            let channels = self.inner.lock();
            match channels.get(job_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (id, tx) in senders {
            if tx.send(item.clone()).is_ok() {
                delivered += 1;
            } else {
                self.inner.remove(job_id, id);
            }
        }
        delivered
    }

    /// Drop every channel for `job_id`. Readers drain what was already sent.
    pub fn close(&self, job_id: &JobId) {
        if let Some(subscribers) = self.inner.lock().remove(job_id) {
            debug!(job_id = %job_id, count = subscribers.len(), "Closed subscriber channels");
        }
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.inner.lock().get(job_id).map_or(0, HashMap::len)
    }

    /// Jobs that currently have at least one registered channel.
    pub fn job_count(&self) -> usize {
        self.inner.lock().len()
    }
}

struct Registration<T> {
    inner: Arc<Inner<T>>,
    job_id: JobId,
    id: u64,
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        self.inner.remove(&self.job_id, self.id);
    }
}

/// Stream of updates for one job.
///
/// Ends after the first terminal item, or when the broadcaster closes the
/// job's channels. Dropping it early unregisters the channel.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    registration: Option<Registration<T>>,
    done: bool,
}

impl<T> Unpin for Subscription<T> {}

impl<T> Subscription<T> {
    fn finish(&mut self) {
        self.done = true;
        self.registration = None;
        self.rx.close();
    }
}

impl<T: Terminal> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if item.is_terminal() {
                    this.finish();
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[derive(Debug, Clone, PartialEq)]
    struct Tick {
        n: u32,
        last: bool,
    }

    impl Terminal for Tick {
        fn is_terminal(&self) -> bool {
            self.last
        }
    }

    fn tick(n: u32) -> Tick {
        Tick { n, last: false }
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal_item() {
        let broadcaster = Broadcaster::new();
        let job = JobId::from_string("job-1");
        let mut sub = broadcaster.subscribe(&job, tick(0));

        broadcaster.publish(&job, &tick(1));
        broadcaster.publish(&job, &Tick { n: 2, last: true });
        broadcaster.publish(&job, &tick(3));

        let items: Vec<u32> = (&mut sub).map(|t| t.n).collect().await;
        assert_eq!(items, vec![0, 1, 2]);
        assert_eq!(broadcaster.subscriber_count(&job), 0);
        assert_eq!(broadcaster.job_count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_initial_yields_one_item() {
        let broadcaster = Broadcaster::new();
        let job = JobId::from_string("job-done");
        let sub = broadcaster.subscribe(&job, Tick { n: 9, last: true });
        assert_eq!(broadcaster.subscriber_count(&job), 0);

        let items: Vec<Tick> = sub.collect().await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let broadcaster = Broadcaster::new();
        let job = JobId::from_string("job-2");
        let a = broadcaster.subscribe(&job, tick(0));
        let b = broadcaster.subscribe(&job, tick(0));
        assert_eq!(broadcaster.subscriber_count(&job), 2);

        drop(a);
        assert_eq!(broadcaster.subscriber_count(&job), 1);
        assert_eq!(broadcaster.publish(&job, &tick(1)), 1);

        drop(b);
        assert_eq!(broadcaster.job_count(), 0);
        assert_eq!(broadcaster.publish(&job, &tick(2)), 0);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let broadcaster = Broadcaster::new();
        let job = JobId::from_string("job-3");
        let mut sub = broadcaster.subscribe(&job, tick(0));
        broadcaster.publish(&job, &tick(1));
        broadcaster.close(&job);

        assert_eq!(sub.next().await.map(|t| t.n), Some(0));
        assert_eq!(sub.next().await.map(|t| t.n), Some(1));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_jobs_are_isolated() {
        let broadcaster = Broadcaster::new();
        let a = JobId::from_string("a");
        let b = JobId::from_string("b");
        let mut sub_a = broadcaster.subscribe(&a, tick(0));

        broadcaster.publish(&b, &tick(100));
        broadcaster.publish(&a, &Tick { n: 1, last: true });

        let items: Vec<u32> = (&mut sub_a).map(|t| t.n).collect().await;
        assert_eq!(items, vec![0, 1]);
    }
}
