//! Queue processor tests against the in-memory queue store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use common::{request, test_config, visual_ok, voice_ok, Behavior, FakeProvider, FakeRenderer};
use vgen_models::{Capability, JobId, JobState, ProviderTier};
use vgen_providers::ProviderSet;
use vgen_queue::{EntryStatus, MemoryQueueStore, QueueStore};
use vgen_worker::{Orchestrator, WorkerConfig, WorkerError};

const WAIT: Duration = Duration::from_secs(20);

fn providers(script: Behavior) -> ProviderSet {
    ProviderSet::new()
        .with_script(FakeProvider::new("script", Capability::Script, ProviderTier::Free, script))
        .with_voice(voice_ok())
        .with_visual(visual_ok())
}

fn queued(config: WorkerConfig, store: &Arc<MemoryQueueStore>, script: Behavior) -> Orchestrator {
    Orchestrator::builder(config)
        .providers(providers(script))
        .renderer(FakeRenderer::instant())
        .queue(store.clone())
        .build()
}

async fn wait_for_entries(store: &MemoryQueueStore, status: EntryStatus, count: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            let done = store
                .snapshot()
                .await
                .iter()
                .filter(|e| e.status == status)
                .count();
            if done >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("entries did not reach the expected status");
}

#[tokio::test]
async fn test_dispatch_respects_capacity_and_releases_sessions() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryQueueStore::new());
    let config = WorkerConfig {
        max_concurrent_jobs: 2,
        ..test_config(&dir)
    };
    let orchestrator = queued(config, &store, Behavior::Slow(Duration::from_millis(300)));
    let processor = orchestrator.processor().unwrap();

    for n in 0..3 {
        orchestrator.enqueue(request(&format!("queued job {}", n))).await.unwrap();
    }

    assert_eq!(processor.process_next_batch().await, 2);
    assert_eq!(orchestrator.runner().active_count(), 2);
    assert_eq!(processor.inflight().len(), 2);
    // Jobs are running but no queue session is held for them.
    assert_eq!(store.active_sessions(), 0);

    // At capacity: nothing more is fetched.
    assert_eq!(processor.process_next_batch().await, 0);

    wait_for_entries(&store, EntryStatus::Completed, 2).await;
    tokio::time::timeout(WAIT, async {
        while orchestrator.runner().active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(processor.process_next_batch().await, 1);
    wait_for_entries(&store, EntryStatus::Completed, 3).await;

    for entry in store.snapshot().await {
        let job_id = entry.job_id.expect("dispatched entries record their job");
        let snapshot = orchestrator.status(&job_id).await.unwrap();
        assert_eq!(snapshot.state, JobState::Completed);
    }
    assert!(processor.inflight().is_empty());
}

#[tokio::test]
async fn test_failed_job_is_written_back() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryQueueStore::new());
    let orchestrator = queued(test_config(&dir), &store, Behavior::Fail);
    let processor = orchestrator.processor().unwrap();

    let entry = orchestrator.enqueue(request("doomed")).await.unwrap();
    assert_eq!(processor.process_next_batch().await, 1);
    wait_for_entries(&store, EntryStatus::Failed, 1).await;

    let stored = store
        .snapshot()
        .await
        .into_iter()
        .find(|e| e.entry_id == entry.entry_id)
        .unwrap();
    assert!(stored.error.unwrap().contains("every provider failed"));
}

#[tokio::test]
async fn test_invalid_request_is_not_enqueued() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryQueueStore::new());
    let orchestrator = queued(test_config(&dir), &store, Behavior::Succeed);

    let result = orchestrator.enqueue(request("")).await;
    assert!(matches!(result, Err(WorkerError::InvalidInput(_))));
    assert!(store.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_unavailable_store_skips_cycle() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryQueueStore::new());
    let orchestrator = queued(test_config(&dir), &store, Behavior::Succeed);
    let processor = orchestrator.processor().unwrap();
    orchestrator.enqueue(request("waiting out the outage")).await.unwrap();

    store.set_unavailable(true);
    assert_eq!(processor.process_next_batch().await, 0);
    let report = processor.perform_maintenance().await;
    assert_eq!(report.requeued, 0);
    assert_eq!(orchestrator.runner().active_count(), 0);

    store.set_unavailable(false);
    assert_eq!(processor.process_next_batch().await, 1);
    wait_for_entries(&store, EntryStatus::Completed, 1).await;
}

#[tokio::test]
async fn test_stale_entries_are_requeued_then_failed() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryQueueStore::new());
    let config = WorkerConfig {
        stale_threshold: Duration::ZERO,
        max_retries: 1,
        retry_delay: Duration::ZERO,
        ..test_config(&dir)
    };
    let orchestrator = queued(config, &store, Behavior::Succeed);
    let processor = orchestrator.processor().unwrap();

    // Claimed by a worker that then disappeared.
    let entry = {
        let mut session = store.session().await.unwrap();
        let entry = session.enqueue(request("orphaned")).await.unwrap();
        assert!(session.mark_dispatched(&entry.entry_id, &JobId::new()).await.unwrap());
        entry
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = processor.perform_maintenance().await;
    assert_eq!(report.requeued, 1);
    let stored = store.snapshot().await.into_iter().next().unwrap();
    assert_eq!(stored.status, EntryStatus::Pending);
    assert_eq!(stored.retry_count, 1);

    {
        let mut session = store.session().await.unwrap();
        assert!(session.mark_dispatched(&entry.entry_id, &JobId::new()).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = processor.perform_maintenance().await;
    assert_eq!(report.failed, 1);
    let stored = store.snapshot().await.into_iter().next().unwrap();
    assert_eq!(stored.status, EntryStatus::Failed);
}

#[tokio::test]
async fn test_running_entries_are_not_reaped() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryQueueStore::new());
    let config = WorkerConfig {
        stale_threshold: Duration::ZERO,
        ..test_config(&dir)
    };
    let orchestrator = queued(config, &store, Behavior::Slow(Duration::from_millis(300)));
    let processor = orchestrator.processor().unwrap();

    orchestrator.enqueue(request("still going")).await.unwrap();
    assert_eq!(processor.process_next_batch().await, 1);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = processor.perform_maintenance().await;
    assert_eq!(report.requeued, 0);
    assert_eq!(report.heartbeats, 1);

    wait_for_entries(&store, EntryStatus::Completed, 1).await;
    let stored = store.snapshot().await.into_iter().next().unwrap();
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn test_run_stops_on_shutdown_signal() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryQueueStore::new());
    let orchestrator = queued(test_config(&dir), &store, Behavior::Succeed);
    let processor = orchestrator.processor().unwrap().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { processor.run(shutdown_rx).await });

    orchestrator.enqueue(request("picked up by the loop")).await.unwrap();
    wait_for_entries(&store, EntryStatus::Completed, 1).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(store.active_sessions(), 0);
}
