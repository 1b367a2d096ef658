//! Registry of OS processes spawned on behalf of jobs.
//!
//! Every subprocess a job launches (encoders, local model binaries) is
//! registered here so it can be listed and torn down. Termination is
//! graceful-then-forced: SIGTERM, wait up to the grace period, SIGKILL.
//! Entries are always removed once a kill request finishes, however the
//! process ended.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::join_all;
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vgen_models::{JobId, TrackedProcess};

use crate::error::{MediaError, MediaResult};

/// Default wait between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Poll interval for liveness checks while waiting for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a kill request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The pid was not registered (already exited and unregistered).
    NotTracked,
    /// The process exited within the grace period.
    Graceful,
    /// The process had to be force-killed.
    Forced,
}

struct Entry {
    process: TrackedProcess,
    exited: watch::Sender<bool>,
}

/// Thread-safe registry of tracked processes.
pub struct ProcessRegistry {
    entries: Mutex<HashMap<u32, Entry>>,
    grace_period: Duration,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ProcessRegistry {
    /// Create a registry with the given SIGTERM -> SIGKILL grace period.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Entry>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a process. Re-registering a pid replaces the previous entry.
    pub fn register(&self, pid: u32, name: impl Into<String>, job_id: &JobId) -> TrackedProcess {
        let process = TrackedProcess::new(pid, name, job_id.clone());
        let (exited, _) = watch::channel(false);
        debug!(pid, name = %process.name, job_id = %job_id, "Registered process");
        self.lock().insert(
            pid,
            Entry {
                process: process.clone(),
                exited,
            },
        );
        process
    }

    /// Stop tracking a process, waking anyone waiting for it to exit.
    pub fn unregister(&self, pid: u32) -> Option<TrackedProcess> {
        let entry = self.lock().remove(&pid)?;
        entry.exited.send_replace(true);
        debug!(pid, name = %entry.process.name, "Unregistered process");
        Some(entry.process)
    }

    /// Snapshot of every tracked process.
    pub fn get_active(&self) -> Vec<TrackedProcess> {
        let mut active: Vec<_> = self.lock().values().map(|e| e.process.clone()).collect();
        active.sort_by_key(|p| (p.started_at, p.pid));
        active
    }

    /// Snapshot of the processes owned by one job.
    pub fn get_for_job(&self, job_id: &JobId) -> Vec<TrackedProcess> {
        let mut owned: Vec<_> = self
            .lock()
            .values()
            .filter(|e| &e.process.job_id == job_id)
            .map(|e| e.process.clone())
            .collect();
        owned.sort_by_key(|p| (p.started_at, p.pid));
        owned
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.lock().contains_key(&pid)
    }

    /// Terminate a process: SIGTERM, wait the grace period, then SIGKILL.
    ///
    /// The entry is unregistered when this returns, regardless of outcome.
    pub async fn kill(&self, pid: u32) -> MediaResult<KillOutcome> {
        let exited_rx = match self.lock().get(&pid) {
            Some(entry) => entry.exited.subscribe(),
            None => return Ok(KillOutcome::NotTracked),
        };

        let result = self.terminate(pid, exited_rx).await;
        self.unregister(pid);

        if let Ok(outcome) = &result {
            counter!("vgen_processes_killed_total", "outcome" => format!("{:?}", outcome).to_lowercase())
                .increment(1);
        }
        result
    }

    async fn terminate(&self, pid: u32, mut exited_rx: watch::Receiver<bool>) -> MediaResult<KillOutcome> {
        if !signal::terminate(pid)? {
            debug!(pid, "Process already gone before SIGTERM");
            return Ok(KillOutcome::Graceful);
        }

        let exited = tokio::time::timeout(self.grace_period, async {
            tokio::select! {
                // Err means the entry was dropped, which also means it exited.
                _ = async { let _ = exited_rx.wait_for(|done| *done).await; } => {}
                _ = wait_until_dead(pid) => {}
            }
        })
        .await;

        if exited.is_ok() {
            info!(pid, "Process exited after SIGTERM");
            return Ok(KillOutcome::Graceful);
        }

        warn!(
            pid,
            grace_ms = self.grace_period.as_millis() as u64,
            "Process ignored SIGTERM, force killing"
        );
        signal::force_kill(pid)?;
        Ok(KillOutcome::Forced)
    }

    /// Terminate every process owned by a job, concurrently.
    pub async fn kill_all_for_job(&self, job_id: &JobId) -> Vec<(u32, MediaResult<KillOutcome>)> {
        let pids: Vec<u32> = self.get_for_job(job_id).iter().map(|p| p.pid).collect();
        if pids.is_empty() {
            return Vec::new();
        }

        info!(job_id = %job_id, count = pids.len(), "Terminating job processes");
        let results = join_all(pids.iter().map(|pid| self.kill(*pid))).await;
        pids.into_iter().zip(results).collect()
    }
}

async fn wait_until_dead(pid: u32) {
    while signal::is_alive(pid) {
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
mod signal {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    use super::{MediaError, MediaResult};

    fn send(pid: u32, sig: Signal) -> MediaResult<bool> {
        match kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(MediaError::Signal {
                pid,
                message: e.to_string(),
            }),
        }
    }

    /// Returns false if the process no longer exists.
    pub fn terminate(pid: u32) -> MediaResult<bool> {
        send(pid, Signal::SIGTERM)
    }

    pub fn force_kill(pid: u32) -> MediaResult<bool> {
        send(pid, Signal::SIGKILL)
    }

    pub fn is_alive(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

#[cfg(not(unix))]
mod signal {
    use super::{MediaError, MediaResult};

    pub fn terminate(_pid: u32) -> MediaResult<bool> {
        Err(MediaError::Unsupported("process signals".into()))
    }

    pub fn force_kill(_pid: u32) -> MediaResult<bool> {
        Err(MediaError::Unsupported("process signals".into()))
    }

    pub fn is_alive(_pid: u32) -> bool {
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::process::Command;

    fn spawn_sleep(registry: &Arc<ProcessRegistry>, job_id: &JobId) -> u32 {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        registry.register(pid, "sleep", job_id);

        // Reap the child and unregister like the runner does.
        let registry = Arc::clone(registry);
        tokio::spawn(async move {
            let _ = child.wait().await;
            registry.unregister(pid);
        });
        pid
    }

    #[test]
    fn test_register_and_snapshots() {
        let registry = ProcessRegistry::default();
        let job_a = JobId::from_string("a");
        let job_b = JobId::from_string("b");

        registry.register(100, "ffmpeg", &job_a);
        registry.register(101, "piper", &job_a);
        registry.register(200, "ffmpeg", &job_b);

        assert_eq!(registry.get_active().len(), 3);
        assert_eq!(registry.get_for_job(&job_a).len(), 2);

        let removed = registry.unregister(101).unwrap();
        assert_eq!(removed.name, "piper");
        assert!(registry.unregister(101).is_none());
        assert_eq!(registry.get_for_job(&job_a).len(), 1);
    }

    #[tokio::test]
    async fn test_kill_untracked_is_noop() {
        let registry = ProcessRegistry::default();
        assert_eq!(registry.kill(999_999).await.unwrap(), KillOutcome::NotTracked);
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let registry = Arc::new(ProcessRegistry::default());
        let handles: Vec<_> = (0..64u32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let job = JobId::from_string(format!("job-{}", i % 4));
                    registry.register(10_000 + i, "worker", &job);
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.get_active().len(), 64);
        assert_eq!(registry.get_for_job(&JobId::from_string("job-0")).len(), 16);
    }

    #[tokio::test]
    async fn test_kill_all_for_job_terminates_gracefully() {
        let registry = Arc::new(ProcessRegistry::new(Duration::from_secs(2)));
        let job = JobId::from_string("job-kill");
        let other = JobId::from_string("job-keep");

        spawn_sleep(&registry, &job);
        spawn_sleep(&registry, &job);
        let keep = spawn_sleep(&registry, &other);

        let results = registry.kill_all_for_job(&job).await;
        assert_eq!(results.len(), 2);
        for (_, outcome) in &results {
            assert_eq!(outcome.as_ref().unwrap(), &KillOutcome::Graceful);
        }
        assert!(registry.get_for_job(&job).is_empty());
        assert!(registry.is_tracked(keep));

        registry.kill(keep).await.unwrap();
        assert!(registry.get_active().is_empty());
    }

    #[tokio::test]
    async fn test_kill_forces_after_grace_period() {
        let registry = Arc::new(ProcessRegistry::new(Duration::from_millis(200)));
        let job = JobId::from_string("stubborn");

        // Ignore SIGTERM so only SIGKILL ends it.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        registry.register(pid, "sh", &job);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reaper = tokio::spawn(async move { child.wait().await });
        let outcome = registry.kill(pid).await.unwrap();

        assert_eq!(outcome, KillOutcome::Forced);
        assert!(!registry.is_tracked(pid));
        let status = reaper.await.unwrap().unwrap();
        assert!(!status.success());
    }
}
