//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum jobs running at once on this worker
    pub max_concurrent_jobs: usize,
    /// Scratch space; each job gets `{work_dir}/{job_id}`
    pub work_dir: PathBuf,
    /// Rendered videos are written here as `{job_id}.mp4`
    pub output_dir: PathBuf,
    /// Wait between SIGTERM and SIGKILL for tracked processes
    pub kill_grace_period: Duration,
    /// Upper bound on one render
    pub render_timeout: Duration,
    /// Rendered frame size
    pub video_width: u32,
    pub video_height: u32,
    /// Terminal jobs are evicted from memory after this long
    pub retention: Duration,
    /// Progress events kept per job
    pub history_limit: usize,
    /// Queue poll interval
    pub poll_interval: Duration,
    /// Maintenance pass interval
    pub maintenance_interval: Duration,
    /// Dispatched entries without a heartbeat for this long are reaped
    pub stale_threshold: Duration,
    /// Reaped entries are requeued until they reach this retry count
    pub max_retries: u32,
    /// Delay before a requeued entry becomes eligible again
    pub retry_delay: Duration,
    /// Upper bound on entries fetched per poll
    pub batch_size: usize,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            work_dir: PathBuf::from("/tmp/vgen/work"),
            output_dir: PathBuf::from("/tmp/vgen/output"),
            kill_grace_period: Duration::from_secs(5),
            render_timeout: Duration::from_secs(1800),
            video_width: 1280,
            video_height: 720,
            retention: Duration::from_secs(3600),
            history_limit: 256,
            poll_interval: Duration::from_secs(2),
            maintenance_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300), // 5 minutes
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
            batch_size: 8,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: std::env::var("WORKER_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            output_dir: std::env::var("WORKER_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            kill_grace_period: Duration::from_secs(
                std::env::var("WORKER_KILL_GRACE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            render_timeout: Duration::from_secs(
                std::env::var("WORKER_RENDER_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1800),
            ),
            video_width: std::env::var("VIDEO_WIDTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.video_width),
            video_height: std::env::var("VIDEO_HEIGHT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.video_height),
            retention: Duration::from_secs(
                std::env::var("WORKER_JOB_RETENTION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            history_limit: std::env::var("WORKER_HISTORY_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.history_limit),
            poll_interval: Duration::from_millis(
                std::env::var("QUEUE_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2000),
            ),
            maintenance_interval: Duration::from_secs(
                std::env::var("QUEUE_MAINTENANCE_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            stale_threshold: Duration::from_secs(
                std::env::var("QUEUE_STALE_THRESHOLD_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            max_retries: std::env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_delay: Duration::from_secs(
                std::env::var("QUEUE_RETRY_DELAY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            batch_size: std::env::var("QUEUE_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_keep_heartbeats_inside_stale_window() {
        let config = WorkerConfig::default();
        assert!(config.maintenance_interval < config.stale_threshold);
        assert!(config.max_concurrent_jobs > 0);
    }
}
