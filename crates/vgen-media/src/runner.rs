//! Tracked subprocess runner with cancellation and timeout.
//!
//! Processes are registered in the [`ProcessRegistry`] for their whole
//! lifetime. Cancellation cannot be observed by the child directly, so a
//! fired token is turned into a registry kill (graceful, then forced).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vgen_models::JobId;

use crate::error::{MediaError, MediaResult};
use crate::registry::ProcessRegistry;

/// Lines of stderr kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Description of a process to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable name or path
    pub program: String,
    pub args: Vec<String>,
    /// Name shown in the registry (defaults to the program name)
    pub name: String,
    /// Bytes written to stdin before it is closed
    pub stdin: Option<Vec<u8>>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args: Vec::new(),
            stdin: None,
            working_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Output of a successful process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr_tail: String,
}

enum StopReason {
    Cancelled,
    TimedOut(Duration),
}

/// Spawns processes on behalf of jobs and keeps the registry in sync.
#[derive(Clone)]
pub struct ProcessRunner {
    registry: Arc<ProcessRegistry>,
}

impl ProcessRunner {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Run a process to completion.
    pub async fn run(
        &self,
        spec: &ProcessSpec,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> MediaResult<ProcessOutput> {
        self.run_with_lines(spec, job_id, cancel, |_| {}).await
    }

    /// Run a process, handing every stderr line to `on_stderr_line`.
    pub async fn run_with_lines<F>(
        &self,
        spec: &ProcessSpec,
        job_id: &JobId,
        cancel: &CancellationToken,
        mut on_stderr_line: F,
    ) -> MediaResult<ProcessOutput>
    where
        F: FnMut(&str) + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(MediaError::Cancelled);
        }

        let program = which::which(&spec.program)
            .map_err(|_| MediaError::BinaryNotFound(spec.program.clone()))?;

        debug!("Running {}: {} {}", spec.name, program.display(), spec.args.join(" "));

        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| MediaError::internal(format!("{} exited before registration", spec.name)))?;
        self.registry.register(pid, &spec.name, job_id);

        if let (Some(data), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    debug!("stdin write to pid {} failed: {}", pid, e);
                }
                // Dropping stdin closes the pipe.
            });
        }

        let stdout_task = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stdout.read_to_end(&mut buf).await;
                buf
            })
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    on_stderr_line(&line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        let registry = Arc::clone(&self.registry);
        let wait = async {
            let status = child.wait().await;
            registry.unregister(pid);
            status
        };
        tokio::pin!(wait);

        let deadline = async {
            match spec.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        let stop = tokio::select! {
            status = &mut wait => {
                let status = status?;
                let stdout = match stdout_task {
                    Some(t) => t.await.unwrap_or_default(),
                    None => Vec::new(),
                };
                let stderr_tail = match stderr_task {
                    Some(t) => t.await.unwrap_or_default(),
                    None => String::new(),
                };

                if status.success() {
                    return Ok(ProcessOutput { stdout, stderr_tail });
                }
                // Killed from outside (job cancel) before this select saw the token
                if cancel.is_cancelled() {
                    return Err(MediaError::Cancelled);
                }
                return Err(MediaError::process_failed(
                    &spec.name,
                    "exited with non-zero status",
                    Some(stderr_tail),
                    status.code(),
                ));
            }
            _ = cancel.cancelled() => StopReason::Cancelled,
            _ = deadline => StopReason::TimedOut(spec.timeout.unwrap_or_default()),
        };

        match stop {
            StopReason::Cancelled => info!("{} (pid {}) cancelled, terminating", spec.name, pid),
            StopReason::TimedOut(t) => warn!(
                "{} (pid {}) timed out after {} seconds, terminating",
                spec.name,
                pid,
                t.as_secs()
            ),
        }

        // Kill and reap concurrently so the exit is observed without waiting
        // out the whole grace period.
        let (kill_result, _) = tokio::join!(self.registry.kill(pid), &mut wait);
        if let Err(e) = kill_result {
            warn!("Failed to terminate {} (pid {}): {}", spec.name, pid, e);
        }

        match stop {
            StopReason::Cancelled => Err(MediaError::Cancelled),
            StopReason::TimedOut(t) => Err(MediaError::Timeout(t.as_secs())),
        }
    }
}
