use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncReadExt;

use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessWaitFuture, RunningProcess,
};
use crate::models::{ClusterId, CoreError, CoreErrorKind, JobOperation};

const REAP_WINDOW: Duration = Duration::from_secs(1);
const READ_WINDOW: Duration = Duration::from_millis(250);

/// Spawns each command in its own process group so a timeout can kill the whole tree.
pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let origin = Origin::of(&request);
        let child = cmd.spawn().map_err(|error| {
            origin.failure(
                CoreErrorKind::CommandFailed,
                format!("failed to spawn '{}': {error}", request.command.display()),
            )
        })?;

        let pid = child.id();
        tracing::debug!(
            cluster = ?request.cluster,
            operation = request.operation.as_str(),
            pid = ?pid,
            command = %request.command.display(),
            "spawned external command"
        );

        Ok(Box::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            pid,
            started_at: SystemTime::now(),
            timeout: request.timeout,
            origin,
        }))
    }
}

#[derive(Clone)]
struct Origin {
    cluster: Option<ClusterId>,
    operation: JobOperation,
    context: String,
}

impl Origin {
    fn of(request: &ProcessSpawnRequest) -> Self {
        Self {
            cluster: request.cluster,
            operation: request.operation,
            context: request.context.clone(),
        }
    }

    fn failure(&self, kind: CoreErrorKind, message: String) -> CoreError {
        let mut error = CoreError::new(kind, format!("{}: {message}", self.context))
            .with_operation(self.operation);
        error.cluster = self.cluster;
        error
    }
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    pid: Option<u32>,
    started_at: SystemTime,
    timeout: Option<Duration>,
    origin: Origin,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let child = self.child.into_inner().ok().flatten();
        let timeout = self.timeout;
        let started_at = self.started_at;
        let origin = self.origin;
        let pid = self.pid;

        Box::pin(async move {
            let mut child = child.ok_or_else(|| {
                origin.failure(
                    CoreErrorKind::Internal,
                    "child process already consumed".to_string(),
                )
            })?;

            let stdout_reader = {
                let mut stdout = child.stdout.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stdout.take() {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };
            let stderr_reader = {
                let mut stderr = child.stderr.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stderr.take() {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };

            let wait_err = |error: std::io::Error| {
                origin.failure(
                    CoreErrorKind::CommandFailed,
                    format!("failed to wait for process: {error}"),
                )
            };

            // Wait for exit first, then read output with a short bounded window.
            // Descendants that inherited stdout/stderr must not keep us waiting.
            let status = if let Some(timeout_duration) = timeout {
                match tokio::time::timeout(timeout_duration, child.wait()).await {
                    Ok(result) => result.map_err(wait_err)?,
                    Err(_) => {
                        if let Some(pid) = pid {
                            kill_group(pid);
                        }
                        let reaped = tokio::time::timeout(REAP_WINDOW, child.wait()).await;
                        if !matches!(reaped, Ok(Ok(_))) {
                            tracing::warn!(
                                operation = origin.operation.as_str(),
                                pid = ?pid,
                                "timed out process was not reaped within the kill window"
                            );
                        }
                        stdout_reader.abort();
                        stderr_reader.abort();
                        return Err(origin.failure(
                            CoreErrorKind::CommandTimeout,
                            format!("process timed out after {}ms", timeout_duration.as_millis()),
                        ));
                    }
                }
            } else {
                child.wait().await.map_err(wait_err)?
            };

            let stdout = match tokio::time::timeout(READ_WINDOW, stdout_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };
            let stderr = match tokio::time::timeout(READ_WINDOW, stderr_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };

            let status = match status.code() {
                Some(code) => ProcessExitStatus::ExitCode(code),
                None => ProcessExitStatus::Terminated,
            };

            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

/// Sends SIGKILL to the whole process group led by `pid`.
fn kill_group(pid: u32) {
    let pgid = -(pid as libc::pid_t);
    if unsafe { libc::kill(pgid, libc::SIGKILL) } != 0 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, %error, "failed to kill timed out process group");
        }
    }
}
