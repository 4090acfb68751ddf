use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    spawn_validated,
};
use crate::models::{CoreError, CoreErrorKind};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CollectedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command to completion from blocking code and returns its decoded output.
///
/// Must be called from a thread that can block inside a tokio runtime, such as a
/// `spawn_blocking` task. Any exit code other than 0 is a `CommandFailed`.
pub fn run_and_collect(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> ExecutionResult<CollectedOutput> {
    let cluster = request.cluster;
    let operation = request.operation;
    let context = request.context.clone();
    let failure = |kind: CoreErrorKind, message: String| {
        let mut error =
            CoreError::new(kind, format!("{context}: {message}")).with_operation(operation);
        error.cluster = cluster;
        error
    };

    let handle = tokio::runtime::Handle::try_current()
        .map_err(|error| failure(CoreErrorKind::Internal, format!("no tokio runtime: {error}")))?;

    let process = spawn_validated(executor, request)?;
    let pid = process.pid();
    let output: ProcessOutput = handle.block_on(process.wait())?;
    tracing::debug!(
        operation = operation.as_str(),
        pid = ?pid,
        status = ?output.status,
        elapsed_ms = output
            .finished_at
            .duration_since(output.started_at)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default(),
        "external command finished"
    );

    match output.status {
        ProcessExitStatus::ExitCode(0) => Ok(CollectedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        ProcessExitStatus::ExitCode(code) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(failure(
                CoreErrorKind::CommandFailed,
                format!("exit code {code}: {}", stderr.trim()),
            ))
        }
        ProcessExitStatus::Terminated => Err(failure(
            CoreErrorKind::CommandFailed,
            "process was terminated by signal".to_string(),
        )),
    }
}

pub fn run_and_collect_stdout(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> ExecutionResult<String> {
    run_and_collect(executor, request).map(|output| output.stdout)
}
