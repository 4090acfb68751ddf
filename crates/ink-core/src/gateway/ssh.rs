use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::execution::{CommandSpec, ProcessExecutor, ProcessSpawnRequest, run_and_collect};
use crate::gateway::GatewayRuleRunner;
use crate::models::{CoreError, CoreErrorKind, CoreResult, JobOperation, Uid};
use crate::shell;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_script: String,
    pub delete_script: String,
    pub timeout: Duration,
}

impl GatewaySettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: "root".to_string(),
            identity_file: None,
            connect_script: "/root/INK/sshd/connect.sh".to_string(),
            delete_script: "/root/INK/sshd/delete_iptables.sh".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// A non-interactive `ssh` invocation that runs `words`, quoted, on `host`.
pub(crate) fn ssh_command(
    user: &str,
    host: &str,
    port: u16,
    identity_file: Option<&Path>,
    words: &[&str],
) -> CommandSpec {
    let mut command = CommandSpec::new("ssh");
    if let Some(identity) = identity_file {
        command = command.arg("-i").arg(identity.to_string_lossy());
    }
    command
        .arg("-p")
        .arg(port.to_string())
        .args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            "LogLevel=ERROR",
        ])
        .arg(format!("{user}@{host}"))
        .arg(shell::join(words.iter().copied()))
}

/// Runs the gateway's rule scripts through the `ssh` client.
pub struct SshGatewayRunner {
    executor: Arc<dyn ProcessExecutor>,
    settings: GatewaySettings,
}

impl SshGatewayRunner {
    pub fn new(executor: Arc<dyn ProcessExecutor>, settings: GatewaySettings) -> Self {
        Self { executor, settings }
    }

    pub fn remote_request(
        &self,
        operation: JobOperation,
        context: &str,
        script: &str,
        args: &[String],
    ) -> ProcessSpawnRequest {
        let mut words = vec!["bash", script];
        words.extend(args.iter().map(String::as_str));

        let settings = &self.settings;
        let command = ssh_command(
            &settings.user,
            &settings.host,
            settings.port,
            settings.identity_file.as_deref(),
            &words,
        );

        ProcessSpawnRequest::new(operation, context, command).timeout(self.settings.timeout)
    }

    fn run(&self, request: ProcessSpawnRequest) -> CoreResult<String> {
        let operation = request.operation;
        let output = run_and_collect(self.executor.as_ref(), request).map_err(|error| {
            CoreError::new(CoreErrorKind::GatewayRuleError, error.message).with_operation(operation)
        })?;
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::GatewayRuleError,
                format!("gateway script reported an error: {stderr}"),
            )
            .with_operation(operation));
        }
        Ok(output.stdout)
    }
}

impl GatewayRuleRunner for SshGatewayRunner {
    fn create_rule(&self, worker_host: &str, worker_port: u16, owner: Uid) -> CoreResult<u32> {
        let request = self.remote_request(
            JobOperation::OpenGateway,
            "build gateway rule failed",
            &self.settings.connect_script,
            &[
                worker_host.to_string(),
                worker_port.to_string(),
                owner.to_string(),
            ],
        );
        let stdout = self.run(request)?;
        parse_rule_port(&stdout)
    }

    fn delete_rule(&self, port: u32) -> CoreResult<()> {
        let request = self.remote_request(
            JobOperation::CloseGateway,
            "delete gateway rule failed",
            &self.settings.delete_script,
            &[port.to_string()],
        );
        self.run(request).map(|_| ())
    }
}

/// The connect script prints the assigned port as the only token on its last line.
pub fn parse_rule_port(stdout: &str) -> CoreResult<u32> {
    let last = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or_default();
    last.parse::<u32>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::GatewayRuleError,
                format!("gateway script did not return a port: '{last}'"),
            )
            .with_operation(JobOperation::OpenGateway)
        })
}
