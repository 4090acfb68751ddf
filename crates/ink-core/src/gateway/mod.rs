//! Forwarding rules on the public gateway host for interactive jobs.

use std::path::Path;
use std::sync::Arc;

use crate::models::{CoreError, CoreErrorKind, CoreResult, JobKey, JobOperation, JobRecord, Uid};
use crate::persistence::JobStore;
use crate::storage::StorageBackend;
use crate::users::UserAccount;

mod ssh;

pub use ssh::{GatewaySettings, SshGatewayRunner, parse_rule_port};
pub(crate) use ssh::ssh_command;

pub const LOGIN_INFO_FILE: &str = "ssh_login.info";

/// Creates and deletes rules on the gateway host.
pub trait GatewayRuleRunner: Send + Sync {
    /// Returns the externally assigned forwarding port.
    fn create_rule(&self, worker_host: &str, worker_port: u16, owner: Uid) -> CoreResult<u32>;

    fn delete_rule(&self, port: u32) -> CoreResult<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenOutcome {
    Opened { port: u32 },
    AlreadyOpen { port: u32 },
    /// The rule was torn down earlier; a job never gets a second one.
    AlreadyCleaned,
}

#[derive(Clone)]
pub struct ConnectionGateway {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn GatewayRuleRunner>,
    storage: Arc<dyn StorageBackend>,
}

impl ConnectionGateway {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn GatewayRuleRunner>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            store,
            runner,
            storage,
        }
    }

    pub fn open(&self, key: &JobKey, owner: &UserAccount) -> CoreResult<OpenOutcome> {
        self.open_inner(key, owner)
            .map_err(|error| error.attribute(key.cluster, JobOperation::OpenGateway, key.uid, Some(&key.job_id)))
    }

    fn open_inner(&self, key: &JobKey, owner: &UserAccount) -> CoreResult<OpenOutcome> {
        let record = self.store.get_job(key)?;
        if let Some(outcome) = settled(&record) {
            return Ok(outcome);
        }

        let info_path = Path::new(&record.job_path).join(LOGIN_INFO_FILE);
        let info = self.storage.read_file(owner, &info_path)?.ok_or_else(|| {
            gateway_error(format!(
                "login info '{}' has not been written yet",
                info_path.display()
            ))
        })?;
        let (worker_host, worker_port) = parse_login_info(&info)?;

        let port = self.runner.create_rule(&worker_host, worker_port, key.uid)?;

        let recorded = match self.store.record_gateway_port(key, port) {
            Ok(recorded) => recorded,
            Err(error) => {
                // Unrecorded rules are invisible to close and reconcile.
                if let Err(delete_error) = self.runner.delete_rule(port) {
                    tracing::warn!(
                        job_id = %key.job_id,
                        port,
                        kind = ?delete_error.kind,
                        message = %delete_error.message,
                        "failed to delete unrecorded gateway rule"
                    );
                }
                return Err(error);
            }
        };

        if recorded {
            tracing::info!(
                cluster = %key.cluster,
                uid = key.uid,
                job_id = %key.job_id,
                worker = %format!("{worker_host}:{worker_port}"),
                port,
                "opened gateway rule"
            );
            return Ok(OpenOutcome::Opened { port });
        }

        // Another caller recorded a rule first; ours is surplus.
        if let Err(error) = self.runner.delete_rule(port) {
            tracing::warn!(
                job_id = %key.job_id,
                port,
                kind = ?error.kind,
                message = %error.message,
                "failed to delete surplus gateway rule"
            );
        }
        let record = self.store.get_job(key)?;
        Ok(settled(&record).unwrap_or(OpenOutcome::AlreadyCleaned))
    }

    /// Deletes the remote rule best-effort, then always marks the record cleaned.
    /// Returns `false` when the record was already clean.
    pub fn close(&self, key: &JobKey, gateway_port: u32) -> CoreResult<bool> {
        let record = self.store.get_job(key).map_err(|error| {
            error.attribute(key.cluster, JobOperation::CloseGateway, key.uid, Some(&key.job_id))
        })?;
        if record.iptable_clean {
            return Ok(false);
        }

        if gateway_port != 0
            && let Err(error) = self.runner.delete_rule(gateway_port)
        {
            tracing::warn!(
                cluster = %key.cluster,
                job_id = %key.job_id,
                port = gateway_port,
                kind = ?error.kind,
                message = %error.message,
                "gateway rule deletion failed; marking cleaned anyway"
            );
        }

        let cleaned = self.store.mark_gateway_cleaned(key).map_err(|error| {
            error.attribute(key.cluster, JobOperation::CloseGateway, key.uid, Some(&key.job_id))
        })?;
        if cleaned {
            tracing::info!(
                cluster = %key.cluster,
                job_id = %key.job_id,
                port = gateway_port,
                "closed gateway rule"
            );
        }
        Ok(cleaned)
    }

    /// Closes the rule recorded on `record`, if one is open.
    pub fn close_if_open(&self, record: &JobRecord) -> CoreResult<bool> {
        if !record.has_open_rule() {
            return Ok(false);
        }
        self.close(&record.key(), record.iptable_status)
    }
}

fn settled(record: &JobRecord) -> Option<OpenOutcome> {
    if record.iptable_status != 0 {
        Some(OpenOutcome::AlreadyOpen {
            port: record.iptable_status,
        })
    } else if record.iptable_clean {
        Some(OpenOutcome::AlreadyCleaned)
    } else {
        None
    }
}

/// Reads `HOST` and `PORT` from a login-info file: a JSON object, or
/// `"KEY": value` lines when the file is not valid JSON.
pub fn parse_login_info(raw: &str) -> CoreResult<(String, u16)> {
    let host = info_field(raw, "HOST")
        .filter(|host| !host.is_empty())
        .ok_or_else(|| gateway_error("login info has no HOST".to_string()))?;
    let port = info_field(raw, "PORT")
        .ok_or_else(|| gateway_error("login info has no PORT".to_string()))?;
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| gateway_error(format!("login info PORT '{port}' is not a port number")))?;
    Ok((host, port))
}

pub(crate) fn info_field(raw: &str, key: &str) -> Option<String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match value.get(key)? {
            serde_json::Value::String(text) => Some(text.trim().to_string()),
            serde_json::Value::Number(number) => Some(number.to_string()),
            _ => None,
        },
        Err(_) => {
            let prefix = format!("\"{key}\"");
            raw.lines()
                .map(str::trim)
                .find(|line| line.starts_with(&prefix))
                .and_then(|line| line.split_once(':'))
                .map(|(_, value)| {
                    value
                        .trim()
                        .trim_matches(|c| c == '"' || c == ',' || c == ' ')
                        .to_string()
                })
        }
    }
}

fn gateway_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::GatewayRuleError, message)
}
