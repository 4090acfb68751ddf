//! Connection details for interactive jobs.
//!
//! Web services write `app_login.info` into the job directory once they
//! listen; enode jobs are reached through the gateway rule instead. VNC
//! sessions additionally need a one-time password issued on the worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::execution::{ProcessExecutor, ProcessSpawnRequest, run_and_collect};
use crate::gateway::{info_field, ssh_command};
use crate::models::{CoreError, CoreErrorKind, CoreResult, JobOperation, JobRecord};

pub const APP_LOGIN_FILE: &str = "app_login.info";

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectInfo {
    Ssh {
        gateway_host: String,
        port: u32,
    },
    Jupyter {
        host: String,
        port: u16,
        token: String,
        url: String,
    },
    Vscode {
        host: String,
        port: u16,
        password: String,
    },
    Rootbrowse {
        host: String,
        port: u16,
        token: String,
        url: String,
    },
    Vnc {
        host: String,
        port: u16,
        url: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectKind {
    Ssh,
    Jupyter,
    Vscode,
    Rootbrowse,
    Vnc,
}

impl ConnectKind {
    pub fn for_job_type(job_type: &str) -> Option<Self> {
        match job_type {
            "enode" | "sshd" => Some(Self::Ssh),
            "jupyter" => Some(Self::Jupyter),
            "vscode" | "npu" | "compile" => Some(Self::Vscode),
            "rootbrowse" => Some(Self::Rootbrowse),
            "vnc" | "ink_special" => Some(Self::Vnc),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectSettings {
    /// Base URL of the web proxy in front of the worker nodes.
    pub web_url: String,
    /// Host users ssh to for enode jobs.
    pub gateway_host: String,
}

impl ConnectSettings {
    fn web_base(&self) -> CoreResult<&str> {
        let base = self.web_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::Configuration,
                "connect.web_url is not configured",
            ));
        }
        Ok(base)
    }
}

/// `HOST`, `PORT` and, when present, `TOKEN` and `PASSWD`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppLogin {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub password: Option<String>,
}

pub fn parse_app_login(raw: &str) -> CoreResult<AppLogin> {
    let field = |key: &str| info_field(raw, key).filter(|value| !value.is_empty());
    let host = field("HOST").ok_or_else(|| parse_error("app login info has no HOST"))?;
    let port = field("PORT").ok_or_else(|| parse_error("app login info has no PORT"))?;
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| parse_error(&format!("app login PORT '{port}' is not a port number")))?;
    Ok(AppLogin {
        host,
        port,
        token: field("TOKEN"),
        password: field("PASSWD"),
    })
}

/// Builds the details for a job from its record and, for web services, the
/// contents of its login file.
pub fn connect_info(
    kind: ConnectKind,
    record: &JobRecord,
    login: Option<&str>,
    settings: &ConnectSettings,
    otp: &dyn OtpIssuer,
    username: &str,
) -> CoreResult<ConnectInfo> {
    if kind == ConnectKind::Ssh {
        return ssh_info(record, settings);
    }

    let login = login.ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::NotReady,
            format!(
                "job {} has not written {APP_LOGIN_FILE} yet",
                record.job_id
            ),
        )
    })?;
    let AppLogin {
        host,
        port,
        token,
        password,
    } = parse_app_login(login)?;

    Ok(match kind {
        ConnectKind::Jupyter => {
            let token = token.ok_or_else(|| parse_error("jupyter login info has no TOKEN"))?;
            let url = format!(
                "{}/jupyter/{host}/{port}/lab?token={token}",
                settings.web_base()?
            );
            ConnectInfo::Jupyter {
                host,
                port,
                token,
                url,
            }
        }
        ConnectKind::Rootbrowse => {
            let token = token.ok_or_else(|| parse_error("rootbrowse login info has no TOKEN"))?;
            let url = format!(
                "{}/rootbrowse/{host}/{port}/win1/?key={token}",
                settings.web_base()?
            );
            ConnectInfo::Rootbrowse {
                host,
                port,
                token,
                url,
            }
        }
        ConnectKind::Vscode => {
            let password =
                password.ok_or_else(|| parse_error("vscode login info has no PASSWD"))?;
            ConnectInfo::Vscode {
                host,
                port,
                password,
            }
        }
        ConnectKind::Vnc => {
            let base = settings.web_base()?;
            let password = otp.issue(&host, username)?;
            ConnectInfo::Vnc {
                url: format!("{base}/vnc/{host}/{port}/vnc.html?password={password}&autoconnect=true"),
                host,
                port,
            }
        }
        ConnectKind::Ssh => ssh_info(record, settings)?,
    })
}

fn ssh_info(record: &JobRecord, settings: &ConnectSettings) -> CoreResult<ConnectInfo> {
    if record.iptable_status != 0 {
        return Ok(ConnectInfo::Ssh {
            gateway_host: settings.gateway_host.clone(),
            port: record.iptable_status,
        });
    }
    if record.iptable_clean {
        return Err(CoreError::new(
            CoreErrorKind::GatewayRuleError,
            format!("job {} has expired; its gateway rule was closed", record.job_id),
        ));
    }
    Err(CoreError::new(
        CoreErrorKind::NotReady,
        format!("job {} has no gateway rule yet", record.job_id),
    ))
}

fn parse_error(message: &str) -> CoreError {
    CoreError::new(CoreErrorKind::ParseFailure, message)
}

/// Issues one-time VNC passwords on a worker node.
pub trait OtpIssuer: Send + Sync {
    fn issue(&self, worker_host: &str, username: &str) -> CoreResult<String>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OtpSettings {
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    /// Run on the worker as the job owner; prints the password.
    pub script: String,
    pub timeout: Duration,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            port: 22,
            user: "root".to_string(),
            identity_file: None,
            script: "/cvmfs/common.ihep.ac.cn/software/noVNC-master/utils/generateOTP.sh"
                .to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Runs the OTP script over `ssh` as the job owner through `sudo -iu`.
pub struct SshOtpIssuer {
    executor: Arc<dyn ProcessExecutor>,
    settings: OtpSettings,
}

impl SshOtpIssuer {
    pub fn new(executor: Arc<dyn ProcessExecutor>, settings: OtpSettings) -> Self {
        Self { executor, settings }
    }

    pub fn request(&self, worker_host: &str, username: &str) -> ProcessSpawnRequest {
        let settings = &self.settings;
        let command = ssh_command(
            &settings.user,
            worker_host,
            settings.port,
            settings.identity_file.as_deref(),
            &["sudo", "-iu", username, &settings.script],
        );
        ProcessSpawnRequest::new(JobOperation::Connect, "generate vnc password failed", command)
            .timeout(settings.timeout)
    }
}

impl OtpIssuer for SshOtpIssuer {
    fn issue(&self, worker_host: &str, username: &str) -> CoreResult<String> {
        let output = run_and_collect(self.executor.as_ref(), self.request(worker_host, username))?;
        let password = output.stdout.trim();
        if password.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::CredentialError,
                format!("OTP script on {worker_host} printed no password"),
            )
            .with_operation(JobOperation::Connect));
        }
        tracing::debug!(worker = worker_host, username, "issued vnc password");
        Ok(password.to_string())
    }
}
