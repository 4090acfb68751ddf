//! Deployment settings read from a TOML file.
//!
//! Lookup order for the file: an explicit path, then `INK_CONFIG_FILE`, then
//! `/etc/ink/config.toml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::adapters::{AdapterSettings, CondorJobTypeSettings};
use crate::clock::SiteClock;
use crate::connect::{ConnectSettings, OtpSettings};
use crate::gateway::GatewaySettings;
use crate::models::{CoreError, CoreErrorKind, SiteId};
use crate::reconcile::ReconcileSettings;

pub const CONFIG_ENV: &str = "INK_CONFIG_FILE";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ink/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required config key '{0}'")]
    Missing(&'static str),
    #[error("unknown site '{0}' in computing.site")]
    UnknownSite(String),
}

impl From<ConfigError> for CoreError {
    fn from(error: ConfigError) -> Self {
        CoreError::new(CoreErrorKind::Configuration, error.to_string())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub common: CommonSection,
    pub computing: ComputingSection,
    pub gateway: GatewaySection,
    pub connect: ConnectSection,
    pub database: DatabaseSection,
    pub reconcile: ReconcileSection,
    /// `[jobtype.<name>.htc]` tables.
    pub jobtype: BTreeMap<String, JobTypeSection>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CommonSection {
    pub krb5_enabled: bool,
    pub utc_offset_hours: i8,
}

impl Default for CommonSection {
    fn default() -> Self {
        Self {
            krb5_enabled: false,
            utc_offset_hours: 8,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ComputingSection {
    pub site: Option<String>,
    pub cluster_scripts: PathBuf,
    pub ink_dir: String,
    pub schedd_host: String,
    pub cm_host: String,
    pub iptables_jobtype: Vec<String>,
    /// Program and leading arguments; the username is appended.
    pub credential_command: Vec<String>,
    pub aklog_command: PathBuf,
}

impl Default for ComputingSection {
    fn default() -> Self {
        Self {
            site: None,
            cluster_scripts: PathBuf::from("/etc/ink/cluster_scripts"),
            ink_dir: "~".to_string(),
            schedd_host: String::new(),
            cm_host: String::new(),
            iptables_jobtype: Vec::new(),
            credential_command: Vec::new(),
            aklog_command: PathBuf::from("/usr/bin/aklog"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub host: Option<String>,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_script: String,
    pub delete_script: String,
    pub timeout_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let defaults = GatewaySettings::new("");
        Self {
            host: None,
            port: defaults.port,
            user: defaults.user,
            identity_file: None,
            connect_script: defaults.connect_script,
            delete_script: defaults.delete_script,
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

/// Web proxy for interactive services and the ssh login used to issue VNC passwords.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConnectSection {
    pub web_url: String,
    pub otp_script: String,
    pub otp_user: String,
    pub otp_port: u16,
    pub identity_file: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for ConnectSection {
    fn default() -> Self {
        let defaults = OtpSettings::default();
        Self {
            web_url: String::new(),
            otp_script: defaults.script,
            otp_user: defaults.user,
            otp_port: defaults.port,
            identity_file: None,
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/ink/ink.sqlite3"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub lock_dir: PathBuf,
    pub sweep_interval_secs: u64,
    pub backfill_interval_secs: u64,
    pub history_limit: u32,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        let defaults = ReconcileSettings::default();
        Self {
            lock_dir: defaults.lock_dir,
            sweep_interval_secs: defaults.sweep_interval.as_secs(),
            backfill_interval_secs: defaults.backfill_interval.as_secs(),
            history_limit: defaults.history_limit,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct JobTypeSection {
    pub htc: Option<CondorJobTypeSettings>,
}

/// Explicit path first, then the environment, then the system default.
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_ENV) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.site()?;
        settings.gateway_host()?;
        Ok(settings)
    }

    pub fn site(&self) -> Result<SiteId, ConfigError> {
        let site = self
            .computing
            .site
            .as_deref()
            .ok_or(ConfigError::Missing("computing.site"))?;
        site.parse()
            .map_err(|_| ConfigError::UnknownSite(site.to_string()))
    }

    fn gateway_host(&self) -> Result<&str, ConfigError> {
        self.gateway
            .host
            .as_deref()
            .filter(|host| !host.is_empty())
            .ok_or(ConfigError::Missing("gateway.host"))
    }

    pub fn clock(&self) -> SiteClock {
        SiteClock::from_offset_hours(self.common.utc_offset_hours)
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            cluster_scripts: self.computing.cluster_scripts.clone(),
            iptables_jobtypes: self.computing.iptables_jobtype.clone(),
            clock: self.clock(),
            schedd_host: self.computing.schedd_host.clone(),
            cm_host: self.computing.cm_host.clone(),
            condor_job_types: self
                .jobtype
                .iter()
                .filter_map(|(name, section)| {
                    section.htc.clone().map(|htc| (name.clone(), htc))
                })
                .collect(),
            connect: ConnectSettings {
                web_url: self.connect.web_url.clone(),
                gateway_host: self.gateway.host.clone().unwrap_or_default(),
            },
        }
    }

    pub fn otp_settings(&self) -> OtpSettings {
        let section = &self.connect;
        OtpSettings {
            port: section.otp_port,
            user: section.otp_user.clone(),
            identity_file: section.identity_file.clone(),
            script: section.otp_script.clone(),
            timeout: Duration::from_secs(section.timeout_secs),
        }
    }

    pub fn gateway_settings(&self) -> Result<GatewaySettings, ConfigError> {
        let section = &self.gateway;
        Ok(GatewaySettings {
            host: self.gateway_host()?.to_string(),
            port: section.port,
            user: section.user.clone(),
            identity_file: section.identity_file.clone(),
            connect_script: section.connect_script.clone(),
            delete_script: section.delete_script.clone(),
            timeout: Duration::from_secs(section.timeout_secs),
        })
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        let section = &self.reconcile;
        ReconcileSettings {
            lock_dir: section.lock_dir.clone(),
            sweep_interval: Duration::from_secs(section.sweep_interval_secs),
            backfill_interval: Duration::from_secs(section.backfill_interval_secs),
            history_limit: section.history_limit,
        }
    }
}
