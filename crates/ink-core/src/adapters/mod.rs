use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::SiteClock;
use crate::connect::{ConnectInfo, ConnectSettings, OtpIssuer};
use crate::environment::EnvironmentBuilder;
use crate::gateway::ConnectionGateway;
use crate::models::{
    ClusterId, CoreError, CoreErrorKind, CoreResult, JobFilter, JobOutput, JobSpec, JobView,
    SubmitOutcome,
};
use crate::persistence::JobStore;
use crate::storage::StorageBackend;
use crate::users::UserAccount;

pub mod htcondor;
pub mod htcondor_process;
mod lifecycle;
pub mod readiness;
pub mod slurm;
pub mod slurm_process;

pub use htcondor::{CondorAdapter, CondorJobTypeSettings, CondorSource, CondorTarget};
pub use htcondor_process::ProcessCondorSource;
pub use lifecycle::replace_job_id;
pub use slurm::{SlurmAdapter, SlurmSource};
pub use slurm_process::ProcessSlurmSource;

/// Submit, list and cancel against one scheduler, on behalf of one user.
///
/// Calls block on external processes; async callers run them on a blocking thread.
pub trait SchedulerAdapter: Send + Sync {
    fn cluster(&self) -> ClusterId;

    fn account(&self) -> &UserAccount;

    fn submit_job(&self, spec: &JobSpec) -> CoreResult<SubmitOutcome>;

    /// Lists the user's jobs and reconciles each row with the job store,
    /// opening or closing gateway rules as jobs start and finish.
    fn query_job(&self, filter: &JobFilter) -> CoreResult<Vec<JobView>>;

    fn cancel_job(&self, job_id: &str) -> CoreResult<()>;

    fn job_output(&self, job_id: &str) -> CoreResult<JobOutput>;

    /// How to reach an interactive job's service.
    fn connect_info(&self, job_id: &str) -> CoreResult<ConnectInfo>;
}

/// Deployment settings shared by both backends.
#[derive(Clone, Debug, Default)]
pub struct AdapterSettings {
    pub cluster_scripts: PathBuf,
    /// Job types that get a gateway rule once their service is up.
    pub iptables_jobtypes: Vec<String>,
    pub clock: SiteClock,
    pub schedd_host: String,
    pub cm_host: String,
    pub condor_job_types: BTreeMap<String, CondorJobTypeSettings>,
    pub connect: ConnectSettings,
}

impl AdapterSettings {
    pub fn exposes_gateway(&self, job_type: &str) -> bool {
        self.iptables_jobtypes.iter().any(|exposed| exposed == job_type)
    }
}

/// Collaborators an adapter instance works with, bound to one user.
#[derive(Clone)]
pub struct AdapterContext {
    pub account: UserAccount,
    pub store: Arc<dyn JobStore>,
    pub storage: Arc<dyn StorageBackend>,
    pub gateway: ConnectionGateway,
    pub environment: Arc<dyn EnvironmentBuilder>,
    pub otp: Arc<dyn OtpIssuer>,
    pub settings: Arc<AdapterSettings>,
}

pub(crate) fn validate_job_id(job_id: &str) -> CoreResult<()> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("'{job_id}' is not a scheduler job id"),
        ))
    }
}

/// Splits a listing into non-empty lines; empty output means no jobs.
pub(crate) fn listing_lines(raw: &str) -> impl Iterator<Item = &str> {
    raw.lines().map(str::trim).filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_listing_has_no_rows() {
        assert_eq!(listing_lines("").count(), 0);
        assert_eq!(listing_lines("\n  \n").count(), 0);
        assert_eq!(listing_lines("a\n\nb\n").collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn job_ids_cannot_smuggle_flags() {
        assert!(validate_job_id("12345").is_ok());
        assert!(validate_job_id("812.0").is_ok());
        assert!(validate_job_id("").is_err());
        assert!(validate_job_id("-a").is_err());
        assert!(validate_job_id("1 2").is_err());
    }

    #[test]
    fn only_listed_job_types_expose_gateway() {
        let settings = AdapterSettings {
            iptables_jobtypes: vec!["enode".to_string(), "vnc".to_string()],
            ..AdapterSettings::default()
        };
        assert!(settings.exposes_gateway("enode"));
        assert!(!settings.exposes_gateway("common"));
    }
}
