//! Per-site staging of job directories.
//!
//! Every site runs the same ordered steps and aborts on the first failure:
//! resolve the directory, obtain and activate a delegated credential when the
//! site needs one, create the directory if absent, upload the credential and
//! launch scripts, then restrict the scripts to their owner.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::clock::SiteClock;
use crate::credentials::{CredentialFile, CredentialProvider, refresh_tokens};
use crate::execution::ProcessExecutor;
use crate::models::{CoreError, CoreErrorKind, CoreResult, JobOperation, SiteId};
use crate::storage::StorageBackend;
use crate::users::UserAccount;

mod hai;
mod heps;
mod ihep;

pub use hai::HaiEnvironment;
pub use heps::HepsEnvironment;
pub use ihep::{IhepEnvironment, experiment_group};

const DIR_MODE: u32 = 0o700;
const SCRIPT_MODE: u32 = 0o700;
const CREDENTIAL_MODE: u32 = 0o600;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchScript {
    pub local_path: PathBuf,
    pub file_name: String,
}

impl LaunchScript {
    /// `shell.sh` and `run.sh` from `<scripts_root>/<job_type>/`.
    pub fn standard_pair(scripts_root: &Path, job_type: &str) -> Vec<LaunchScript> {
        ["shell.sh", "run.sh"]
            .into_iter()
            .map(|name| LaunchScript {
                local_path: scripts_root.join(job_type).join(name),
                file_name: name.to_string(),
            })
            .collect()
    }
}

pub struct EnvironmentRequest<'a> {
    pub account: &'a UserAccount,
    pub job_type: &'a str,
    pub scripts: Vec<LaunchScript>,
    pub now: SystemTime,
}

/// A staged job directory. Dropping it removes the local credential file.
#[derive(Debug)]
pub struct JobEnvironment {
    pub job_dir: PathBuf,
    pub credential: Option<CredentialFile>,
    /// Copy of the credential inside the job directory, readable by the job.
    pub remote_credential: Option<PathBuf>,
}

pub trait EnvironmentBuilder: Send + Sync {
    fn site(&self) -> SiteId;

    fn build(&self, request: &EnvironmentRequest<'_>) -> CoreResult<JobEnvironment>;
}

/// Everything a site needs to obtain and activate delegated credentials.
#[derive(Clone)]
pub struct CredentialSupport {
    pub provider: Arc<dyn CredentialProvider>,
    pub executor: Arc<dyn ProcessExecutor>,
    pub aklog: PathBuf,
}

/// Shared staging steps; sites differ only in where the directory lives and
/// whether credentials are required.
#[derive(Clone)]
pub struct Staging {
    pub storage: Arc<dyn StorageBackend>,
    pub credentials: Option<CredentialSupport>,
    pub clock: SiteClock,
}

impl Staging {
    pub(crate) fn job_dir_name(&self, job_type: &str, now: SystemTime) -> String {
        format!("{job_type}-{}", self.clock.dir_stamp(now))
    }

    pub(crate) fn stage(
        &self,
        site: SiteId,
        request: &EnvironmentRequest<'_>,
        job_dir: PathBuf,
        with_credentials: bool,
    ) -> CoreResult<JobEnvironment> {
        let account = request.account;
        let credential = if with_credentials {
            Some(self.activate_credential(site, account, request.now)?)
        } else {
            None
        };

        let scripts = request
            .scripts
            .iter()
            .map(|script| {
                std::fs::read(&script.local_path)
                    .map(|bytes| (script.file_name.as_str(), bytes))
                    .map_err(|error| {
                        staging_error(
                            CoreErrorKind::StorageFailure,
                            format!(
                                "failed to read launch script '{}': {error}",
                                script.local_path.display()
                            ),
                        )
                    })
            })
            .collect::<CoreResult<Vec<_>>>()?;

        if self.storage.path_exists(account, &job_dir)?.is_none() {
            self.storage.mkdir(account, &job_dir, DIR_MODE)?;
        }

        let remote_credential = match &credential {
            Some(file) => {
                let dest = job_dir.join(format!("krb5cc_{}", account.uid));
                self.storage
                    .upload(account, file.bytes(), &dest, CREDENTIAL_MODE)?;
                Some(dest)
            }
            None => None,
        };

        for (file_name, bytes) in &scripts {
            let dest = job_dir.join(file_name);
            self.storage.upload(account, bytes, &dest, SCRIPT_MODE)?;
            self.storage.chmod(account, &dest, SCRIPT_MODE)?;
        }

        tracing::info!(
            site = site.as_str(),
            uid = account.uid,
            job_dir = %job_dir.display(),
            credential = credential.is_some(),
            "staged job directory"
        );

        Ok(JobEnvironment {
            job_dir,
            credential,
            remote_credential,
        })
    }

    fn activate_credential(
        &self,
        site: SiteId,
        account: &UserAccount,
        now: SystemTime,
    ) -> CoreResult<CredentialFile> {
        let support = self.credentials.as_ref().ok_or_else(|| {
            staging_error(
                CoreErrorKind::CredentialError,
                format!("site '{site}' requires delegated credentials but none are configured"),
            )
        })?;

        let token = support.provider.delegated_credential(&account.username)?;
        let file = CredentialFile::create(
            CredentialFile::local_path(account.uid, &self.clock.dir_stamp(now)),
            token,
        )?;
        refresh_tokens(support.executor.as_ref(), &support.aklog, file.path())?;
        Ok(file)
    }
}

fn staging_error(kind: CoreErrorKind, message: String) -> CoreError {
    CoreError::new(kind, message).with_operation(JobOperation::BuildEnvironment)
}
