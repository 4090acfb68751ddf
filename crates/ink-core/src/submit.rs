//! Privilege-drop wrappers that run a scheduler submit command as the job owner.

use std::path::Path;

use crate::execution::CommandSpec;
use crate::shell;
use crate::users::UserAccount;

const AKLOG: &str = "/usr/bin/aklog";

pub struct SubmitInvocation<'a> {
    pub account: &'a UserAccount,
    pub job_type: &'a str,
    pub job_dir: &'a Path,
    /// Credential copy inside the job directory, when the site uses one.
    pub credential: Option<&'a Path>,
    /// Scheduler command words, e.g. `["sbatch", "--parsable", ...]`.
    pub command: &'a [String],
}

pub trait Submitter: Send + Sync {
    fn command(&self, invocation: &SubmitInvocation<'_>) -> CommandSpec;
}

fn env_assignment(account: &UserAccount, key: &str, value: &str) -> String {
    if account.has_posix_shell() {
        format!("export {key}={value}")
    } else {
        format!("setenv {key} {value}")
    }
}

fn scheduler_words(invocation: &SubmitInvocation<'_>) -> String {
    shell::join(invocation.command.iter().map(String::as_str))
}

/// `su - USER -c "cd DIR && export KRB5CCNAME=... && aklog && <cmd>"`.
#[derive(Clone, Debug, Default)]
pub struct LoginShellSubmitter {
    kerberos: bool,
}

impl LoginShellSubmitter {
    pub fn new(kerberos: bool) -> Self {
        Self { kerberos }
    }
}

impl Submitter for LoginShellSubmitter {
    fn command(&self, invocation: &SubmitInvocation<'_>) -> CommandSpec {
        let account = invocation.account;
        let mut parts = vec![format!(
            "cd {}",
            shell::quote(&invocation.job_dir.to_string_lossy())
        )];
        if self.kerberos
            && let Some(credential) = invocation.credential
        {
            parts.push(env_assignment(
                account,
                "KRB5CCNAME",
                &shell::quote(&credential.to_string_lossy()),
            ));
            parts.push(AKLOG.to_string());
        }
        parts.push(scheduler_words(invocation));

        CommandSpec::new("su")
            .arg("-")
            .arg(account.username.as_str())
            .arg("-c")
            .arg(parts.join(" && "))
    }
}

/// HTCondor variant: pins the system PATH and library path so the user's
/// environment cannot shadow `condor_submit`. Interactive types skip the login shell.
#[derive(Clone, Debug)]
pub struct CondorLoginSubmitter {
    kerberos: bool,
}

impl CondorLoginSubmitter {
    pub const DIRECT_SHELL_TYPES: [&'static str; 3] = ["jupyter", "npu", "vnc"];

    pub fn new(kerberos: bool) -> Self {
        Self { kerberos }
    }
}

impl Submitter for CondorLoginSubmitter {
    fn command(&self, invocation: &SubmitInvocation<'_>) -> CommandSpec {
        let account = invocation.account;
        let direct_shell = Self::DIRECT_SHELL_TYPES.contains(&invocation.job_type);

        let mut parts = vec![format!(
            "cd {}",
            shell::quote(&invocation.job_dir.to_string_lossy())
        )];
        if self.kerberos
            && let Some(credential) = invocation.credential
        {
            parts.push(env_assignment(
                account,
                "KRB5CCNAME",
                &shell::quote(&credential.to_string_lossy()),
            ));
        }
        parts.push(env_assignment(account, "PATH", "/usr/bin:$PATH"));
        parts.push(env_assignment(
            account,
            "LD_LIBRARY_PATH",
            "/lib64:$LD_LIBRARY_PATH",
        ));
        if !direct_shell {
            parts.push(env_assignment(account, "INKPATH", "$PATH"));
            parts.push(env_assignment(account, "INKLDPATH", "$LD_LIBRARY_PATH"));
        }
        parts.push(scheduler_words(invocation));

        let spec = CommandSpec::new("su");
        let spec = if direct_shell {
            let shell_path = if account.has_posix_shell() {
                "/bin/bash"
            } else {
                "/bin/tcsh"
            };
            spec.args(["-s", shell_path])
        } else {
            spec.arg("-")
        };
        spec.arg(account.username.as_str())
            .arg("-c")
            .arg(parts.join(" && "))
    }
}

/// `sudo -iu USER bash -lc 'cd DIR && <cmd>'`.
#[derive(Clone, Debug, Default)]
pub struct SudoLoginSubmitter;

impl Submitter for SudoLoginSubmitter {
    fn command(&self, invocation: &SubmitInvocation<'_>) -> CommandSpec {
        let script = format!(
            "cd {} && {}",
            shell::quote(&invocation.job_dir.to_string_lossy()),
            scheduler_words(invocation)
        );
        CommandSpec::new("sudo")
            .arg("-iu")
            .arg(invocation.account.username.as_str())
            .args(["bash", "-lc"])
            .arg(script)
    }
}
