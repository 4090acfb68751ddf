use std::path::PathBuf;

use crate::environment::{EnvironmentBuilder, EnvironmentRequest, JobEnvironment, Staging};
use crate::models::{CoreResult, SiteId};
use crate::users::UserAccount;

/// Home directories, or a `<root>/<initial>/<username>` tree; credentials only when enabled.
pub struct HepsEnvironment {
    staging: Staging,
    ink_dir: String,
    krb5_enabled: bool,
}

impl HepsEnvironment {
    pub fn new(staging: Staging, ink_dir: impl Into<String>, krb5_enabled: bool) -> Self {
        Self {
            staging,
            ink_dir: ink_dir.into(),
            krb5_enabled,
        }
    }

    pub fn job_root(&self, account: &UserAccount) -> PathBuf {
        if self.ink_dir == "~" {
            return account.home.join(".ink/Jobs");
        }
        let initial = account
            .username
            .chars()
            .next()
            .map(String::from)
            .unwrap_or_default();
        PathBuf::from(&self.ink_dir)
            .join(initial)
            .join(&account.username)
            .join(".ink/Jobs")
    }
}

impl EnvironmentBuilder for HepsEnvironment {
    fn site(&self) -> SiteId {
        SiteId::Heps
    }

    fn build(&self, request: &EnvironmentRequest<'_>) -> CoreResult<JobEnvironment> {
        let job_dir = self
            .job_root(request.account)
            .join(self.staging.job_dir_name(request.job_type, request.now));
        self.staging
            .stage(SiteId::Heps, request, job_dir, self.krb5_enabled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::SiteClock;
    use crate::storage::LocalStorage;

    fn account() -> UserAccount {
        UserAccount {
            uid: 1001,
            gid: 1001,
            username: "alice".to_string(),
            home: PathBuf::from("/home/alice"),
            shell: PathBuf::from("/bin/bash"),
            group: "heps".to_string(),
        }
    }

    fn staging() -> Staging {
        Staging {
            storage: Arc::new(LocalStorage::unowned()),
            credentials: None,
            clock: SiteClock::default(),
        }
    }

    #[test]
    fn tilde_selects_home_directory() {
        let env = HepsEnvironment::new(staging(), "~", false);
        assert_eq!(
            env.job_root(&account()),
            PathBuf::from("/home/alice/.ink/Jobs")
        );
    }

    #[test]
    fn shared_root_is_partitioned_by_initial() {
        let env = HepsEnvironment::new(staging(), "/hepsfs/user", false);
        assert_eq!(
            env.job_root(&account()),
            PathBuf::from("/hepsfs/user/a/alice/.ink/Jobs")
        );
    }
}
