use std::collections::BTreeMap;
use std::path::PathBuf;

use nix::unistd::{Group, User};

use crate::models::{CoreError, CoreErrorKind, Uid};

/// A local account jobs are submitted and staged as.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserAccount {
    pub uid: Uid,
    pub gid: u32,
    pub username: String,
    pub home: PathBuf,
    pub shell: PathBuf,
    /// Primary group name.
    pub group: String,
}

impl UserAccount {
    /// Login shells that understand `export`; anything else is treated as csh-like.
    pub fn has_posix_shell(&self) -> bool {
        matches!(
            self.shell.to_str(),
            Some("/bin/bash" | "/bin/sh" | "/bin/zsh" | "/usr/bin/bash" | "/usr/bin/zsh")
        )
    }
}

pub trait UserDirectory: Send + Sync {
    fn by_uid(&self, uid: Uid) -> Result<UserAccount, CoreError>;

    fn by_name(&self, username: &str) -> Result<UserAccount, CoreError>;
}

/// Resolves accounts from the host's passwd and group databases.
pub struct SystemUserDirectory;

impl SystemUserDirectory {
    fn account(user: User) -> Result<UserAccount, CoreError> {
        let group = Group::from_gid(user.gid)
            .map_err(|error| lookup_error(format!("group lookup for gid {} failed: {error}", user.gid)))?
            .map(|group| group.name)
            .unwrap_or_default();

        Ok(UserAccount {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            username: user.name,
            home: user.dir,
            shell: user.shell,
            group,
        })
    }
}

impl UserDirectory for SystemUserDirectory {
    fn by_uid(&self, uid: Uid) -> Result<UserAccount, CoreError> {
        let user = User::from_uid(nix::unistd::Uid::from_raw(uid))
            .map_err(|error| lookup_error(format!("user lookup for uid {uid} failed: {error}")))?
            .ok_or_else(|| lookup_error(format!("no user with uid {uid}")))?;
        Self::account(user)
    }

    fn by_name(&self, username: &str) -> Result<UserAccount, CoreError> {
        let user = User::from_name(username)
            .map_err(|error| lookup_error(format!("user lookup for '{username}' failed: {error}")))?
            .ok_or_else(|| lookup_error(format!("no user named '{username}'")))?;
        Self::account(user)
    }
}

/// Fixed account table, for tests and single-tenant deployments.
#[derive(Clone, Debug, Default)]
pub struct StaticUserDirectory {
    accounts: BTreeMap<Uid, UserAccount>,
}

impl StaticUserDirectory {
    pub fn new(accounts: impl IntoIterator<Item = UserAccount>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|account| (account.uid, account))
                .collect(),
        }
    }
}

impl UserDirectory for StaticUserDirectory {
    fn by_uid(&self, uid: Uid) -> Result<UserAccount, CoreError> {
        self.accounts
            .get(&uid)
            .cloned()
            .ok_or_else(|| lookup_error(format!("no user with uid {uid}")))
    }

    fn by_name(&self, username: &str) -> Result<UserAccount, CoreError> {
        self.accounts
            .values()
            .find(|account| account.username == username)
            .cloned()
            .ok_or_else(|| lookup_error(format!("no user named '{username}'")))
    }
}

fn lookup_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
