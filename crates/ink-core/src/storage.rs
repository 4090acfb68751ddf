use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid, chown};

use crate::models::{CoreError, CoreErrorKind};
use crate::users::UserAccount;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathKind {
    File,
    Directory,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("permission denied on '{}'", path.display())]
    PermissionDenied { path: PathBuf },
    #[error("'{}' does not exist", path.display())]
    NotFound { path: PathBuf },
    #[error("i/o error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn from_io(path: &Path, source: std::io::Error) -> Self {
        let path = path.to_path_buf();
        match source.kind() {
            ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(error: StorageError) -> Self {
        CoreError::new(CoreErrorKind::StorageFailure, error.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// File operations on the shared filesystem, performed on behalf of `owner`.
pub trait StorageBackend: Send + Sync {
    fn path_exists(&self, owner: &UserAccount, path: &Path) -> StorageResult<Option<PathKind>>;

    fn mkdir(&self, owner: &UserAccount, path: &Path, mode: u32) -> StorageResult<()>;

    fn upload(&self, owner: &UserAccount, bytes: &[u8], dest: &Path, mode: u32)
    -> StorageResult<()>;

    fn chmod(&self, owner: &UserAccount, path: &Path, mode: u32) -> StorageResult<()>;

    /// `None` when the file does not exist.
    fn read_file(&self, owner: &UserAccount, path: &Path) -> StorageResult<Option<String>>;
}

/// A POSIX mount (NFS, Lustre, FUSE) visible to this host.
#[derive(Clone, Debug, Default)]
pub struct LocalStorage {
    chown_to_owner: bool,
}

impl LocalStorage {
    /// Created paths are handed to the owning account; requires root.
    pub fn owned() -> Self {
        Self {
            chown_to_owner: true,
        }
    }

    /// Created paths keep the service account as owner.
    pub fn unowned() -> Self {
        Self {
            chown_to_owner: false,
        }
    }

    fn hand_over(&self, owner: &UserAccount, path: &Path) -> StorageResult<()> {
        if !self.chown_to_owner {
            return Ok(());
        }
        chown(
            path,
            Some(Uid::from_raw(owner.uid)),
            Some(Gid::from_raw(owner.gid)),
        )
        .map_err(|errno| StorageError::from_io(path, std::io::Error::from(errno)))
    }
}

impl StorageBackend for LocalStorage {
    fn path_exists(&self, _owner: &UserAccount, path: &Path) -> StorageResult<Option<PathKind>> {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => Ok(Some(PathKind::Directory)),
            Ok(_) => Ok(Some(PathKind::File)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StorageError::from_io(path, error)),
        }
    }

    fn mkdir(&self, owner: &UserAccount, path: &Path, mode: u32) -> StorageResult<()> {
        let mut missing = Vec::new();
        let mut cursor = Some(path);
        while let Some(current) = cursor {
            if current.exists() {
                break;
            }
            missing.push(current.to_path_buf());
            cursor = current.parent();
        }

        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)
            .map_err(|error| StorageError::from_io(path, error))?;

        for created in missing.iter().rev() {
            self.hand_over(owner, created)?;
        }
        Ok(())
    }

    fn upload(
        &self,
        owner: &UserAccount,
        bytes: &[u8],
        dest: &Path,
        mode: u32,
    ) -> StorageResult<()> {
        fs::write(dest, bytes).map_err(|error| StorageError::from_io(dest, error))?;
        self.chmod(owner, dest, mode)?;
        self.hand_over(owner, dest)
    }

    fn chmod(&self, _owner: &UserAccount, path: &Path, mode: u32) -> StorageResult<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|error| StorageError::from_io(path, error))
    }

    fn read_file(&self, _owner: &UserAccount, path: &Path) -> StorageResult<Option<String>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StorageError::from_io(path, error)),
        }
    }
}
