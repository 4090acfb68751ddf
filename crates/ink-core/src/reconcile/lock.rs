use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::models::{CoreError, CoreErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("cannot open lock file '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot lock '{}': {errno}", path.display())]
    Lock { path: PathBuf, errno: Errno },
}

impl From<LockError> for CoreError {
    fn from(error: LockError) -> Self {
        CoreError::new(CoreErrorKind::StorageFailure, error.to_string())
    }
}

/// An exclusive `flock` held until drop.
#[derive(Debug)]
pub struct TaskLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl TaskLock {
    /// Returns `None` without waiting when another holder has the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        let open_error = |source| LockError::Open {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(open_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(open_error)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self {
                _lock: lock,
                path: path.to_path_buf(),
            })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN => Ok(None),
            Err((_, errno)) => Err(LockError::Lock {
                path: path.to_path_buf(),
                errno,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
