use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::execution::{CommandSpec, ProcessExecutor, ProcessSpawnRequest, run_and_collect_stdout};
use crate::models::{CoreError, CoreErrorKind, CoreResult, JobOperation, Uid};

const ISSUE_TIMEOUT: Duration = Duration::from_secs(10);
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Issues a short-lived delegated credential (a Kerberos ccache) for a user.
pub trait CredentialProvider: Send + Sync {
    fn delegated_credential(&self, username: &str) -> CoreResult<Vec<u8>>;
}

/// Runs `<program> <args..> <username>` and base64-decodes its stdout.
pub struct CommandCredentialProvider {
    executor: Arc<dyn ProcessExecutor>,
    command: CommandSpec,
}

impl CommandCredentialProvider {
    pub fn new(executor: Arc<dyn ProcessExecutor>, command: CommandSpec) -> Self {
        Self { executor, command }
    }
}

impl CredentialProvider for CommandCredentialProvider {
    fn delegated_credential(&self, username: &str) -> CoreResult<Vec<u8>> {
        let request = ProcessSpawnRequest::new(
            JobOperation::BuildEnvironment,
            "issue delegated credential failed",
            self.command.clone().arg(username),
        )
        .timeout(ISSUE_TIMEOUT);

        let stdout = run_and_collect_stdout(self.executor.as_ref(), request)
            .map_err(|error| credential_error(error.message))?;
        decode_token(&stdout)
    }
}

/// Hands out the same credential for every user.
#[derive(Clone, Debug)]
pub struct StaticCredentialProvider {
    token: Vec<u8>,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn delegated_credential(&self, _username: &str) -> CoreResult<Vec<u8>> {
        Ok(self.token.clone())
    }
}

pub fn decode_token(raw: &str) -> CoreResult<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(credential_error("credential issuer returned an empty token"));
    }
    STANDARD
        .decode(trimmed)
        .map_err(|error| credential_error(format!("credential token is not valid base64: {error}")))
}

/// Local ccache written for the duration of one submission; removed on drop.
#[derive(Debug)]
pub struct CredentialFile {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl CredentialFile {
    pub fn local_path(uid: Uid, stamp: &str) -> PathBuf {
        std::env::temp_dir().join(format!("krb5cc_{uid}_{stamp}"))
    }

    pub fn create(path: impl Into<PathBuf>, bytes: Vec<u8>) -> CoreResult<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|error| {
                credential_error(format!(
                    "failed to write credential file '{}': {error}",
                    path.display()
                ))
            })?;
        Self { path, bytes }.written_to(&mut file)
    }

    /// A failed write drops the guard, which removes the partial file.
    fn written_to(self, sink: &mut impl Write) -> CoreResult<Self> {
        sink.write_all(&self.bytes).map_err(|error| {
            credential_error(format!(
                "failed to write credential file '{}': {error}",
                self.path.display()
            ))
        })?;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), %error, "failed to remove credential file");
        }
    }
}

/// Re-derives AFS tokens from the ccache at `credential`.
pub fn refresh_tokens(
    executor: &dyn ProcessExecutor,
    aklog: &Path,
    credential: &Path,
) -> CoreResult<()> {
    let request = ProcessSpawnRequest::new(
        JobOperation::BuildEnvironment,
        "init aklog failed",
        CommandSpec::new(aklog).env("KRB5CCNAME", credential.to_string_lossy()),
    )
    .timeout(REFRESH_TIMEOUT);

    run_and_collect_stdout(executor, request)
        .map(|_| ())
        .map_err(|error| credential_error(error.message))
}

fn credential_error(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::CredentialError, message)
        .with_operation(JobOperation::BuildEnvironment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn credential_file_is_private_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("krb5cc_1001_20250101-000000");
        {
            let file = CredentialFile::create(&path, b"ticket".to_vec()).unwrap();
            let mode = fs::metadata(file.path()).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
            assert_eq!(file.bytes(), b"ticket");
        }
        assert!(!path.exists());
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_write_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("krb5cc_1001_20250101-000000");
        fs::write(&path, b"").unwrap();

        let guard = CredentialFile {
            path: path.clone(),
            bytes: b"ticket".to_vec(),
        };
        let error = guard.written_to(&mut FullDisk).unwrap_err();

        assert_eq!(error.kind, CoreErrorKind::CredentialError);
        assert!(error.message.contains("no space left"), "{}", error.message);
        assert!(!path.exists());
    }

    #[test]
    fn tokens_are_base64_decoded() {
        assert_eq!(decode_token("dGlja2V0\n").unwrap(), b"ticket");
        assert_eq!(
            decode_token("").unwrap_err().kind,
            CoreErrorKind::CredentialError
        );
        assert!(decode_token("!!").is_err());
    }
}
