use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::models::{ClusterId, JobOperation, Uid};

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    CommandFailed,
    CommandTimeout,
    UnknownScheduler,
    UnknownSite,
    RecordNotFound,
    GatewayRuleError,
    /// The job has not published what the request needs yet.
    NotReady,
    CredentialError,
    InvalidInput,
    ParseFailure,
    StorageFailure,
    Configuration,
    Internal,
}

impl CoreErrorKind {
    /// External-process failures the caller may retry on the next poll.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::CommandFailed | Self::CommandTimeout)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoreError {
    pub cluster: Option<ClusterId>,
    pub operation: Option<JobOperation>,
    pub uid: Option<Uid>,
    pub job_id: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            cluster: None,
            operation: None,
            uid: None,
            job_id: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterId) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_operation(mut self, operation: JobOperation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Fills in context that a lower layer did not know, keeping whatever it already set.
    pub fn attribute(
        self,
        cluster: ClusterId,
        operation: JobOperation,
        uid: Uid,
        job_id: Option<&str>,
    ) -> Self {
        Self {
            cluster: self.cluster.or(Some(cluster)),
            operation: self.operation.or(Some(operation)),
            uid: self.uid.or(Some(uid)),
            job_id: self.job_id.or_else(|| job_id.map(str::to_string)),
            kind: self.kind,
            message: self.message,
        }
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;

        let mut context = Vec::new();
        if let Some(operation) = self.operation {
            context.push(format!("operation={}", operation.as_str()));
        }
        if let Some(cluster) = self.cluster {
            context.push(format!("cluster={}", cluster.as_str()));
        }
        if let Some(uid) = self.uid {
            context.push(format!("uid={uid}"));
        }
        if let Some(job_id) = &self.job_id {
            context.push(format!("job={job_id}"));
        }

        if !context.is_empty() {
            write!(f, " ({})", context.join(" "))?;
        }
        Ok(())
    }
}

impl Error for CoreError {}
