pub mod cluster;
pub mod error;
pub mod job;

pub use cluster::{ClusterId, JobOperation, SiteId, Uid, UnknownIdentifier};
pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use job::{
    BackendOptions, CondorOptions, JobFilter, JobKey, JobOutput, JobRecord, JobSpec, JobStatus,
    JobView, NewJobRecord, SlurmOptions, StatusUpdate, SubmitOutcome,
};
