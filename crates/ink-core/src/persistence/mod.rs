use std::time::SystemTime;

use crate::models::{
    ClusterId, CoreError, JobKey, JobRecord, JobStatus, NewJobRecord, StatusUpdate, Uid,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Output and error file templates recorded at submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobPaths {
    pub outpath: String,
    pub errpath: String,
    pub job_path: String,
}

/// The `job_info` table. Every mutation is a single-field update keyed on
/// (uid, job id, cluster); "not found" is reported as `None` or `RecordNotFound`.
pub trait JobStore: Send + Sync {
    /// Returns `false` when a record with the same (job id, cluster) already exists.
    fn insert_job(&self, job: &NewJobRecord) -> PersistenceResult<bool>;

    fn find_job(&self, key: &JobKey) -> PersistenceResult<Option<JobRecord>>;

    fn get_job(&self, key: &JobKey) -> PersistenceResult<JobRecord>;

    fn list_user_jobs(&self, uid: Uid, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>>;

    /// Writes `status` only if the stored value admits the transition.
    fn update_status(&self, key: &JobKey, status: JobStatus) -> PersistenceResult<StatusUpdate>;

    fn set_connect_sign(&self, key: &JobKey, connected: bool) -> PersistenceResult<()>;

    fn set_start_time(&self, key: &JobKey, start: SystemTime) -> PersistenceResult<()>;

    fn set_end_time(&self, key: &JobKey, end: SystemTime) -> PersistenceResult<()>;

    /// Returns whether the start time was written.
    fn set_start_time_if_missing(&self, key: &JobKey, start: SystemTime) -> PersistenceResult<bool>;

    /// Returns whether the end time was written.
    fn set_end_time_if_missing(&self, key: &JobKey, end: SystemTime) -> PersistenceResult<bool>;

    /// Records the forwarding port only while no rule has been recorded or cleaned.
    /// Returns `false` when another caller won.
    fn record_gateway_port(&self, key: &JobKey, port: u32) -> PersistenceResult<bool>;

    /// Resets the port to 0 and marks the rule cleaned. Returns `false` when already clean.
    fn mark_gateway_cleaned(&self, key: &JobKey) -> PersistenceResult<bool>;

    fn list_unfinished_jobs(&self, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>>;

    fn list_completed_jobs(&self, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>>;

    fn list_jobs_with_null_times(&self, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>>;

    fn delete_jobs(&self, cluster: ClusterId, job_ids: &[String]) -> PersistenceResult<usize>;

    fn job_paths(&self, key: &JobKey) -> PersistenceResult<Option<JobPaths>>;
}
