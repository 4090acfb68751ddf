use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{ClusterId, CoreError, CoreErrorKind, Uid};

/// Canonical lifecycle status shared by every scheduler backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Queueing,
    Running,
    Holding,
    Completed,
    Canceled,
    Other,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Submitted,
        JobStatus::Queueing,
        JobStatus::Running,
        JobStatus::Holding,
        JobStatus::Completed,
        JobStatus::Canceled,
        JobStatus::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Queueing => "QUEUEING",
            Self::Running => "RUNNING",
            Self::Holding => "HOLDING",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
            Self::Other => "OTHER",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Queueing | Self::Holding | Self::Other => 1,
            Self::Running => 2,
            Self::Completed | Self::Canceled => 3,
        }
    }

    /// Whether a stored `self` may be overwritten with `next`.
    ///
    /// Terminal states are sinks. HOLDING and OTHER are stable intermediates
    /// that may move back to QUEUEING or RUNNING; everything else only moves forward.
    pub fn admits(self, next: JobStatus) -> bool {
        if self == next || self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        if matches!(self, Self::Holding | Self::Other) || matches!(next, Self::Holding | Self::Other)
        {
            return next != Self::Submitted;
        }
        next.rank() > self.rank()
    }

    /// Every status that may legally be replaced by `next`.
    pub fn predecessors_of(next: JobStatus) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|current| current.admits(next))
            .collect()
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SUBMITTED" => Ok(Self::Submitted),
            "QUEUEING" => Ok(Self::Queueing),
            "RUNNING" => Ok(Self::Running),
            "HOLDING" => Ok(Self::Holding),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELED" => Ok(Self::Canceled),
            "OTHER" => Ok(Self::Other),
            other => Err(CoreError::new(
                CoreErrorKind::ParseFailure,
                format!("unknown job status '{other}'"),
            )),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct JobKey {
    pub uid: Uid,
    pub job_id: String,
    pub cluster: ClusterId,
}

impl JobKey {
    pub fn new(uid: Uid, job_id: impl Into<String>, cluster: ClusterId) -> Self {
        Self {
            uid,
            job_id: job_id.into(),
            cluster,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobRecord {
    pub id: i64,
    pub uid: Uid,
    pub job_id: String,
    pub outpath: String,
    pub errpath: String,
    pub job_type: String,
    pub job_path: String,
    pub cluster: ClusterId,
    pub status: JobStatus,
    pub iptable_clean: bool,
    /// Forwarding port on the gateway host, 0 while no rule is installed.
    pub iptable_status: u32,
    pub connect_sign: bool,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
}

impl JobRecord {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.uid, self.job_id.clone(), self.cluster)
    }

    pub fn has_open_rule(&self) -> bool {
        self.iptable_status != 0 && !self.iptable_clean
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewJobRecord {
    pub uid: Uid,
    pub job_id: String,
    pub outpath: String,
    pub errpath: String,
    pub job_type: String,
    pub job_path: String,
    pub cluster: ClusterId,
    pub status: JobStatus,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusUpdate {
    Applied,
    Unchanged,
    /// The stored status is terminal or further along; the write was refused.
    Rejected { stored: JobStatus },
}

/// One job as reported by a scheduler listing, normalized across backends.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct JobView {
    pub cluster: ClusterId,
    pub job_id: String,
    pub proc_id: Option<String>,
    pub owner: String,
    pub job_type: String,
    pub raw_status: String,
    pub status: JobStatus,
    pub partition: Option<String>,
    pub queue_time: Option<SystemTime>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub worker_host: Option<String>,
    pub time_limit: Option<String>,
    pub work_dir: Option<String>,
    pub outpath: Option<String>,
    pub errpath: Option<String>,
    pub request_os: Option<String>,
    pub hold_reason: Option<String>,
    pub connect_sign: bool,
}

impl JobView {
    pub fn new(cluster: ClusterId, job_id: impl Into<String>, raw_status: impl Into<String>) -> Self {
        Self {
            cluster,
            job_id: job_id.into(),
            proc_id: None,
            owner: String::new(),
            job_type: String::new(),
            raw_status: raw_status.into(),
            status: JobStatus::Other,
            partition: None,
            queue_time: None,
            start_time: None,
            end_time: None,
            worker_host: None,
            time_limit: None,
            work_dir: None,
            outpath: None,
            errpath: None,
            request_os: None,
            hold_reason: None,
            connect_sign: false,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobFilter {
    /// `None` lists every job type.
    pub job_type: Option<String>,
    pub submitted_after: Option<SystemTime>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn job_type(job_type: impl Into<String>) -> Self {
        let job_type = job_type.into();
        Self {
            job_type: (job_type != "all").then_some(job_type),
            submitted_after: None,
        }
    }

    pub fn submitted_after(mut self, instant: SystemTime) -> Self {
        self.submitted_after = Some(instant);
        self
    }

    pub fn matches(&self, view: &JobView) -> bool {
        if let Some(job_type) = &self.job_type
            && &view.job_type != job_type
        {
            return false;
        }
        match (self.submitted_after, view.queue_time) {
            (Some(after), Some(queued)) => queued >= after,
            _ => true,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SlurmOptions {
    pub partition: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    pub nodes: Option<u32>,
    pub ntasks: Option<u32>,
    pub gpu_name: Option<String>,
    pub gpu_type: Option<String>,
    pub time_limit: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CondorOptions {
    pub os: Option<String>,
    pub worker_node: Option<String>,
    pub arch: Option<String>,
    pub schedd_host: Option<String>,
    pub cm_host: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cluster_id", rename_all = "lowercase")]
pub enum BackendOptions {
    Slurm(SlurmOptions),
    HtCondor(CondorOptions),
}

impl BackendOptions {
    pub fn cluster(&self) -> ClusterId {
        match self {
            Self::Slurm(_) => ClusterId::Slurm,
            Self::HtCondor(_) => ClusterId::HtCondor,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    pub mem_mb: u64,
    #[serde(default)]
    pub gpu_num: u32,
    #[serde(default)]
    pub arguments: Option<String>,
    pub backend: BackendOptions,
}

fn default_cpu() -> u32 {
    1
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.job_type.trim().is_empty() || self.job_type.contains(['/', '\0']) {
            return Err(invalid(format!(
                "job type '{}' must be a non-empty name without '/'",
                self.job_type
            )));
        }
        if self.cpu < 1 {
            return Err(invalid("CPU must be >= 1".to_string()));
        }
        if self.mem_mb < 1 {
            return Err(invalid("MEM must be >= 1 (MB)".to_string()));
        }
        if let Some(name) = &self.job_name
            && name.chars().any(char::is_control)
        {
            return Err(invalid(format!("job name {name:?} contains control characters")));
        }
        Ok(())
    }

    /// The scheduler-visible name: `job_name` when given, else the job type.
    pub fn display_name(&self) -> &str {
        self.job_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.job_type)
    }
}

fn invalid(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub job_id: String,
    pub job_dir: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct JobOutput {
    pub stdout: String,
    pub stderr: String,
}
