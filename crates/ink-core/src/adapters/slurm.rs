use std::time::{Duration, SystemTime};

use crate::adapters::{
    AdapterContext, SchedulerAdapter, lifecycle, listing_lines, validate_job_id,
};
use crate::clock::SiteClock;
use crate::connect::ConnectInfo;
use crate::environment::{EnvironmentRequest, LaunchScript};
use crate::execution::{CommandSpec, ProcessSpawnRequest};
use crate::models::{
    BackendOptions, ClusterId, CoreError, CoreErrorKind, CoreResult, JobFilter, JobOperation,
    JobOutput, JobSpec, JobStatus, JobView, NewJobRecord, SlurmOptions, SubmitOutcome, Uid,
};
use crate::submit::SubmitInvocation;
use crate::users::UserAccount;

const SBATCH_COMMAND: &str = "sbatch";
const SACCT_COMMAND: &str = "sacct";
const SACCT_FORMAT: &str =
    "--format=JobID,Partition,State,Elapsed,NNodes,NodeList,WCkey,Submit,Start,End,WorkDir,Time";
const SACCT_FIELDS: usize = 12;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

pub trait SlurmSource: Send + Sync {
    /// Runs `sbatch` as the job owner and returns its stdout.
    fn submit(&self, invocation: &SubmitInvocation<'_>) -> CoreResult<String>;
    fn list_jobs(&self, username: &str) -> CoreResult<String>;
    fn cancel(&self, username: &str, job_id: &str) -> CoreResult<String>;
}

pub struct SlurmAdapter<S: SlurmSource> {
    source: S,
    context: AdapterContext,
}

impl<S: SlurmSource> SlurmAdapter<S> {
    pub fn new(source: S, context: AdapterContext) -> Self {
        Self { source, context }
    }

    fn uid(&self) -> Uid {
        self.context.account.uid
    }

    fn submit_inner(&self, spec: &JobSpec) -> CoreResult<SubmitOutcome> {
        spec.validate()?;
        let BackendOptions::Slurm(options) = &spec.backend else {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("job spec targets {}, not slurm", spec.backend.cluster()),
            ));
        };

        let account = &self.context.account;
        let environment = self.context.environment.build(&EnvironmentRequest {
            account,
            job_type: &spec.job_type,
            scripts: LaunchScript::standard_pair(
                &self.context.settings.cluster_scripts,
                &spec.job_type,
            ),
            now: SystemTime::now(),
        })?;
        let job_dir = environment.job_dir.to_string_lossy().into_owned();

        let command = sbatch_arguments(spec, options, &job_dir);
        let stdout = self.source.submit(&SubmitInvocation {
            account,
            job_type: &spec.job_type,
            job_dir: &environment.job_dir,
            credential: environment.remote_credential.as_deref(),
            command: &command,
        })?;
        let job_id = parse_slurm_submit_output(&stdout)?;

        let record = NewJobRecord {
            uid: account.uid,
            job_id: job_id.clone(),
            outpath: format!("{job_dir}/{job_id}.out"),
            errpath: format!("{job_dir}/{job_id}.err"),
            job_type: spec.job_type.clone(),
            job_path: job_dir.clone(),
            cluster: ClusterId::Slurm,
            status: JobStatus::Submitted,
        };
        if !self
            .context
            .store
            .insert_job(&record)
            .map_err(|error| error.with_job_id(job_id.clone()))?
        {
            tracing::warn!(job_id = %job_id, "slurm reused a job id that is already recorded");
        }

        tracing::info!(
            cluster = "slurm",
            uid = account.uid,
            job_id = %job_id,
            job_type = %spec.job_type,
            job_dir = %job_dir,
            "submitted job"
        );
        Ok(SubmitOutcome { job_id, job_dir })
    }

    fn query_inner(&self, filter: &JobFilter) -> CoreResult<Vec<JobView>> {
        let account = &self.context.account;
        let raw = self.source.list_jobs(&account.username)?;

        let mut views = Vec::new();
        for line in listing_lines(&raw) {
            let mut view = match parse_sacct_line(line, &self.context.settings.clock) {
                Ok(view) => view,
                Err(error) => {
                    tracing::warn!(line, message = %error.message, "skipping sacct line");
                    continue;
                }
            };
            let seed = seed_record(account, &view);
            lifecycle::observe(&self.context, ClusterId::Slurm, &mut view, move || seed)
                .map_err(|error| error.with_job_id(view.job_id.clone()))?;
            if filter.matches(&view) {
                views.push(view);
            }
        }
        Ok(views)
    }

    fn cancel_inner(&self, job_id: &str) -> CoreResult<()> {
        validate_job_id(job_id)?;
        self.source.cancel(&self.context.account.username, job_id)?;
        lifecycle::record_cancellation(&self.context, ClusterId::Slurm, job_id)
    }
}

impl<S: SlurmSource> SchedulerAdapter for SlurmAdapter<S> {
    fn cluster(&self) -> ClusterId {
        ClusterId::Slurm
    }

    fn account(&self) -> &UserAccount {
        &self.context.account
    }

    fn submit_job(&self, spec: &JobSpec) -> CoreResult<SubmitOutcome> {
        self.submit_inner(spec)
            .map_err(|error| error.attribute(ClusterId::Slurm, JobOperation::Submit, self.uid(), None))
    }

    fn query_job(&self, filter: &JobFilter) -> CoreResult<Vec<JobView>> {
        self.query_inner(filter)
            .map_err(|error| error.attribute(ClusterId::Slurm, JobOperation::Query, self.uid(), None))
    }

    fn cancel_job(&self, job_id: &str) -> CoreResult<()> {
        self.cancel_inner(job_id).map_err(|error| {
            error.attribute(ClusterId::Slurm, JobOperation::Cancel, self.uid(), Some(job_id))
        })
    }

    fn job_output(&self, job_id: &str) -> CoreResult<JobOutput> {
        lifecycle::read_output(&self.context, ClusterId::Slurm, job_id).map_err(|error| {
            error.attribute(ClusterId::Slurm, JobOperation::ReadOutput, self.uid(), Some(job_id))
        })
    }

    fn connect_info(&self, job_id: &str) -> CoreResult<ConnectInfo> {
        lifecycle::connect_info(&self.context, ClusterId::Slurm, job_id).map_err(|error| {
            error.attribute(ClusterId::Slurm, JobOperation::Connect, self.uid(), Some(job_id))
        })
    }
}

fn seed_record(account: &UserAccount, view: &JobView) -> NewJobRecord {
    let work_dir = view.work_dir.clone().unwrap_or_default();
    NewJobRecord {
        uid: account.uid,
        job_id: view.job_id.clone(),
        outpath: format!("{work_dir}/{}.out", view.job_id),
        errpath: format!("{work_dir}/{}.err", view.job_id),
        job_type: view.job_type.clone(),
        job_path: work_dir,
        cluster: ClusterId::Slurm,
        status: view.status,
    }
}

/// Wraps an owner-side submit command in a request with the submit budget.
pub fn slurm_submit_request(command: CommandSpec) -> ProcessSpawnRequest {
    slurm_request(JobOperation::Submit, "submit job failed", command, SUBMIT_TIMEOUT)
}

pub fn sacct_request(username: &str) -> ProcessSpawnRequest {
    slurm_request(
        JobOperation::Query,
        "query user jobs failed",
        CommandSpec::new(SACCT_COMMAND)
            .args(["-u", username, SACCT_FORMAT, "-P", "-X", "-n"]),
        LIST_TIMEOUT,
    )
}

pub fn scancel_request(username: &str, job_id: &str) -> ProcessSpawnRequest {
    slurm_request(
        JobOperation::Cancel,
        "scancel failed",
        CommandSpec::new("sudo").args(["-u", username, "scancel", job_id]),
        CANCEL_TIMEOUT,
    )
}

fn slurm_request(
    operation: JobOperation,
    context: &str,
    command: CommandSpec,
    timeout: Duration,
) -> ProcessSpawnRequest {
    ProcessSpawnRequest::new(operation, context, command)
        .cluster(ClusterId::Slurm)
        .timeout(timeout)
}

pub fn sbatch_arguments(spec: &JobSpec, options: &SlurmOptions, job_dir: &str) -> Vec<String> {
    let mut args = vec![
        SBATCH_COMMAND.to_string(),
        "--parsable".to_string(),
        format!("--output={job_dir}/%j.out"),
        format!("--error={job_dir}/%j.err"),
        format!("--nodes={}", options.nodes.unwrap_or(1)),
        format!("--ntasks={}", options.ntasks.unwrap_or(1)),
        format!("--cpus-per-task={}", spec.cpu),
        format!("--mem={}M", spec.mem_mb),
        format!("--job-name={}", spec.display_name()),
        format!("--wckey={}", spec.job_type),
        format!("--chdir={job_dir}"),
    ];

    let optional = [
        ("--partition", &options.partition),
        ("--account", &options.account),
        ("--qos", &options.qos),
        ("--time", &options.time_limit),
    ];
    for (flag, value) in optional {
        if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
            args.push(format!("{flag}={value}"));
        }
    }

    if spec.gpu_num > 0
        && let Some(gpu_name) = options.gpu_name.as_deref().filter(|name| !name.is_empty())
    {
        let gres = match options.gpu_type.as_deref().filter(|kind| !kind.is_empty()) {
            Some(gpu_type) => format!("{gpu_name}:{gpu_type}:{}", spec.gpu_num),
            None => format!("{gpu_name}:{}", spec.gpu_num),
        };
        args.push(format!("--gres={gres}"));
    }

    args.push(format!("{job_dir}/shell.sh"));
    args
}

/// `sbatch --parsable` prints `<jobid>[;<cluster>]`.
pub fn parse_slurm_submit_output(stdout: &str) -> CoreResult<String> {
    let job_id = stdout.trim().split(';').next().unwrap_or_default().trim();
    if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::new(
            CoreErrorKind::ParseFailure,
            format!("sbatch did not print a job id: '{}'", stdout.trim()),
        ));
    }
    Ok(job_id.to_string())
}

pub fn map_slurm_state(raw: &str) -> JobStatus {
    match raw {
        "PENDING" => JobStatus::Queueing,
        "RUNNING" => JobStatus::Running,
        "COMPLETED" => JobStatus::Completed,
        "HOLD" | "REQUEUE_HOLD" => JobStatus::Holding,
        other if other.starts_with("CANCELLED") => JobStatus::Completed,
        _ => JobStatus::Other,
    }
}

/// Parses one `sacct -P -X -n` line in `SACCT_FORMAT` field order.
pub fn parse_sacct_line(line: &str, clock: &SiteClock) -> CoreResult<JobView> {
    let fields: Vec<&str> = line.split('|').map(str::trim).collect();
    if fields.len() < SACCT_FIELDS {
        return Err(CoreError::new(
            CoreErrorKind::ParseFailure,
            format!("expected {SACCT_FIELDS} sacct fields, got {}", fields.len()),
        ));
    }
    if fields[0].is_empty() {
        return Err(CoreError::new(
            CoreErrorKind::ParseFailure,
            "sacct line has no job id",
        ));
    }

    let present = |value: &str| {
        (!value.is_empty() && value != "None assigned").then(|| value.to_string())
    };

    let mut view = JobView::new(ClusterId::Slurm, fields[0], fields[2]);
    view.status = map_slurm_state(fields[2]);
    view.partition = present(fields[1]);
    view.worker_host = present(fields[5]);
    view.job_type = fields[6].to_string();
    view.queue_time = clock.parse_wall_clock(fields[7]);
    view.start_time = clock.parse_wall_clock(fields[8]);
    view.end_time = clock.parse_wall_clock(fields[9]);
    view.work_dir = present(fields[10]);
    view.time_limit = present(fields[11]);
    view.outpath = view
        .work_dir
        .as_ref()
        .map(|dir| format!("{dir}/{}.out", view.job_id));
    view.errpath = view
        .work_dir
        .as_ref()
        .map(|dir| format!("{dir}/{}.err", view.job_id));
    Ok(view)
}
