use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::Deserialize;

use crate::adapters::{
    AdapterContext, SchedulerAdapter, lifecycle, listing_lines, validate_job_id,
};
use crate::clock::SiteClock;
use crate::connect::ConnectInfo;
use crate::environment::{EnvironmentRequest, LaunchScript, experiment_group};
use crate::execution::{CommandSpec, ProcessSpawnRequest};
use crate::models::{
    BackendOptions, ClusterId, CondorOptions, CoreError, CoreErrorKind, CoreResult, JobFilter,
    JobOperation, JobOutput, JobSpec, JobStatus, JobView, NewJobRecord, SubmitOutcome, Uid,
};
use crate::submit::SubmitInvocation;
use crate::users::UserAccount;

const CONDOR_SUBMIT_COMMAND: &str = "condor_submit";
const CONDOR_Q_COMMAND: &str = "condor_q";

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

const SUBMIT_FILE_MODE: u32 = 0o600;

/// Attributes requested from `condor_q -af`, in field order.
pub const QUEUE_ATTRIBUTES: [&str; 14] = [
    "Owner",
    "ClusterId",
    "ProcId",
    "HepJob_RealGroup",
    "Qdate",
    "JobStatus",
    "JobStartDate",
    "RemoteHost",
    "HepJob_JobType",
    "HepJob_RequestOS",
    "Iwd",
    "Out",
    "Err",
    "HoldReason",
];

/// Job types listed when the caller asks for all of them.
pub const LISTED_JOB_TYPES: [&str; 8] = [
    "enode",
    "ink_special",
    "jupyter",
    "vscode",
    "rootbrowse",
    "vnc",
    "npu",
    "compile",
];

const TIME_LIMIT: &str = "24:00:00";

/// Per-job-type overrides from `[jobtype.<name>.htc]`. Values set here win over
/// the request. Unrecognized keys are copied into the submit file verbatim.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CondorJobTypeSettings {
    pub request_cpus: Option<u32>,
    pub request_memory: Option<u64>,
    pub schedd_host: Option<String>,
    pub cm_host: Option<String>,
    pub workernode: Option<String>,
    pub arch: Option<String>,
    pub walltime: Option<String>,
    /// Adds the site accounting attributes.
    pub extra_param: bool,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, toml::Value>,
}

/// Schedd and pool a request is sent to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CondorTarget {
    pub schedd: String,
    pub pool: String,
}

pub trait CondorSource: Send + Sync {
    fn submit(&self, invocation: &SubmitInvocation<'_>) -> CoreResult<String>;
    fn list_jobs(&self, username: &str, schedd: &str, constraint: &str) -> CoreResult<String>;
    fn cancel(&self, username: &str, target: &CondorTarget, job_id: &str) -> CoreResult<String>;
}

pub struct CondorAdapter<S: CondorSource> {
    source: S,
    context: AdapterContext,
}

impl<S: CondorSource> CondorAdapter<S> {
    pub fn new(source: S, context: AdapterContext) -> Self {
        Self { source, context }
    }

    fn uid(&self) -> Uid {
        self.context.account.uid
    }

    fn default_target(&self) -> CondorTarget {
        CondorTarget {
            schedd: self.context.settings.schedd_host.clone(),
            pool: self.context.settings.cm_host.clone(),
        }
    }

    fn submit_inner(&self, spec: &JobSpec) -> CoreResult<SubmitOutcome> {
        spec.validate()?;
        let BackendOptions::HtCondor(options) = &spec.backend else {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("job spec targets {}, not htcondor", spec.backend.cluster()),
            ));
        };

        let account = &self.context.account;
        let settings = &self.context.settings;
        let overrides = settings
            .condor_job_types
            .get(&spec.job_type)
            .cloned()
            .unwrap_or_default();
        let target = resolve_target(&self.default_target(), options, &overrides);

        let environment = self.context.environment.build(&EnvironmentRequest {
            account,
            job_type: &spec.job_type,
            scripts: LaunchScript::standard_pair(&settings.cluster_scripts, &spec.job_type),
            now: SystemTime::now(),
        })?;
        let job_dir = environment.job_dir.to_string_lossy().into_owned();

        let submit_file = render_condor_submit_file(spec, options, &overrides, account, &job_dir);
        let file_name = format!("{}_{}.sub", account.username, spec.job_type);
        self.context.storage.upload(
            account,
            submit_file.as_bytes(),
            &environment.job_dir.join(&file_name),
            SUBMIT_FILE_MODE,
        )?;

        let command = vec![
            CONDOR_SUBMIT_COMMAND.to_string(),
            "-name".to_string(),
            target.schedd.clone(),
            "-pool".to_string(),
            target.pool.clone(),
            file_name,
        ];
        let stdout = self.source.submit(&SubmitInvocation {
            account,
            job_type: &spec.job_type,
            job_dir: &environment.job_dir,
            credential: environment.remote_credential.as_deref(),
            command: &command,
        })?;
        let job_id = parse_condor_submit_output(&stdout)?;

        let record = NewJobRecord {
            uid: account.uid,
            job_id: job_id.clone(),
            outpath: format!("{job_dir}/{job_id}.out"),
            errpath: format!("{job_dir}/{job_id}.err"),
            job_type: spec.job_type.clone(),
            job_path: job_dir.clone(),
            cluster: ClusterId::HtCondor,
            status: JobStatus::Submitted,
        };
        if !self
            .context
            .store
            .insert_job(&record)
            .map_err(|error| error.with_job_id(job_id.clone()))?
        {
            tracing::warn!(job_id = %job_id, "htcondor reused a cluster id that is already recorded");
        }

        tracing::info!(
            cluster = "htcondor",
            uid = account.uid,
            job_id = %job_id,
            job_type = %spec.job_type,
            schedd = %target.schedd,
            job_dir = %job_dir,
            "submitted job"
        );
        Ok(SubmitOutcome { job_id, job_dir })
    }

    fn query_inner(&self, filter: &JobFilter) -> CoreResult<Vec<JobView>> {
        let account = &self.context.account;
        let constraint = job_type_constraint(filter.job_type.as_deref());
        let raw = self.source.list_jobs(
            &account.username,
            &self.context.settings.schedd_host,
            &constraint,
        )?;

        let mut views = Vec::new();
        for line in listing_lines(&raw) {
            let mut view = match parse_condor_q_line(line, &self.context.settings.clock) {
                Ok(view) => view,
                Err(error) => {
                    tracing::warn!(line, message = %error.message, "skipping condor_q line");
                    continue;
                }
            };
            let seed = seed_record(account, &view);
            lifecycle::observe(&self.context, ClusterId::HtCondor, &mut view, move || seed)
                .map_err(|error| error.with_job_id(view.job_id.clone()))?;
            if filter.matches(&view) {
                views.push(view);
            }
        }
        Ok(views)
    }

    fn cancel_inner(&self, job_id: &str) -> CoreResult<()> {
        validate_job_id(job_id)?;
        self.source
            .cancel(&self.context.account.username, &self.default_target(), job_id)?;
        lifecycle::record_cancellation(&self.context, ClusterId::HtCondor, job_id)
    }
}

impl<S: CondorSource> SchedulerAdapter for CondorAdapter<S> {
    fn cluster(&self) -> ClusterId {
        ClusterId::HtCondor
    }

    fn account(&self) -> &UserAccount {
        &self.context.account
    }

    fn submit_job(&self, spec: &JobSpec) -> CoreResult<SubmitOutcome> {
        self.submit_inner(spec).map_err(|error| {
            error.attribute(ClusterId::HtCondor, JobOperation::Submit, self.uid(), None)
        })
    }

    fn query_job(&self, filter: &JobFilter) -> CoreResult<Vec<JobView>> {
        self.query_inner(filter).map_err(|error| {
            error.attribute(ClusterId::HtCondor, JobOperation::Query, self.uid(), None)
        })
    }

    fn cancel_job(&self, job_id: &str) -> CoreResult<()> {
        self.cancel_inner(job_id).map_err(|error| {
            error.attribute(ClusterId::HtCondor, JobOperation::Cancel, self.uid(), Some(job_id))
        })
    }

    fn job_output(&self, job_id: &str) -> CoreResult<JobOutput> {
        lifecycle::read_output(&self.context, ClusterId::HtCondor, job_id).map_err(|error| {
            error.attribute(
                ClusterId::HtCondor,
                JobOperation::ReadOutput,
                self.uid(),
                Some(job_id),
            )
        })
    }

    fn connect_info(&self, job_id: &str) -> CoreResult<ConnectInfo> {
        lifecycle::connect_info(&self.context, ClusterId::HtCondor, job_id).map_err(|error| {
            error.attribute(ClusterId::HtCondor, JobOperation::Connect, self.uid(), Some(job_id))
        })
    }
}

fn seed_record(account: &UserAccount, view: &JobView) -> NewJobRecord {
    let job_path = view.work_dir.clone().unwrap_or_default();
    NewJobRecord {
        uid: account.uid,
        job_id: view.job_id.clone(),
        outpath: view
            .outpath
            .clone()
            .unwrap_or_else(|| format!("{job_path}/{}.out", view.job_id)),
        errpath: view
            .errpath
            .clone()
            .unwrap_or_else(|| format!("{job_path}/{}.err", view.job_id)),
        job_type: view.job_type.clone(),
        job_path,
        cluster: ClusterId::HtCondor,
        status: view.status,
    }
}

fn resolve_target(
    default: &CondorTarget,
    options: &CondorOptions,
    overrides: &CondorJobTypeSettings,
) -> CondorTarget {
    let pick = |configured: &Option<String>, requested: &Option<String>, fallback: &str| {
        configured
            .as_deref()
            .or(requested.as_deref())
            .filter(|value| !value.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };
    CondorTarget {
        schedd: pick(&overrides.schedd_host, &options.schedd_host, &default.schedd),
        pool: pick(&overrides.cm_host, &options.cm_host, &default.pool),
    }
}

pub fn condor_submit_request(command: CommandSpec) -> ProcessSpawnRequest {
    condor_request(JobOperation::Submit, "submit job failed", command, SUBMIT_TIMEOUT)
}

pub fn condor_q_request(username: &str, schedd: &str, constraint: &str) -> ProcessSpawnRequest {
    condor_request(
        JobOperation::Query,
        "query user jobs failed",
        CommandSpec::new(CONDOR_Q_COMMAND)
            .args([username, "-name", schedd, "-const", constraint, "-af"])
            .args(QUEUE_ATTRIBUTES),
        LIST_TIMEOUT,
    )
}

pub fn condor_rm_request(username: &str, target: &CondorTarget, job_id: &str) -> ProcessSpawnRequest {
    condor_request(
        JobOperation::Cancel,
        "condor_rm job failed",
        CommandSpec::new("sudo").args([
            "-u",
            username,
            "condor_rm",
            "-name",
            target.schedd.as_str(),
            "-pool",
            target.pool.as_str(),
            job_id,
        ]),
        CANCEL_TIMEOUT,
    )
}

fn condor_request(
    operation: JobOperation,
    context: &str,
    command: CommandSpec,
    timeout: Duration,
) -> ProcessSpawnRequest {
    ProcessSpawnRequest::new(operation, context, command)
        .cluster(ClusterId::HtCondor)
        .timeout(timeout)
}

/// ClassAd constraint selecting one job type, or every listed type for `None`.
pub fn job_type_constraint(job_type: Option<&str>) -> String {
    match job_type {
        Some(job_type) => format!("HepJob_JobType == \"{}\"", escape_classad(job_type)),
        None => LISTED_JOB_TYPES
            .iter()
            .map(|job_type| format!("HepJob_JobType == \"{job_type}\""))
            .collect::<Vec<_>>()
            .join(" || "),
    }
}

fn escape_classad(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Builds the `requirements` expression from a worker-node pin and an architecture.
pub fn build_requirements(worker_node: Option<&str>, arch: Option<&str>) -> String {
    let mut conditions = Vec::new();
    if let Some(node) = worker_node.filter(|node| !node.is_empty()) {
        conditions.push(format!("(TARGET.Machine == \"{}\")", node.replace('"', "\\\"")));
    }
    if let Some(arch) = arch.filter(|arch| !arch.is_empty()) {
        let normalized = match arch.to_lowercase().as_str() {
            "aarch64" | "arm64" | "arm" => "AARCH64".to_string(),
            "x86_64" | "amd64" | "x64" | "x86" => "X86_64".to_string(),
            other => other.to_uppercase(),
        };
        conditions.push(format!("(TARGET.Arch == \"{normalized}\")"));
    }
    if conditions.is_empty() {
        "True".to_string()
    } else {
        conditions.join(" && ")
    }
}

fn accounting_attributes(
    account: &UserAccount,
    job_type: &str,
    walltime: Option<&str>,
    request_os: Option<&str>,
) -> Vec<(String, String)> {
    let group = account.group.as_str();
    let experiment = experiment_group(group).unwrap_or("OTHERS");
    let mut attributes = vec![
        (
            "accounting_group".to_string(),
            format!("{experiment}.{group}.{}", walltime.unwrap_or("default")),
        ),
        ("+HepJob_Experiment".to_string(), format!("\"{experiment}\"")),
        ("+HepJob_JobType".to_string(), format!("\"{job_type}\"")),
        ("+HepJob_Walltime".to_string(), "\"default\"".to_string()),
        ("+IHEP_RealGroup".to_string(), format!("\"{group}\"")),
    ];
    if let Some(os) = request_os.filter(|os| !os.is_empty()) {
        attributes.push(("+HepJob_RequestOS".to_string(), format!("\"{os}\"")));
    }
    attributes
}

fn attribute_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn render_condor_submit_file(
    spec: &JobSpec,
    options: &CondorOptions,
    overrides: &CondorJobTypeSettings,
    account: &UserAccount,
    job_dir: &str,
) -> String {
    let mut arguments = spec.arguments.clone().unwrap_or_default();
    if spec.job_type == "npu" {
        if !arguments.is_empty() {
            arguments.push(' ');
        }
        arguments.push_str(job_dir);
    }

    let mut lines: Vec<(String, String)> = vec![
        ("universe".to_string(), "vanilla".to_string()),
        ("executable".to_string(), "shell.sh".to_string()),
    ];
    if !arguments.is_empty() {
        lines.push(("arguments".to_string(), arguments));
    }
    lines.extend([
        ("output".to_string(), format!("{job_dir}/$(ClusterId).out")),
        ("error".to_string(), format!("{job_dir}/$(ClusterId).err")),
        (
            "request_cpus".to_string(),
            overrides.request_cpus.unwrap_or(spec.cpu).to_string(),
        ),
        (
            "request_memory".to_string(),
            overrides.request_memory.unwrap_or(spec.mem_mb).to_string(),
        ),
        ("getenv".to_string(), "True".to_string()),
    ]);
    if let Some(name) = spec.job_name.as_deref().filter(|name| !name.is_empty()) {
        lines.push(("batch_name".to_string(), name.to_string()));
    }

    for (key, value) in &overrides.attributes {
        lines.push((key.clone(), attribute_value(value)));
    }
    if overrides.extra_param {
        lines.extend(accounting_attributes(
            account,
            &spec.job_type,
            overrides.walltime.as_deref(),
            options.os.as_deref(),
        ));
    }

    let worker_node = overrides
        .workernode
        .as_deref()
        .or(options.worker_node.as_deref());
    let arch = overrides.arch.as_deref().or(options.arch.as_deref());
    lines.push(("requirements".to_string(), build_requirements(worker_node, arch)));

    let mut rendered: String = lines
        .iter()
        .map(|(key, value)| format!("{key} = {value}\n"))
        .collect();
    rendered.push_str("queue\n");
    rendered
}

/// `condor_submit` ends with `... submitted to cluster <id>.`
pub fn parse_condor_submit_output(stdout: &str) -> CoreResult<String> {
    let job_id = stdout
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .trim_end_matches('.');
    if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::new(
            CoreErrorKind::ParseFailure,
            format!("condor_submit did not print a cluster id: '{}'", stdout.trim()),
        ));
    }
    Ok(job_id.to_string())
}

pub fn map_condor_status(raw: &str) -> JobStatus {
    match raw {
        "1" => JobStatus::Queueing,
        "2" => JobStatus::Running,
        "4" => JobStatus::Completed,
        "5" => JobStatus::Holding,
        _ => JobStatus::Other,
    }
}

/// Parses one `condor_q -af` line in `QUEUE_ATTRIBUTES` order. The hold reason
/// spans every field after `Err`.
pub fn parse_condor_q_line(line: &str, clock: &SiteClock) -> CoreResult<JobView> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 13 {
        return Err(CoreError::new(
            CoreErrorKind::ParseFailure,
            format!("expected at least 13 condor_q fields, got {}", fields.len()),
        ));
    }
    if !fields[1].chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::new(
            CoreErrorKind::ParseFailure,
            format!("'{}' is not a cluster id", fields[1]),
        ));
    }

    let defined = |value: &str| (value != "undefined").then(|| value.to_string());

    let mut view = JobView::new(ClusterId::HtCondor, fields[1], fields[5]);
    view.status = map_condor_status(fields[5]);
    view.proc_id = Some(fields[2].to_string());
    view.owner = fields[0].to_string();
    view.queue_time = clock.from_epoch(fields[4]);
    view.job_type = defined(fields[8]).unwrap_or_default();
    view.request_os = defined(fields[9]);
    view.work_dir = defined(fields[10]);
    view.outpath = defined(fields[11]);
    view.errpath = defined(fields[12]);
    view.time_limit = Some(TIME_LIMIT.to_string());

    match view.status {
        JobStatus::Running | JobStatus::Completed => {
            view.start_time = clock.from_epoch(fields[6]);
            view.worker_host = defined(fields[7]);
        }
        JobStatus::Holding => {
            view.start_time = clock.from_epoch(fields[6]);
            view.hold_reason = Some(fields[13..].join(" "));
        }
        _ => {}
    }
    Ok(view)
}
