//! Periodic re-derivation of HTCondor job state from the scheduler.
//!
//! Each task holds its own file lock for the whole tick. A tick that finds the
//! lock taken does nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;

use crate::adapters::htcondor::QUEUE_ATTRIBUTES;
use crate::clock::SiteClock;
use crate::execution::{CommandSpec, ProcessExecutor, ProcessSpawnRequest, run_and_collect_stdout};
use crate::gateway::ConnectionGateway;
use crate::models::{
    ClusterId, CoreError, CoreErrorKind, CoreResult, JobOperation, JobRecord, JobStatus,
};
use crate::persistence::JobStore;

mod lock;

pub use lock::{LockError, TaskLock};

pub const SWEEP_LOCK: &str = "sweep.lock";
pub const BACKFILL_LOCK: &str = "backfill.lock";

const QUEUE_TIMEOUT: Duration = Duration::from_secs(10);
const JOB_HISTORY_TIMEOUT: Duration = Duration::from_secs(30);
const HISTORY_LIST_TIMEOUT: Duration = Duration::from_secs(10);

const ENTERED_STATUS: &str = r#"formatTime(EnteredCurrentStatus,"%Y-%m-%d %H:%M:%S")"#;
const STARTED: &str = r#"formatTime(JobStartDate,"%Y-%m-%d %H:%M:%S")"#;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconcileSettings {
    pub lock_dir: PathBuf,
    pub sweep_interval: Duration,
    pub backfill_interval: Duration,
    pub history_limit: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from("/var/lib/ink/locks"),
            sweep_interval: Duration::from_secs(300),
            backfill_interval: Duration::from_secs(1800),
            history_limit: 200,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub updated: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickOutcome {
    /// Another run held the lock.
    Skipped,
    Ran(ReconcileReport),
}

pub trait CondorHistorySource: Send + Sync {
    /// Every job in the schedd's live queue, one `condor_q -af` line each.
    fn queue_listing(&self) -> CoreResult<String>;
    /// At most one history line: end time, job type, owner, start time.
    fn job_history(&self, job_id: &str) -> CoreResult<String>;
    /// Recent history lines: end time, start time, owner, cluster id.
    fn history_listing(&self, limit: u32) -> CoreResult<String>;
}

pub struct ProcessCondorHistorySource {
    executor: Arc<dyn ProcessExecutor>,
    schedd: String,
}

impl ProcessCondorHistorySource {
    pub fn new(executor: Arc<dyn ProcessExecutor>, schedd: impl Into<String>) -> Self {
        Self {
            executor,
            schedd: schedd.into(),
        }
    }
}

impl CondorHistorySource for ProcessCondorHistorySource {
    fn queue_listing(&self) -> CoreResult<String> {
        run_and_collect_stdout(self.executor.as_ref(), queue_request(&self.schedd))
    }

    fn job_history(&self, job_id: &str) -> CoreResult<String> {
        run_and_collect_stdout(
            self.executor.as_ref(),
            job_history_request(&self.schedd, job_id),
        )
    }

    fn history_listing(&self, limit: u32) -> CoreResult<String> {
        run_and_collect_stdout(
            self.executor.as_ref(),
            history_list_request(&self.schedd, limit),
        )
    }
}

pub fn queue_request(schedd: &str) -> ProcessSpawnRequest {
    ProcessSpawnRequest::new(
        JobOperation::SweepVanished,
        "query cluster jobs failed",
        CommandSpec::new("condor_q")
            .args(["-name", schedd, "-af"])
            .args(QUEUE_ATTRIBUTES),
    )
    .cluster(ClusterId::HtCondor)
    .timeout(QUEUE_TIMEOUT)
}

pub fn job_history_request(schedd: &str, job_id: &str) -> ProcessSpawnRequest {
    ProcessSpawnRequest::new(
        JobOperation::SweepVanished,
        "condor_history failed",
        CommandSpec::new("condor_history")
            .args(["-name", schedd, "-limit", "1", job_id, "-af"])
            .args([ENTERED_STATUS, "HepJob_JobType", "Owner", STARTED]),
    )
    .cluster(ClusterId::HtCondor)
    .timeout(JOB_HISTORY_TIMEOUT)
}

pub fn history_list_request(schedd: &str, limit: u32) -> ProcessSpawnRequest {
    ProcessSpawnRequest::new(
        JobOperation::BackfillTimes,
        "query history jobs failed",
        CommandSpec::new("condor_history")
            .args(["-name", schedd, "-limit"])
            .arg(limit.to_string())
            .arg("-af")
            .args([ENTERED_STATUS, STARTED, "Owner", "ClusterId"]),
    )
    .cluster(ClusterId::HtCondor)
    .timeout(HISTORY_LIST_TIMEOUT)
}

/// One `condor_history -limit 1` record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FinishedJob {
    pub end_time: Option<SystemTime>,
    pub job_type: String,
    pub owner: String,
    pub start_time: Option<SystemTime>,
}

pub fn parse_job_history(raw: &str, clock: &SiteClock) -> Option<FinishedJob> {
    let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    let wall_clock = |date: &str, time: &str| clock.parse_wall_clock(&format!("{date} {time}"));
    Some(FinishedJob {
        end_time: wall_clock(fields[0], fields[1]),
        job_type: fields[2].to_string(),
        owner: fields[3].to_string(),
        start_time: (fields.len() >= 6)
            .then(|| wall_clock(fields[4], fields[5]))
            .flatten(),
    })
}

/// One history-list line: `(cluster id, start, end)`. Only complete six-field lines count.
pub fn parse_history_line(
    line: &str,
    clock: &SiteClock,
) -> Option<(String, Option<SystemTime>, Option<SystemTime>)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 6 {
        return None;
    }
    let end = clock.parse_wall_clock(&format!("{} {}", fields[0], fields[1]));
    let start = clock.parse_wall_clock(&format!("{} {}", fields[2], fields[3]));
    Some((fields[5].to_string(), start, end))
}

pub struct Reconciler<S: CondorHistorySource> {
    source: S,
    store: Arc<dyn JobStore>,
    gateway: ConnectionGateway,
    clock: SiteClock,
    settings: ReconcileSettings,
}

impl<S: CondorHistorySource> Reconciler<S> {
    pub fn new(
        source: S,
        store: Arc<dyn JobStore>,
        gateway: ConnectionGateway,
        clock: SiteClock,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            source,
            store,
            gateway,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    fn lock(&self, name: &str, task: &str) -> CoreResult<Option<TaskLock>> {
        let lock = TaskLock::try_acquire(&self.settings.lock_dir.join(name))?;
        if lock.is_none() {
            tracing::info!(task, "lock busy, skip this tick");
        }
        Ok(lock)
    }

    /// Finds unfinished jobs that left the live queue and closes them out from history.
    pub fn sweep_vanished_jobs(&self) -> CoreResult<TickOutcome> {
        let Some(_lock) = self.lock(SWEEP_LOCK, "sweep")? else {
            return Ok(TickOutcome::Skipped);
        };

        let unfinished = self.store.list_unfinished_jobs(ClusterId::HtCondor)?;
        let queue = self.source.queue_listing()?;
        let live: BTreeSet<&str> = queue
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .collect();

        let mut report = ReconcileReport::default();
        for record in unfinished
            .iter()
            .filter(|record| !live.contains(record.job_id.as_str()))
        {
            report.examined += 1;
            let history = match self.source.job_history(&record.job_id) {
                Ok(history) => history,
                Err(error) => {
                    tracing::warn!(
                        job_id = %record.job_id,
                        kind = ?error.kind,
                        message = %error.message,
                        "condor_history failed; will retry next tick"
                    );
                    continue;
                }
            };
            let Some(finished) = parse_job_history(&history, &self.clock) else {
                continue;
            };

            if let Err(error) = self.close_out(record, &finished) {
                tracing::warn!(
                    job_id = %record.job_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "could not close out vanished job; will retry next tick"
                );
                continue;
            }
            report.updated += 1;
            tracing::info!(
                uid = record.uid,
                job_id = %record.job_id,
                owner = %finished.owner,
                job_type = %finished.job_type,
                "job left the queue; marked completed"
            );
        }
        Ok(TickOutcome::Ran(report))
    }

    /// Fills in missing start and end times from recent history.
    pub fn backfill_job_times(&self) -> CoreResult<TickOutcome> {
        let Some(_lock) = self.lock(BACKFILL_LOCK, "backfill")? else {
            return Ok(TickOutcome::Skipped);
        };

        let pending: BTreeMap<String, _> = self
            .store
            .list_jobs_with_null_times(ClusterId::HtCondor)?
            .into_iter()
            .map(|record| (record.job_id.clone(), record))
            .collect();
        let history = self.source.history_listing(self.settings.history_limit)?;

        let mut report = ReconcileReport::default();
        for (cluster_id, start, end) in history
            .lines()
            .filter_map(|line| parse_history_line(line, &self.clock))
        {
            report.examined += 1;
            let Some(record) = pending.get(&cluster_id) else {
                continue;
            };
            match self.fill_missing_times(record, start, end) {
                Ok(true) => {
                    report.updated += 1;
                    tracing::info!(uid = record.uid, job_id = %cluster_id, "backfilled job times");
                }
                Ok(false) => {}
                Err(error) => tracing::warn!(
                    job_id = %cluster_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "could not backfill job times"
                ),
            }
        }
        Ok(TickOutcome::Ran(report))
    }

    fn close_out(&self, record: &JobRecord, finished: &FinishedJob) -> CoreResult<()> {
        let key = record.key();
        self.gateway.close_if_open(record)?;
        self.store.update_status(&key, JobStatus::Completed)?;
        if let Some(start) = finished.start_time {
            self.store.set_start_time(&key, start)?;
        }
        if let Some(end) = finished.end_time {
            self.store.set_end_time(&key, end)?;
        }
        Ok(())
    }

    /// Never overwrites a time that is already stored.
    fn fill_missing_times(
        &self,
        record: &JobRecord,
        start: Option<SystemTime>,
        end: Option<SystemTime>,
    ) -> CoreResult<bool> {
        let key = record.key();
        let mut written = false;
        if let Some(start) = start {
            written |= self.store.set_start_time_if_missing(&key, start)?;
        }
        if let Some(end) = end {
            written |= self.store.set_end_time_if_missing(&key, end)?;
        }
        Ok(written)
    }
}

impl<S: CondorHistorySource + 'static> Reconciler<S> {
    /// Runs both tasks on their intervals until `shutdown` resolves. The first
    /// tick of each fires immediately.
    pub async fn run_schedule(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        let mut backfill = tokio::time::interval(self.settings.backfill_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        backfill.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("reconciliation schedule stopped");
                    return;
                }
                _ = sweep.tick() => {
                    let reconciler = self.clone();
                    report_tick("sweep", run_blocking(move || reconciler.sweep_vanished_jobs()).await);
                }
                _ = backfill.tick() => {
                    let reconciler = self.clone();
                    report_tick("backfill", run_blocking(move || reconciler.backfill_job_times()).await);
                }
            }
        }
    }
}

async fn run_blocking<F>(task: F) -> CoreResult<TickOutcome>
where
    F: FnOnce() -> CoreResult<TickOutcome> + Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|join_error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("reconciliation join failure: {join_error}"),
        )
    })?
}

fn report_tick(task: &str, outcome: CoreResult<TickOutcome>) {
    match outcome {
        Ok(TickOutcome::Ran(report)) => tracing::debug!(
            task,
            examined = report.examined,
            updated = report.updated,
            "reconciliation tick finished"
        ),
        Ok(TickOutcome::Skipped) => {}
        Err(error) => tracing::error!(
            task,
            kind = ?error.kind,
            message = %error.message,
            "reconciliation tick failed"
        ),
    }
}
