#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use ink_core::adapters::AdapterSettings;
use ink_core::clock::SiteClock;
use ink_core::connect::{ConnectSettings, OtpSettings, SshOtpIssuer};
use ink_core::credentials::CredentialProvider;
use ink_core::environment::{
    CredentialSupport, EnvironmentBuilder, HaiEnvironment, HepsEnvironment, IhepEnvironment,
    Staging,
};
use ink_core::execution::{
    CommandSpec, ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessWaitFuture, RunningProcess,
};
use ink_core::gateway::{ConnectionGateway, GatewaySettings, SshGatewayRunner};
use ink_core::models::{
    ClusterId, CoreError, CoreErrorKind, JobKey, JobRecord, JobStatus, NewJobRecord, SiteId,
    StatusUpdate, Uid,
};
use ink_core::persistence::{JobPaths, JobStore, PersistenceResult};
use ink_core::registry::{RegistryBuilder, RegistryServices};
use ink_core::service::JobService;
use ink_core::sqlite::SqliteStore;
use ink_core::storage::{LocalStorage, StorageBackend};
use ink_core::submit::CondorLoginSubmitter;
use ink_core::users::{StaticUserDirectory, UserAccount};
use tempfile::TempDir;

pub const UID: u32 = 1001;
pub const USERNAME: &str = "alice";
pub const GATEWAY_PORT: u32 = 30001;
pub const AKLOG: &str = "/opt/openafs/bin/aklog";
pub const WEB_URL: &str = "https://ink.example.org";

/// A fresh, migrated database under the system temp dir.
pub fn temp_store(name: &str) -> Arc<SqliteStore> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let path = std::env::temp_dir().join(format!("ink-{name}-{nanos}.sqlite3"));
    let store = SqliteStore::new(path);
    store.migrate_to_latest().unwrap();
    Arc::new(store)
}

/// Delegates to a real store but fails the named methods for the named jobs.
pub struct FaultyStore {
    inner: Arc<SqliteStore>,
    faults: Vec<(&'static str, String)>,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            faults: Vec::new(),
        }
    }

    pub fn failing(mut self, method: &'static str, job_id: &str) -> Self {
        self.faults.push((method, job_id.to_string()));
        self
    }

    fn check(&self, method: &str, key: &JobKey) -> PersistenceResult<()> {
        if self
            .faults
            .iter()
            .any(|(name, job_id)| *name == method && *job_id == key.job_id)
        {
            return Err(CoreError::new(
                CoreErrorKind::StorageFailure,
                format!("{method} failed: database is locked"),
            ));
        }
        Ok(())
    }
}

impl JobStore for FaultyStore {
    fn insert_job(&self, job: &NewJobRecord) -> PersistenceResult<bool> {
        self.inner.insert_job(job)
    }

    fn find_job(&self, key: &JobKey) -> PersistenceResult<Option<JobRecord>> {
        self.inner.find_job(key)
    }

    fn get_job(&self, key: &JobKey) -> PersistenceResult<JobRecord> {
        self.inner.get_job(key)
    }

    fn list_user_jobs(&self, uid: Uid, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>> {
        self.inner.list_user_jobs(uid, cluster)
    }

    fn update_status(&self, key: &JobKey, status: JobStatus) -> PersistenceResult<StatusUpdate> {
        self.check("update_status", key)?;
        self.inner.update_status(key, status)
    }

    fn set_connect_sign(&self, key: &JobKey, connected: bool) -> PersistenceResult<()> {
        self.inner.set_connect_sign(key, connected)
    }

    fn set_start_time(&self, key: &JobKey, start: SystemTime) -> PersistenceResult<()> {
        self.check("set_start_time", key)?;
        self.inner.set_start_time(key, start)
    }

    fn set_end_time(&self, key: &JobKey, end: SystemTime) -> PersistenceResult<()> {
        self.check("set_end_time", key)?;
        self.inner.set_end_time(key, end)
    }

    fn set_start_time_if_missing(&self, key: &JobKey, start: SystemTime) -> PersistenceResult<bool> {
        self.check("set_start_time_if_missing", key)?;
        self.inner.set_start_time_if_missing(key, start)
    }

    fn set_end_time_if_missing(&self, key: &JobKey, end: SystemTime) -> PersistenceResult<bool> {
        self.check("set_end_time_if_missing", key)?;
        self.inner.set_end_time_if_missing(key, end)
    }

    fn record_gateway_port(&self, key: &JobKey, port: u32) -> PersistenceResult<bool> {
        self.check("record_gateway_port", key)?;
        self.inner.record_gateway_port(key, port)
    }

    fn mark_gateway_cleaned(&self, key: &JobKey) -> PersistenceResult<bool> {
        self.inner.mark_gateway_cleaned(key)
    }

    fn list_unfinished_jobs(&self, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>> {
        self.inner.list_unfinished_jobs(cluster)
    }

    fn list_completed_jobs(&self, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>> {
        self.inner.list_completed_jobs(cluster)
    }

    fn list_jobs_with_null_times(&self, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>> {
        self.inner.list_jobs_with_null_times(cluster)
    }

    fn delete_jobs(&self, cluster: ClusterId, job_ids: &[String]) -> PersistenceResult<usize> {
        self.inner.delete_jobs(cluster, job_ids)
    }

    fn job_paths(&self, key: &JobKey) -> PersistenceResult<Option<JobPaths>> {
        self.inner.job_paths(key)
    }
}

struct Route {
    needle: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Answers each command with the first route whose needle occurs in the
/// rendered command line, and records every command it was asked to run.
#[derive(Default)]
pub struct RoutingExecutor {
    routes: Mutex<Vec<Route>>,
    commands: Mutex<Vec<CommandSpec>>,
}

impl RoutingExecutor {
    pub fn respond(&self, needle: &str, stdout: &str) {
        self.route(needle, 0, stdout, "");
    }

    pub fn fail(&self, needle: &str, stderr: &str) {
        self.route(needle, 1, "", stderr);
    }

    fn route(&self, needle: &str, exit_code: i32, stdout: &str, stderr: &str) {
        let route = Route {
            needle: needle.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|existing| existing.needle == needle) {
            Some(existing) => *existing = route,
            None => routes.push(route),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(CommandSpec::display)
            .collect()
    }

    /// Environment of the first recorded command whose line contains `needle`.
    pub fn env_of(&self, needle: &str) -> Option<BTreeMap<String, String>> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .find(|command| command.display().contains(needle))
            .map(|command| command.env.clone())
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.contains(needle))
            .count()
    }
}

impl ProcessExecutor for RoutingExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let line = request.command.display();
        self.commands.lock().unwrap().push(request.command.clone());

        let routes = self.routes.lock().unwrap();
        let (exit_code, stdout, stderr) = match routes.iter().find(|route| line.contains(&route.needle)) {
            Some(route) => (route.exit_code, route.stdout.clone(), route.stderr.clone()),
            None => (127, String::new(), format!("unrouted command: {line}")),
        };
        let now = SystemTime::now();
        Ok(Box::new(FinishedProcess {
            output: ProcessOutput {
                status: ProcessExitStatus::ExitCode(exit_code),
                stdout: stdout.into_bytes(),
                stderr: stderr.into_bytes(),
                started_at: now,
                finished_at: now,
            },
        }))
    }
}

struct FinishedProcess {
    output: ProcessOutput,
}

impl RunningProcess for FinishedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let output = self.output;
        Box::pin(async move { Ok(output) })
    }
}

/// A deployment wired to a routing executor, a temp database and a temp
/// home directory that holds every job root.
pub struct Harness {
    pub home: TempDir,
    pub scripts: TempDir,
    pub executor: Arc<RoutingExecutor>,
    pub store: Arc<SqliteStore>,
    pub gateway: ConnectionGateway,
    pub clock: SiteClock,
    pub service: JobService,
}

impl Harness {
    /// A `hai` deployment; no delegated credentials.
    pub fn new(name: &str, gateway_job_types: &[&str]) -> Self {
        Self::for_site(name, gateway_job_types, SiteId::Hai, None)
    }

    /// `ihep` always stages credentials; `heps` does when a provider is given.
    /// Credentials are refreshed with [`AKLOG`].
    pub fn for_site(
        name: &str,
        gateway_job_types: &[&str],
        site: SiteId,
        provider: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        let home = tempfile::tempdir().unwrap();
        let scripts = tempfile::tempdir().unwrap();
        for job_type in ["common", "enode", "vnc", "jupyter", "vscode", "rootbrowse"] {
            let dir = scripts.path().join(job_type);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("shell.sh"), "#!/bin/bash\nexec ./run.sh\n").unwrap();
            std::fs::write(dir.join("run.sh"), "#!/bin/bash\nsleep 60\n").unwrap();
        }

        let executor = Arc::new(RoutingExecutor::default());
        let store = temp_store(name);
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::unowned());
        let clock = SiteClock::from_offset_hours(8);

        let runner = SshGatewayRunner::new(executor.clone(), GatewaySettings::new("gw.example.org"));
        let gateway = ConnectionGateway::new(store.clone(), Arc::new(runner), storage.clone());

        let account = UserAccount {
            uid: UID,
            gid: UID,
            username: USERNAME.to_string(),
            home: home.path().to_path_buf(),
            shell: PathBuf::from("/bin/bash"),
            group: "juno".to_string(),
        };

        let krb5_enabled = provider.is_some();
        let staging = Staging {
            storage: storage.clone(),
            credentials: provider.map(|provider| CredentialSupport {
                provider,
                executor: executor.clone(),
                aklog: PathBuf::from(AKLOG),
            }),
            clock,
        };
        let home_root = home.path().to_string_lossy().into_owned();
        let environment: Arc<dyn EnvironmentBuilder> = match site {
            SiteId::Hai => Arc::new(HaiEnvironment::new(staging)),
            SiteId::Ihep => Arc::new(IhepEnvironment::new(staging, home_root)),
            SiteId::Heps => Arc::new(HepsEnvironment::new(staging, "~", krb5_enabled)),
        };

        let mut builder = RegistryBuilder::new(site)
            .with_standard_adapters()
            .unwrap()
            .with_standard_submitters(krb5_enabled)
            .unwrap();
        if site == SiteId::Hai {
            builder = builder
                .register_submitter(
                    SiteId::Hai,
                    ClusterId::HtCondor,
                    Arc::new(CondorLoginSubmitter::new(false)),
                )
                .unwrap();
        }
        let registry = builder
            .register_environment(environment)
            .unwrap()
            .build(RegistryServices {
                executor: executor.clone(),
                users: Arc::new(StaticUserDirectory::new([account])),
                store: store.clone(),
                storage,
                gateway: gateway.clone(),
                otp: Arc::new(SshOtpIssuer::new(executor.clone(), OtpSettings::default())),
                settings: Arc::new(AdapterSettings {
                    cluster_scripts: scripts.path().to_path_buf(),
                    iptables_jobtypes: gateway_job_types.iter().map(|t| t.to_string()).collect(),
                    clock,
                    schedd_host: "sched01.example.org".to_string(),
                    cm_host: "cm01.example.org".to_string(),
                    connect: ConnectSettings {
                        web_url: format!("{WEB_URL}/"),
                        gateway_host: "gw.example.org".to_string(),
                    },
                    ..AdapterSettings::default()
                }),
            });

        Self {
            home,
            scripts,
            executor,
            store,
            gateway,
            clock,
            service: JobService::new(registry),
        }
    }

    pub fn jobs_root(&self) -> PathBuf {
        self.home.path().join(".ink/Jobs")
    }

    pub fn record(&self, job_id: &str, cluster: ClusterId) -> ink_core::models::JobRecord {
        self.store.get_job(&JobKey::new(UID, job_id, cluster)).unwrap()
    }
}

/// One `sacct -P -X -n` row in the adapter's field order.
pub fn sacct_line(job_id: &str, state: &str, job_type: &str, work_dir: &Path) -> String {
    let (start, end) = match state {
        "PENDING" => ("Unknown", "Unknown"),
        "RUNNING" => ("2026-10-16T10:01:00", "Unknown"),
        _ => ("2026-10-16T10:01:00", "2026-10-16T10:30:00"),
    };
    format!(
        "{job_id}|normal|{state}|00:01:00|1|wn042|{job_type}|2026-10-16T10:00:00|{start}|{end}|{}|02:00:00\n",
        work_dir.display()
    )
}

/// One `condor_q -af` row in the adapter's attribute order.
pub fn condor_q_line(cluster_id: &str, status: &str, job_type: &str, work_dir: &Path) -> String {
    let dir = work_dir.display();
    format!(
        "{USERNAME} {cluster_id} 0 juno 1792116000 {status} 1792116060 slot1@wn042.example.org {job_type} CentOS7 {dir} {dir}/{cluster_id}.out {dir}/{cluster_id}.err undefined\n"
    )
}
