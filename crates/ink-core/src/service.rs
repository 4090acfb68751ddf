//! Async entry point over the registry.
//!
//! Adapter calls block on external processes, so each one runs on the blocking
//! pool. Queries for the same (user, cluster) are serialized because a query
//! writes to the job store as a side effect.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::adapters::SchedulerAdapter;
use crate::config::Settings;
use crate::connect::{ConnectInfo, SshOtpIssuer};
use crate::credentials::CommandCredentialProvider;
use crate::environment::{
    CredentialSupport, EnvironmentBuilder, HaiEnvironment, HepsEnvironment, IhepEnvironment,
    Staging,
};
use crate::execution::{CommandSpec, ProcessExecutor, TokioProcessExecutor};
use crate::gateway::{ConnectionGateway, SshGatewayRunner};
use crate::models::{
    ClusterId, CoreError, CoreErrorKind, CoreResult, JobFilter, JobOperation, JobOutput, JobSpec,
    JobView, SiteId, SubmitOutcome,
};
use crate::persistence::JobStore;
use crate::reconcile::{ProcessCondorHistorySource, Reconciler};
use crate::registry::{Registry, RegistryBuilder, RegistryServices};
use crate::sqlite::SqliteStore;
use crate::storage::{LocalStorage, StorageBackend};
use crate::users::SystemUserDirectory;

type QueryLocks = Arc<Mutex<HashMap<(String, ClusterId), Arc<Mutex<()>>>>>;

#[derive(Clone)]
pub struct JobService {
    registry: Arc<Registry>,
    query_locks: QueryLocks,
}

impl JobService {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            query_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wires the production collaborators for the configured site and brings
    /// the job store schema up to date.
    pub fn from_settings(settings: &Settings) -> CoreResult<Self> {
        let site = settings.site()?;
        let executor: Arc<dyn ProcessExecutor> = Arc::new(TokioProcessExecutor);

        let store = SqliteStore::new(&settings.database.path);
        store.migrate_to_latest()?;
        let store: Arc<dyn JobStore> = Arc::new(store);
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::owned());

        let runner = SshGatewayRunner::new(executor.clone(), settings.gateway_settings()?);
        let gateway = ConnectionGateway::new(store.clone(), Arc::new(runner), storage.clone());
        let otp = SshOtpIssuer::new(executor.clone(), settings.otp_settings());

        let registry = RegistryBuilder::new(site)
            .with_standard_adapters()?
            .with_standard_submitters(settings.common.krb5_enabled)?
            .register_environment(site_environment(
                settings,
                site,
                executor.clone(),
                storage.clone(),
            )?)?
            .build(RegistryServices {
                executor,
                users: Arc::new(SystemUserDirectory),
                store,
                storage,
                gateway,
                otp: Arc::new(otp),
                settings: Arc::new(settings.adapter_settings()),
            });

        tracing::info!(
            site = site.as_str(),
            database = %settings.database.path.display(),
            "job service ready"
        );
        Ok(Self::new(registry))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The reconciler for this deployment's HTCondor schedd.
    pub fn reconciler(&self, settings: &Settings) -> Reconciler<ProcessCondorHistorySource> {
        let services = self.registry.services();
        Reconciler::new(
            ProcessCondorHistorySource::new(
                services.executor.clone(),
                services.settings.schedd_host.clone(),
            ),
            services.store.clone(),
            services.gateway.clone(),
            services.settings.clock,
            settings.reconcile_settings(),
        )
    }

    pub async fn submit(
        &self,
        username: &str,
        cluster_id: &str,
        spec: JobSpec,
    ) -> CoreResult<SubmitOutcome> {
        let adapter = self.adapter(username, cluster_id, JobOperation::Submit)?;
        run_adapter(JobOperation::Submit, move || adapter.submit_job(&spec)).await
    }

    pub async fn query(
        &self,
        username: &str,
        cluster_id: &str,
        filter: JobFilter,
    ) -> CoreResult<Vec<JobView>> {
        let adapter = self.adapter(username, cluster_id, JobOperation::Query)?;
        let key = (username.to_string(), adapter.cluster());
        let lock = self.query_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            run_adapter(JobOperation::Query, move || adapter.query_job(&filter)).await
        };
        self.release_query_lock(&key, lock).await;
        result
    }

    pub async fn cancel(&self, username: &str, cluster_id: &str, job_id: &str) -> CoreResult<()> {
        let adapter = self.adapter(username, cluster_id, JobOperation::Cancel)?;
        let job_id = job_id.to_string();
        run_adapter(JobOperation::Cancel, move || adapter.cancel_job(&job_id)).await
    }

    pub async fn job_output(
        &self,
        username: &str,
        cluster_id: &str,
        job_id: &str,
    ) -> CoreResult<JobOutput> {
        let adapter = self.adapter(username, cluster_id, JobOperation::ReadOutput)?;
        let job_id = job_id.to_string();
        run_adapter(JobOperation::ReadOutput, move || adapter.job_output(&job_id)).await
    }

    pub async fn connect_info(
        &self,
        username: &str,
        cluster_id: &str,
        job_id: &str,
    ) -> CoreResult<ConnectInfo> {
        let adapter = self.adapter(username, cluster_id, JobOperation::Connect)?;
        let job_id = job_id.to_string();
        run_adapter(JobOperation::Connect, move || adapter.connect_info(&job_id)).await
    }

    fn adapter(
        &self,
        username: &str,
        cluster_id: &str,
        operation: JobOperation,
    ) -> CoreResult<Arc<dyn SchedulerAdapter>> {
        self.registry
            .get(cluster_id, username)
            .map_err(|error| CoreError {
                operation: error.operation.or(Some(operation)),
                ..error
            })
    }

    async fn query_lock(&self, key: &(String, ClusterId)) -> Arc<Mutex<()>> {
        let mut locks = self.query_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    /// Forgets the lock once no other query holds or awaits it. Clones are only
    /// taken under the map lock, so the count cannot grow while we check it.
    async fn release_query_lock(&self, key: &(String, ClusterId), lock: Arc<Mutex<()>>) {
        let mut locks = self.query_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    /// Number of (user, cluster) pairs with a query in flight.
    pub async fn tracked_query_locks(&self) -> usize {
        self.query_locks.lock().await.len()
    }
}

async fn run_adapter<T, F>(operation: JobOperation, call: F) -> CoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CoreResult<T> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(call).await.map_err(|join_error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("adapter task join failure: {join_error}"),
        )
        .with_operation(operation)
    })?;
    if let Err(error) = &result {
        tracing::warn!(
            operation = operation.as_str(),
            cluster = ?error.cluster,
            uid = ?error.uid,
            job_id = ?error.job_id,
            kind = ?error.kind,
            message = %error.message,
            "adapter call failed"
        );
    }
    result
}

fn site_environment(
    settings: &Settings,
    site: SiteId,
    executor: Arc<dyn ProcessExecutor>,
    storage: Arc<dyn StorageBackend>,
) -> CoreResult<Arc<dyn EnvironmentBuilder>> {
    let computing = &settings.computing;
    let needs_credentials = match site {
        SiteId::Ihep => true,
        SiteId::Hai => false,
        SiteId::Heps => settings.common.krb5_enabled,
    };

    let credentials = match computing.credential_command.split_first() {
        Some((program, args)) => Some(CredentialSupport {
            provider: Arc::new(CommandCredentialProvider::new(
                executor.clone(),
                CommandSpec::new(program).args(args.iter().cloned()),
            )),
            executor,
            aklog: computing.aklog_command.clone(),
        }),
        None if needs_credentials => {
            return Err(CoreError::new(
                CoreErrorKind::Configuration,
                format!("site '{site}' needs computing.credential_command"),
            ));
        }
        None => None,
    };

    let staging = Staging {
        storage,
        credentials,
        clock: settings.clock(),
    };
    Ok(match site {
        SiteId::Ihep => Arc::new(IhepEnvironment::new(staging, computing.ink_dir.clone())),
        SiteId::Hai => Arc::new(HaiEnvironment::new(staging)),
        SiteId::Heps => Arc::new(HepsEnvironment::new(
            staging,
            computing.ink_dir.clone(),
            settings.common.krb5_enabled,
        )),
    })
}
