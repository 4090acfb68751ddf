//! Lookup tables from cluster id to adapter, (site, cluster) to submitter and
//! site to environment builder. Built once at start-up, read-only afterwards.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::adapters::{
    AdapterContext, AdapterSettings, CondorAdapter, ProcessCondorSource, ProcessSlurmSource,
    SchedulerAdapter, SlurmAdapter,
};
use crate::connect::OtpIssuer;
use crate::environment::EnvironmentBuilder;
use crate::execution::ProcessExecutor;
use crate::gateway::ConnectionGateway;
use crate::models::{ClusterId, CoreError, CoreErrorKind, CoreResult, SiteId};
use crate::persistence::JobStore;
use crate::storage::StorageBackend;
use crate::submit::{CondorLoginSubmitter, LoginShellSubmitter, SudoLoginSubmitter, Submitter};
use crate::users::UserDirectory;

/// What an adapter factory receives for one user.
pub struct AdapterParts {
    pub context: AdapterContext,
    pub executor: Arc<dyn ProcessExecutor>,
    pub submitter: Arc<dyn Submitter>,
}

pub type AdapterFactory = fn(AdapterParts) -> Arc<dyn SchedulerAdapter>;

pub fn slurm_adapter(parts: AdapterParts) -> Arc<dyn SchedulerAdapter> {
    Arc::new(SlurmAdapter::new(
        ProcessSlurmSource::new(parts.executor, parts.submitter),
        parts.context,
    ))
}

pub fn condor_adapter(parts: AdapterParts) -> Arc<dyn SchedulerAdapter> {
    Arc::new(CondorAdapter::new(
        ProcessCondorSource::new(parts.executor, parts.submitter),
        parts.context,
    ))
}

/// Shared collaborators handed to every adapter the registry constructs.
#[derive(Clone)]
pub struct RegistryServices {
    pub executor: Arc<dyn ProcessExecutor>,
    pub users: Arc<dyn UserDirectory>,
    pub store: Arc<dyn JobStore>,
    pub storage: Arc<dyn StorageBackend>,
    pub gateway: ConnectionGateway,
    pub otp: Arc<dyn OtpIssuer>,
    pub settings: Arc<AdapterSettings>,
}

pub struct RegistryBuilder {
    site: SiteId,
    adapters: BTreeMap<ClusterId, AdapterFactory>,
    submitters: BTreeMap<(SiteId, ClusterId), Arc<dyn Submitter>>,
    environments: BTreeMap<SiteId, Arc<dyn EnvironmentBuilder>>,
}

impl RegistryBuilder {
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            adapters: BTreeMap::new(),
            submitters: BTreeMap::new(),
            environments: BTreeMap::new(),
        }
    }

    pub fn register_adapter(mut self, cluster: ClusterId, factory: AdapterFactory) -> CoreResult<Self> {
        if self.adapters.insert(cluster, factory).is_some() {
            return Err(duplicate(format!("adapter for cluster '{cluster}'")));
        }
        Ok(self)
    }

    pub fn register_submitter(
        mut self,
        site: SiteId,
        cluster: ClusterId,
        submitter: Arc<dyn Submitter>,
    ) -> CoreResult<Self> {
        if self.submitters.insert((site, cluster), submitter).is_some() {
            return Err(duplicate(format!(
                "submitter for site '{site}' and cluster '{cluster}'"
            )));
        }
        Ok(self)
    }

    pub fn register_environment(mut self, builder: Arc<dyn EnvironmentBuilder>) -> CoreResult<Self> {
        let site = builder.site();
        if self.environments.insert(site, builder).is_some() {
            return Err(duplicate(format!("environment builder for site '{site}'")));
        }
        Ok(self)
    }

    pub fn with_standard_adapters(self) -> CoreResult<Self> {
        self.register_adapter(ClusterId::Slurm, slurm_adapter)?
            .register_adapter(ClusterId::HtCondor, condor_adapter)
    }

    /// The submit wrappers each deployment uses. `krb5_enabled` only affects heps.
    pub fn with_standard_submitters(self, krb5_enabled: bool) -> CoreResult<Self> {
        self.register_submitter(
            SiteId::Ihep,
            ClusterId::Slurm,
            Arc::new(LoginShellSubmitter::new(true)),
        )?
        .register_submitter(
            SiteId::Ihep,
            ClusterId::HtCondor,
            Arc::new(CondorLoginSubmitter::new(true)),
        )?
        .register_submitter(SiteId::Hai, ClusterId::Slurm, Arc::new(SudoLoginSubmitter))?
        .register_submitter(
            SiteId::Heps,
            ClusterId::Slurm,
            Arc::new(LoginShellSubmitter::new(krb5_enabled)),
        )
    }

    pub fn build(self, services: RegistryServices) -> Registry {
        Registry {
            site: self.site,
            adapters: self.adapters,
            submitters: self.submitters,
            environments: self.environments,
            services,
        }
    }
}

pub struct Registry {
    site: SiteId,
    adapters: BTreeMap<ClusterId, AdapterFactory>,
    submitters: BTreeMap<(SiteId, ClusterId), Arc<dyn Submitter>>,
    environments: BTreeMap<SiteId, Arc<dyn EnvironmentBuilder>>,
    services: RegistryServices,
}

impl Registry {
    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn services(&self) -> &RegistryServices {
        &self.services
    }

    pub fn registered_clusters(&self) -> Vec<ClusterId> {
        self.adapters.keys().copied().collect()
    }

    /// Resolves `cluster_id` and `username` into an adapter bound to that user.
    pub fn get(&self, cluster_id: &str, username: &str) -> CoreResult<Arc<dyn SchedulerAdapter>> {
        let unknown = || {
            let registered: Vec<&str> = self.adapters.keys().map(|c| c.as_str()).collect();
            CoreError::new(
                CoreErrorKind::UnknownScheduler,
                format!(
                    "Unknown scheduler '{cluster_id}'. Registered=[{}]",
                    registered.join(", ")
                ),
            )
        };
        let cluster = ClusterId::from_str(cluster_id).map_err(|_| unknown())?;
        let factory = *self.adapters.get(&cluster).ok_or_else(unknown)?;

        let account = self.services.users.by_name(username)?;
        let submitter = self.submitter(self.site, cluster)?;
        let environment = self.environment_builder(self.site)?;

        Ok(factory(AdapterParts {
            context: AdapterContext {
                account,
                store: self.services.store.clone(),
                storage: self.services.storage.clone(),
                gateway: self.services.gateway.clone(),
                environment,
                otp: self.services.otp.clone(),
                settings: self.services.settings.clone(),
            },
            executor: self.services.executor.clone(),
            submitter,
        }))
    }

    pub fn submitter(&self, site: SiteId, cluster: ClusterId) -> CoreResult<Arc<dyn Submitter>> {
        self.submitters.get(&(site, cluster)).cloned().ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::UnknownSite,
                format!("no submitter registered for site '{site}' and cluster '{cluster}'"),
            )
            .with_cluster(cluster)
        })
    }

    pub fn environment_builder(&self, site: SiteId) -> CoreResult<Arc<dyn EnvironmentBuilder>> {
        self.environments.get(&site).cloned().ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::UnknownSite,
                format!("no environment builder registered for site '{site}'"),
            )
        })
    }
}

fn duplicate(what: String) -> CoreError {
    CoreError::new(
        CoreErrorKind::InvalidInput,
        format!("duplicate registration: {what}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_adapters_are_rejected() {
        let error = RegistryBuilder::new(SiteId::Ihep)
            .with_standard_adapters()
            .and_then(|builder| builder.register_adapter(ClusterId::Slurm, slurm_adapter))
            .err()
            .map(|error| error.kind);
        assert_eq!(error, Some(CoreErrorKind::InvalidInput));
    }

    #[test]
    fn standard_submitters_cover_each_deployment() {
        let builder = RegistryBuilder::new(SiteId::Hai)
            .with_standard_submitters(false)
            .unwrap();
        for key in [
            (SiteId::Ihep, ClusterId::Slurm),
            (SiteId::Ihep, ClusterId::HtCondor),
            (SiteId::Hai, ClusterId::Slurm),
            (SiteId::Heps, ClusterId::Slurm),
        ] {
            assert!(builder.submitters.contains_key(&key), "{key:?}");
        }
        assert!(!builder.submitters.contains_key(&(SiteId::Hai, ClusterId::HtCondor)));
    }
}
