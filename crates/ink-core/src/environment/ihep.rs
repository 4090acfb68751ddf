use std::path::PathBuf;

use crate::environment::{EnvironmentBuilder, EnvironmentRequest, JobEnvironment, Staging};
use crate::models::{CoreResult, SiteId};

/// Experiment name for a primary unix group.
pub fn experiment_group(group: &str) -> Option<&'static str> {
    let experiment = match group {
        "alicpt" => "AliCPT",
        "cms" => "CMS",
        "dyw" => "DYW",
        "gecam" => "GECAM",
        "hxmt" => "HXMT",
        "lhcb" => "LHCB",
        "panda" => "Panda",
        "higgs" => "CEPC",
        "u07" => "CC",
        "comet" => "COMET",
        "csns" => "CSNS",
        "ucas" => "OTHERS",
        "heps" => "HEPS",
        "atlas" | "combination" => "ATLAS",
        "dqarun" | "offlinerun" | "physics" => "BES",
        "juno" | "dqmtest" | "dqmjuno" | "junospecial" | "junodc" | "junogns" => "JUNO",
        "lhaaso" | "lhaasorun" => "LHAASO",
        "herd" | "herdrun" => "HERD",
        _ => return None,
    };
    Some(experiment)
}

/// Job directories live under a group-partitioned shared tree; credentials are mandatory.
pub struct IhepEnvironment {
    staging: Staging,
    /// Template with `{user_group}` and `{username}` placeholders.
    ink_dir: String,
}

impl IhepEnvironment {
    pub fn new(staging: Staging, ink_dir: impl Into<String>) -> Self {
        Self {
            staging,
            ink_dir: ink_dir.into(),
        }
    }

    pub fn job_root(&self, group: &str, username: &str) -> PathBuf {
        PathBuf::from(
            self.ink_dir
                .replace("{user_group}", group)
                .replace("{username}", username),
        )
        .join(".ink/Jobs")
    }
}

impl EnvironmentBuilder for IhepEnvironment {
    fn site(&self) -> SiteId {
        SiteId::Ihep
    }

    fn build(&self, request: &EnvironmentRequest<'_>) -> CoreResult<JobEnvironment> {
        let account = request.account;
        tracing::debug!(
            uid = account.uid,
            group = %account.group,
            experiment = ?experiment_group(&account.group),
            "resolving ihep job root"
        );
        let job_dir = self
            .job_root(&account.group, &account.username)
            .join(self.staging.job_dir_name(request.job_type, request.now));
        self.staging.stage(SiteId::Ihep, request, job_dir, true)
    }
}
