use crate::environment::{EnvironmentBuilder, EnvironmentRequest, JobEnvironment, Staging};
use crate::models::{CoreResult, SiteId};

/// Job directories under the user's home; no delegated credentials.
pub struct HaiEnvironment {
    staging: Staging,
}

impl HaiEnvironment {
    pub fn new(staging: Staging) -> Self {
        Self { staging }
    }
}

impl EnvironmentBuilder for HaiEnvironment {
    fn site(&self) -> SiteId {
        SiteId::Hai
    }

    fn build(&self, request: &EnvironmentRequest<'_>) -> CoreResult<JobEnvironment> {
        let job_dir = request
            .account
            .home
            .join(".ink/Jobs")
            .join(self.staging.job_dir_name(request.job_type, request.now));
        self.staging.stage(SiteId::Hai, request, job_dir, false)
    }
}
