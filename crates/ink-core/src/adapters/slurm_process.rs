use std::sync::Arc;

use crate::adapters::slurm::{
    SlurmSource, sacct_request, scancel_request, slurm_submit_request,
};
use crate::execution::{ProcessExecutor, run_and_collect_stdout};
use crate::models::CoreResult;
use crate::submit::{SubmitInvocation, Submitter};

pub struct ProcessSlurmSource {
    executor: Arc<dyn ProcessExecutor>,
    submitter: Arc<dyn Submitter>,
}

impl ProcessSlurmSource {
    pub fn new(executor: Arc<dyn ProcessExecutor>, submitter: Arc<dyn Submitter>) -> Self {
        Self {
            executor,
            submitter,
        }
    }
}

impl SlurmSource for ProcessSlurmSource {
    fn submit(&self, invocation: &SubmitInvocation<'_>) -> CoreResult<String> {
        let command = self.submitter.command(invocation);
        tracing::debug!(command = %command.display(), "slurm submit command");
        run_and_collect_stdout(self.executor.as_ref(), slurm_submit_request(command))
    }

    fn list_jobs(&self, username: &str) -> CoreResult<String> {
        run_and_collect_stdout(self.executor.as_ref(), sacct_request(username))
    }

    fn cancel(&self, username: &str, job_id: &str) -> CoreResult<String> {
        run_and_collect_stdout(self.executor.as_ref(), scancel_request(username, job_id))
    }
}
