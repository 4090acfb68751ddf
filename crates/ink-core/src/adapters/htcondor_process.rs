use std::sync::Arc;

use crate::adapters::htcondor::{
    CondorSource, CondorTarget, condor_q_request, condor_rm_request, condor_submit_request,
};
use crate::execution::{ProcessExecutor, run_and_collect_stdout};
use crate::models::CoreResult;
use crate::submit::{SubmitInvocation, Submitter};

pub struct ProcessCondorSource {
    executor: Arc<dyn ProcessExecutor>,
    submitter: Arc<dyn Submitter>,
}

impl ProcessCondorSource {
    pub fn new(executor: Arc<dyn ProcessExecutor>, submitter: Arc<dyn Submitter>) -> Self {
        Self {
            executor,
            submitter,
        }
    }
}

impl CondorSource for ProcessCondorSource {
    fn submit(&self, invocation: &SubmitInvocation<'_>) -> CoreResult<String> {
        let command = self.submitter.command(invocation);
        tracing::debug!(command = %command.display(), "htcondor submit command");
        run_and_collect_stdout(self.executor.as_ref(), condor_submit_request(command))
    }

    fn list_jobs(&self, username: &str, schedd: &str, constraint: &str) -> CoreResult<String> {
        run_and_collect_stdout(
            self.executor.as_ref(),
            condor_q_request(username, schedd, constraint),
        )
    }

    fn cancel(&self, username: &str, target: &CondorTarget, job_id: &str) -> CoreResult<String> {
        run_and_collect_stdout(
            self.executor.as_ref(),
            condor_rm_request(username, target, job_id),
        )
    }
}
