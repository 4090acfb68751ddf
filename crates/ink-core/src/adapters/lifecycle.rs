//! Record-keeping shared by every backend: reconciling listed rows with the
//! store, readiness detection, cancellation bookkeeping, output retrieval and
//! connection details.

use std::path::Path;
use std::time::SystemTime;

use crate::adapters::{AdapterContext, validate_job_id};
use crate::adapters::readiness::service_ready;
use crate::connect::{self, APP_LOGIN_FILE, ConnectInfo, ConnectKind};
use crate::models::{
    ClusterId, CoreError, CoreErrorKind, CoreResult, JobKey, JobOutput, JobRecord, JobStatus,
    JobView, NewJobRecord, StatusUpdate,
};

/// Substitutes the scheduler's job-id placeholders in an output path template.
pub fn replace_job_id(template: &str, job_id: &str) -> String {
    template
        .replace("%j", job_id)
        .replace("$(ClusterId)", job_id)
}

/// Applies one listed row to the store and returns the reconciled view.
///
/// Missing records are inserted from `seed`. Status writes that the stored value
/// does not admit are refused and the stored status is reported instead.
pub(crate) fn observe(
    context: &AdapterContext,
    cluster: ClusterId,
    view: &mut JobView,
    seed: impl FnOnce() -> NewJobRecord,
) -> CoreResult<()> {
    let key = JobKey::new(context.account.uid, view.job_id.clone(), cluster);
    let record = match context.store.find_job(&key)? {
        Some(record) => record,
        None => {
            context.store.insert_job(&seed())?;
            tracing::info!(
                cluster = %cluster,
                uid = key.uid,
                job_id = %key.job_id,
                "recorded job found only in scheduler listing"
            );
            context.store.get_job(&key)?
        }
    };

    if view.job_type.is_empty() {
        view.job_type = record.job_type.clone();
    }
    view.connect_sign = record.connect_sign;

    if record.status != view.status {
        match context.store.update_status(&key, view.status)? {
            StatusUpdate::Applied => tracing::info!(
                cluster = %cluster,
                uid = key.uid,
                job_id = %key.job_id,
                from = %record.status,
                to = %view.status,
                "job status changed"
            ),
            StatusUpdate::Unchanged => {}
            StatusUpdate::Rejected { stored } => {
                tracing::debug!(
                    job_id = %key.job_id,
                    stored = %stored,
                    reported = %view.status,
                    "ignored regressive status"
                );
                view.status = stored;
            }
        }
    }

    if view.status == JobStatus::Running && !record.connect_sign {
        check_readiness(context, &key, &record, view)?;
    }

    if view.status.is_terminal() {
        if let Some(end) = view.end_time {
            context.store.set_end_time_if_missing(&key, end)?;
        }
        context.gateway.close_if_open(&record)?;
    }

    Ok(())
}

fn check_readiness(
    context: &AdapterContext,
    key: &JobKey,
    record: &JobRecord,
    view: &mut JobView,
) -> CoreResult<()> {
    let output_path = replace_job_id(&record.outpath, &key.job_id);
    let output = match context
        .storage
        .read_file(&context.account, Path::new(&output_path))
    {
        Ok(output) => output.unwrap_or_default(),
        Err(error) => {
            tracing::warn!(
                job_id = %key.job_id,
                path = %output_path,
                error = %error,
                "could not read job output"
            );
            return Ok(());
        }
    };
    if !service_ready(&output) {
        return Ok(());
    }

    if context.settings.exposes_gateway(&view.job_type)
        && let Err(error) = context.gateway.open(key, &context.account)
    {
        tracing::error!(
            cluster = %key.cluster,
            uid = key.uid,
            job_id = %key.job_id,
            kind = ?error.kind,
            message = %error.message,
            "gateway rule not opened; will retry on next poll"
        );
        return Ok(());
    }

    context.store.set_connect_sign(key, true)?;
    context
        .store
        .set_start_time(key, view.start_time.unwrap_or_else(SystemTime::now))?;
    view.connect_sign = true;
    Ok(())
}

/// Bookkeeping after the scheduler accepted a cancel request.
pub(crate) fn record_cancellation(
    context: &AdapterContext,
    cluster: ClusterId,
    job_id: &str,
) -> CoreResult<()> {
    let key = JobKey::new(context.account.uid, job_id, cluster);
    let Some(record) = context.store.find_job(&key)? else {
        tracing::warn!(
            cluster = %cluster,
            uid = key.uid,
            job_id,
            "cancelled job has no local record"
        );
        return Ok(());
    };

    context.gateway.close_if_open(&record)?;
    context.store.update_status(&key, JobStatus::Completed)?;
    context.store.set_end_time(&key, SystemTime::now())?;
    tracing::info!(cluster = %cluster, uid = key.uid, job_id, "job cancelled");
    Ok(())
}

pub(crate) fn read_output(
    context: &AdapterContext,
    cluster: ClusterId,
    job_id: &str,
) -> CoreResult<JobOutput> {
    let key = JobKey::new(context.account.uid, job_id, cluster);
    let paths = context.store.job_paths(&key)?.ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::RecordNotFound,
            format!("no job '{job_id}' recorded on {cluster}"),
        )
    })?;

    let read = |template: &str| -> CoreResult<String> {
        let path = replace_job_id(template, job_id);
        Ok(context
            .storage
            .read_file(&context.account, Path::new(&path))?
            .unwrap_or_default())
    };

    Ok(JobOutput {
        stdout: read(&paths.outpath)?,
        stderr: read(&paths.errpath)?,
    })
}

pub(crate) fn connect_info(
    context: &AdapterContext,
    cluster: ClusterId,
    job_id: &str,
) -> CoreResult<ConnectInfo> {
    validate_job_id(job_id)?;
    let key = JobKey::new(context.account.uid, job_id, cluster);
    let record = context.store.find_job(&key)?.ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::RecordNotFound,
            format!("no job '{job_id}' recorded on {cluster}"),
        )
    })?;
    if record.status.is_terminal() {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("job '{job_id}' has finished"),
        ));
    }
    let kind = ConnectKind::for_job_type(&record.job_type).ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("job type '{}' has no connection details", record.job_type),
        )
    })?;

    let login = match kind {
        ConnectKind::Ssh => None,
        _ => context.storage.read_file(
            &context.account,
            &Path::new(&record.job_path).join(APP_LOGIN_FILE),
        )?,
    };
    let info = connect::connect_info(
        kind,
        &record,
        login.as_deref(),
        &context.settings.connect,
        context.otp.as_ref(),
        &context.account.username,
    )?;
    tracing::info!(
        cluster = %cluster,
        uid = key.uid,
        job_id,
        job_type = %record.job_type,
        "resolved connection details"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_replaced() {
        assert_eq!(replace_job_id("/j/%j.out", "42"), "/j/42.out");
        assert_eq!(replace_job_id("/j/$(ClusterId).err", "7"), "/j/7.err");
        assert_eq!(replace_job_id("/j/9.out", "9"), "/j/9.out");
    }
}
