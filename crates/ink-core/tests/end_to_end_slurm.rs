mod support;

use ink_core::models::{
    BackendOptions, ClusterId, CoreErrorKind, JobFilter, JobOperation, JobSpec, JobStatus,
    SlurmOptions,
};
use ink_core::persistence::JobStore;
use support::{Harness, sacct_line};

fn common_spec() -> JobSpec {
    JobSpec {
        job_type: "common".to_string(),
        job_name: None,
        cpu: 2,
        mem_mb: 4096,
        gpu_num: 0,
        arguments: None,
        backend: BackendOptions::Slurm(SlurmOptions {
            partition: Some("cpu".to_string()),
            ..SlurmOptions::default()
        }),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_then_cancel_marks_job_completed() {
    let harness = Harness::new("e2e-slurm-cancel", &[]);
    harness.executor.respond("sbatch", "4242\n");
    harness.executor.respond("scancel", "");

    let outcome = harness
        .service
        .submit(support::USERNAME, "slurm", common_spec())
        .await
        .unwrap();

    assert_eq!(outcome.job_id, "4242");
    let job_dir = std::path::Path::new(&outcome.job_dir);
    assert_eq!(job_dir.parent().unwrap(), harness.jobs_root());
    let dir_name = job_dir.file_name().unwrap().to_string_lossy().into_owned();
    assert!(dir_name.starts_with("common-"), "{dir_name}");
    assert_eq!(dir_name.len(), "common-20261016-101500".len());
    assert!(job_dir.join("shell.sh").is_file());
    assert!(job_dir.join("run.sh").is_file());

    let record = harness.record("4242", ClusterId::Slurm);
    assert!(matches!(record.status, JobStatus::Submitted | JobStatus::Queueing));
    assert_eq!(record.job_type, "common");
    assert_eq!(record.job_path, outcome.job_dir);

    let submit = &harness.executor.calls()[0];
    assert!(submit.starts_with("sudo -iu alice bash -lc"), "{submit}");
    assert!(submit.contains("--partition=cpu"), "{submit}");
    assert!(submit.contains("--mem=4096M"), "{submit}");

    harness
        .service
        .cancel(support::USERNAME, "slurm", "4242")
        .await
        .unwrap();

    let record = harness.record("4242", ClusterId::Slurm);
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.end_time.is_some());
    assert_eq!(harness.executor.count("sudo -u alice scancel 4242"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_sbatch_surfaces_command_failure_without_a_record() {
    let harness = Harness::new("e2e-slurm-sbatch-fails", &[]);
    harness
        .executor
        .fail("sbatch", "sbatch: error: invalid partition specified: gpu");

    let error = harness
        .service
        .submit(support::USERNAME, "slurm", common_spec())
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::CommandFailed);
    assert_eq!(error.cluster, Some(ClusterId::Slurm));
    assert_eq!(error.operation, Some(JobOperation::Submit));
    assert_eq!(error.uid, Some(support::UID));
    assert!(error.message.contains("invalid partition"), "{}", error.message);
    assert!(
        harness
            .store
            .list_user_jobs(support::UID, ClusterId::Slurm)
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_inserts_jobs_missing_from_the_store() {
    let harness = Harness::new("e2e-slurm-self-heal", &[]);
    let work_dir = harness.jobs_root().join("common-20261016-100000");
    harness
        .executor
        .respond("sacct", &sacct_line("5150", "PENDING", "common", &work_dir));

    let views = harness
        .service
        .query(support::USERNAME, "slurm", JobFilter::all())
        .await
        .unwrap();

    assert_eq!(views.len(), 1);
    assert_eq!(views[0].status, JobStatus::Queueing);
    assert_eq!(views[0].raw_status, "PENDING");

    let records = harness
        .store
        .list_user_jobs(support::UID, ClusterId::Slurm)
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, "5150");
    assert_eq!(records[0].job_type, "common");
    assert_eq!(records[0].status, JobStatus::Queueing);
    assert_eq!(records[0].job_path, work_dir.to_string_lossy());

    harness
        .service
        .query(support::USERNAME, "slurm", JobFilter::all())
        .await
        .unwrap();
    assert_eq!(
        harness
            .store
            .list_user_jobs(support::UID, ClusterId::Slurm)
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_listing_cannot_revive_a_completed_job() {
    let harness = Harness::new("e2e-slurm-monotonic", &[]);
    let work_dir = harness.jobs_root().join("common-20261016-100000");

    for state in ["PENDING", "RUNNING", "COMPLETED"] {
        harness
            .executor
            .respond("sacct", &sacct_line("6000", state, "common", &work_dir));
        harness
            .service
            .query(support::USERNAME, "slurm", JobFilter::all())
            .await
            .unwrap();
    }
    let record = harness.record("6000", ClusterId::Slurm);
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.end_time.is_some());

    harness
        .executor
        .respond("sacct", &sacct_line("6000", "RUNNING", "common", &work_dir));
    let views = harness
        .service
        .query(support::USERNAME, "slurm", JobFilter::all())
        .await
        .unwrap();

    assert_eq!(views[0].status, JobStatus::Completed);
    assert_eq!(harness.record("6000", ClusterId::Slurm).status, JobStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_filters_by_job_type_after_reconciling_every_row() {
    let harness = Harness::new("e2e-slurm-filter", &[]);
    let root = harness.jobs_root();
    let listing = [
        sacct_line("1", "PENDING", "common", &root.join("common-a")),
        sacct_line("2", "RUNNING", "enode", &root.join("enode-b")),
    ]
    .concat();
    harness.executor.respond("sacct", &listing);

    let views = harness
        .service
        .query(support::USERNAME, "slurm", JobFilter::job_type("enode"))
        .await
        .unwrap();

    assert_eq!(views.len(), 1);
    assert_eq!(views[0].job_id, "2");
    assert_eq!(
        harness
            .store
            .list_user_jobs(support::UID, ClusterId::Slurm)
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_listing_means_no_jobs() {
    let harness = Harness::new("e2e-slurm-empty", &[]);
    harness.executor.respond("sacct", "\n");

    let views = harness
        .service
        .query(support::USERNAME, "slurm", JobFilter::all())
        .await
        .unwrap();
    assert!(views.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_locks_are_forgotten_once_queries_finish() {
    let harness = Harness::new("e2e-slurm-lock-release", &[]);
    harness.executor.respond("sacct", "\n");
    harness.executor.fail("condor_q", "Failed to connect to schedd");

    let service = &harness.service;
    let (first, second, failed) = tokio::join!(
        service.query(support::USERNAME, "slurm", JobFilter::all()),
        service.query(support::USERNAME, "slurm", JobFilter::all()),
        service.query(support::USERNAME, "htcondor", JobFilter::all()),
    );

    assert!(first.unwrap().is_empty());
    assert!(second.unwrap().is_empty());
    assert_eq!(failed.unwrap_err().kind, CoreErrorKind::CommandFailed);
    assert_eq!(service.tracked_query_locks().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_output_reads_both_streams_and_tolerates_missing_files() {
    let harness = Harness::new("e2e-slurm-output", &[]);
    harness.executor.respond("sbatch", "77;cluster-a\n");

    let outcome = harness
        .service
        .submit(support::USERNAME, "slurm", common_spec())
        .await
        .unwrap();
    assert_eq!(outcome.job_id, "77");
    std::fs::write(
        std::path::Path::new(&outcome.job_dir).join("77.out"),
        "hello from the job\n",
    )
    .unwrap();

    let output = harness
        .service
        .job_output(support::USERNAME, "slurm", "77")
        .await
        .unwrap();
    assert_eq!(output.stdout, "hello from the job\n");
    assert_eq!(output.stderr, "");

    let error = harness
        .service
        .job_output(support::USERNAME, "slurm", "78")
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::RecordNotFound);
    assert_eq!(error.operation, Some(JobOperation::ReadOutput));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_scheduler_lists_registered_clusters() {
    let harness = Harness::new("e2e-unknown-scheduler", &[]);

    let error = harness
        .service
        .query(support::USERNAME, "pbs", JobFilter::all())
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::UnknownScheduler);
    assert_eq!(error.operation, Some(JobOperation::Query));
    assert!(error.message.contains("'pbs'"), "{}", error.message);
    assert!(error.message.contains("slurm"), "{}", error.message);
    assert!(harness.executor.calls().is_empty());
}
