mod support;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ink_core::models::{ClusterId, CoreErrorKind, JobKey, JobStatus, NewJobRecord, StatusUpdate};
use ink_core::persistence::JobStore;

fn new_job(job_id: &str, cluster: ClusterId, status: JobStatus) -> NewJobRecord {
    NewJobRecord {
        uid: support::UID,
        job_id: job_id.to_string(),
        outpath: format!("/home/alice/.ink/Jobs/common-1/{job_id}.out"),
        errpath: format!("/home/alice/.ink/Jobs/common-1/{job_id}.err"),
        job_type: "common".to_string(),
        job_path: "/home/alice/.ink/Jobs/common-1".to_string(),
        cluster,
        status,
    }
}

fn key(job_id: &str, cluster: ClusterId) -> JobKey {
    JobKey::new(support::UID, job_id, cluster)
}

fn at(seconds: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds)
}

#[test]
fn inserted_record_carries_schema_defaults() {
    let store = support::temp_store("store-defaults");
    assert!(store.insert_job(&new_job("100", ClusterId::Slurm, JobStatus::Submitted)).unwrap());

    let record = store.get_job(&key("100", ClusterId::Slurm)).unwrap();
    assert_eq!(record.status, JobStatus::Submitted);
    assert_eq!(record.iptable_status, 0);
    assert!(!record.iptable_clean);
    assert!(!record.connect_sign);
    assert_eq!(record.start_time, None);
    assert_eq!(record.end_time, None);
}

#[test]
fn job_id_is_unique_per_cluster_only() {
    let store = support::temp_store("store-unique");
    assert!(store.insert_job(&new_job("7", ClusterId::Slurm, JobStatus::Submitted)).unwrap());
    assert!(!store.insert_job(&new_job("7", ClusterId::Slurm, JobStatus::Queueing)).unwrap());
    assert!(store.insert_job(&new_job("7", ClusterId::HtCondor, JobStatus::Submitted)).unwrap());

    assert_eq!(
        store.get_job(&key("7", ClusterId::Slurm)).unwrap().status,
        JobStatus::Submitted
    );
}

#[test]
fn missing_records_are_none_or_record_not_found() {
    let store = support::temp_store("store-missing");
    let missing = key("404", ClusterId::Slurm);

    assert_eq!(store.find_job(&missing).unwrap(), None);
    assert_eq!(store.job_paths(&missing).unwrap(), None);
    assert_eq!(
        store.get_job(&missing).unwrap_err().kind,
        CoreErrorKind::RecordNotFound
    );
    assert_eq!(
        store.update_status(&missing, JobStatus::Running).unwrap_err().kind,
        CoreErrorKind::RecordNotFound
    );
    assert_eq!(
        store.set_connect_sign(&missing, true).unwrap_err().kind,
        CoreErrorKind::RecordNotFound
    );
}

#[test]
fn terminal_status_is_never_overwritten() {
    let store = support::temp_store("store-monotonic");
    let job = key("8", ClusterId::Slurm);
    store.insert_job(&new_job("8", ClusterId::Slurm, JobStatus::Submitted)).unwrap();

    assert_eq!(store.update_status(&job, JobStatus::Running).unwrap(), StatusUpdate::Applied);
    assert_eq!(
        store.update_status(&job, JobStatus::Queueing).unwrap(),
        StatusUpdate::Rejected { stored: JobStatus::Running }
    );
    assert_eq!(store.update_status(&job, JobStatus::Completed).unwrap(), StatusUpdate::Applied);
    assert_eq!(
        store.update_status(&job, JobStatus::Completed).unwrap(),
        StatusUpdate::Unchanged
    );
    for stale in [JobStatus::Running, JobStatus::Holding, JobStatus::Canceled] {
        assert_eq!(
            store.update_status(&job, stale).unwrap(),
            StatusUpdate::Rejected { stored: JobStatus::Completed }
        );
    }
    assert_eq!(store.get_job(&job).unwrap().status, JobStatus::Completed);
}

#[test]
fn gateway_port_is_recorded_once_and_cleaned_once() {
    let store = support::temp_store("store-gateway");
    let job = key("9", ClusterId::HtCondor);
    store.insert_job(&new_job("9", ClusterId::HtCondor, JobStatus::Running)).unwrap();

    assert!(store.record_gateway_port(&job, 30001).unwrap());
    assert!(!store.record_gateway_port(&job, 30002).unwrap());
    assert_eq!(store.get_job(&job).unwrap().iptable_status, 30001);

    assert!(store.mark_gateway_cleaned(&job).unwrap());
    assert!(!store.mark_gateway_cleaned(&job).unwrap());
    let record = store.get_job(&job).unwrap();
    assert_eq!(record.iptable_status, 0);
    assert!(record.iptable_clean);

    assert!(!store.record_gateway_port(&job, 30003).unwrap());
    assert_eq!(
        store.record_gateway_port(&job, 0).unwrap_err().kind,
        CoreErrorKind::InvalidInput
    );
}

#[test]
fn times_and_connect_sign_round_trip() {
    let store = support::temp_store("store-times");
    let job = key("10", ClusterId::Slurm);
    store.insert_job(&new_job("10", ClusterId::Slurm, JobStatus::Running)).unwrap();

    store.set_connect_sign(&job, true).unwrap();
    store.set_start_time(&job, at(1_700_000_000)).unwrap();
    assert!(store.set_end_time_if_missing(&job, at(1_700_000_600)).unwrap());
    assert!(!store.set_end_time_if_missing(&job, at(1_700_009_999)).unwrap());

    let record = store.get_job(&job).unwrap();
    assert!(record.connect_sign);
    assert_eq!(record.start_time, Some(at(1_700_000_000)));
    assert_eq!(record.end_time, Some(at(1_700_000_600)));

    store.set_end_time(&job, at(1_700_001_000)).unwrap();
    assert_eq!(store.get_job(&job).unwrap().end_time, Some(at(1_700_001_000)));
}

#[test]
fn administrative_listings_filter_by_cluster_and_state() {
    let store = support::temp_store("store-listings");
    store.insert_job(&new_job("1", ClusterId::HtCondor, JobStatus::Queueing)).unwrap();
    store.insert_job(&new_job("2", ClusterId::HtCondor, JobStatus::Running)).unwrap();
    store.insert_job(&new_job("3", ClusterId::HtCondor, JobStatus::Completed)).unwrap();
    store.insert_job(&new_job("4", ClusterId::Slurm, JobStatus::Running)).unwrap();

    let both_times = key("3", ClusterId::HtCondor);
    store.set_start_time(&both_times, at(100)).unwrap();
    store.set_end_time(&both_times, at(200)).unwrap();

    let ids = |records: Vec<ink_core::models::JobRecord>| {
        records.into_iter().map(|r| r.job_id).collect::<Vec<_>>()
    };
    assert_eq!(ids(store.list_unfinished_jobs(ClusterId::HtCondor).unwrap()), ["1", "2"]);
    assert_eq!(ids(store.list_completed_jobs(ClusterId::HtCondor).unwrap()), ["3"]);
    assert_eq!(ids(store.list_jobs_with_null_times(ClusterId::HtCondor).unwrap()), ["1", "2"]);
    assert_eq!(ids(store.list_user_jobs(support::UID, ClusterId::Slurm).unwrap()), ["4"]);
}

#[test]
fn bulk_delete_only_touches_the_named_cluster() {
    let store = support::temp_store("store-delete");
    for id in ["1", "2", "3"] {
        store.insert_job(&new_job(id, ClusterId::Slurm, JobStatus::Completed)).unwrap();
    }
    store.insert_job(&new_job("1", ClusterId::HtCondor, JobStatus::Completed)).unwrap();

    let deleted = store
        .delete_jobs(ClusterId::Slurm, &["1".to_string(), "3".to_string(), "99".to_string()])
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.delete_jobs(ClusterId::Slurm, &[]).unwrap(), 0);

    assert!(store.find_job(&key("2", ClusterId::Slurm)).unwrap().is_some());
    assert!(store.find_job(&key("1", ClusterId::HtCondor)).unwrap().is_some());
}

#[test]
fn job_paths_return_recorded_templates() {
    let store = support::temp_store("store-paths");
    store.insert_job(&new_job("11", ClusterId::Slurm, JobStatus::Submitted)).unwrap();

    let paths = store.job_paths(&key("11", ClusterId::Slurm)).unwrap().unwrap();
    assert_eq!(paths.outpath, "/home/alice/.ink/Jobs/common-1/11.out");
    assert_eq!(paths.job_path, "/home/alice/.ink/Jobs/common-1");
}
