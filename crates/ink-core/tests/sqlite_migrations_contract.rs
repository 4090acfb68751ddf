mod support;

use ink_core::models::CoreErrorKind;
use ink_core::persistence::{JobStore, MigrationStore};
use ink_core::sqlite::{SqliteStore, current_schema_version, migration, migrations};

#[test]
fn migration_versions_are_strictly_increasing() {
    let entries = migrations();
    assert!(!entries.is_empty());

    let mut previous = 0;
    for entry in entries {
        assert!(entry.version > previous);
        previous = entry.version;
    }
}

#[test]
fn migration_lookup_and_schema_version_are_consistent() {
    let latest = current_schema_version();
    let latest_entry = migration(latest).expect("latest migration must exist");
    assert_eq!(latest_entry.version, latest);
}

#[test]
fn migration_sql_is_defined_for_up_and_down_paths() {
    for entry in migrations() {
        assert!(!entry.up_sql.trim().is_empty(), "up sql must not be empty");
        assert!(
            !entry.down_sql.trim().is_empty(),
            "down sql must not be empty"
        );
    }
}

#[test]
fn first_migration_creates_the_job_info_table() {
    let first = migration(1).expect("first migration must exist");
    assert!(first.up_sql.contains("CREATE TABLE IF NOT EXISTS job_info"));
    assert!(first.up_sql.contains("UNIQUE (jobid, clusterid)"));
    assert!(first.up_sql.contains("DEFAULT 'SUBMITTED'"));
}

#[test]
fn migrating_up_and_down_tracks_the_recorded_version() {
    let store = support::temp_store("migrate-up-down");
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);

    store.migrate_to_latest().unwrap();
    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
}

#[test]
fn undefined_target_version_is_a_storage_failure() {
    let store = support::temp_store("migrate-undefined");
    let error = store
        .apply_migration(current_schema_version() + 1)
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
}

#[test]
fn job_operations_require_an_initialized_schema() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("empty.sqlite3"));

    let error = store
        .list_completed_jobs(ink_core::models::ClusterId::Slurm)
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    assert!(error.message.contains("not initialized"), "{}", error.message);
}
