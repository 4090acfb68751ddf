use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, ToSql, params, params_from_iter};

use crate::models::{
    ClusterId, CoreError, CoreErrorKind, JobKey, JobOperation, JobRecord, JobStatus, NewJobRecord,
    StatusUpdate, Uid,
};
use crate::persistence::{JobPaths, JobStore, MigrationStore, PersistenceResult};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "ink_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, uid, jobid, outpath, errpath, job_type, job_path, clusterid, \
job_status, iptable_clean, iptable_status, connect_sign, job_start_time, job_end_time";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }

    fn update_field(
        &self,
        operation_name: &str,
        key: &JobKey,
        assignment: &str,
        value: impl rusqlite::ToSql,
    ) -> PersistenceResult<()> {
        let changed = self.with_connection(operation_name, |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                &format!(
                    "UPDATE job_info SET {assignment} = ?1 WHERE uid = ?2 AND jobid = ?3 AND clusterid = ?4"
                ),
                params![value, key.uid, key.job_id, key.cluster.as_str()],
            )
        })?;
        if changed == 0 {
            return Err(not_found(key));
        }
        Ok(())
    }

    fn update_time_if_missing(
        &self,
        operation: &str,
        key: &JobKey,
        column: &str,
        value: SystemTime,
    ) -> PersistenceResult<bool> {
        let sql = format!(
            "UPDATE job_info SET {column} = ?1 \
             WHERE uid = ?2 AND jobid = ?3 AND clusterid = ?4 AND {column} IS NULL"
        );
        let changed = self.with_connection(operation, |connection| {
            ensure_schema_ready(connection)?;
            let seconds = to_unix_seconds(value)?;
            connection.execute(&sql, params![seconds, key.uid, key.job_id, key.cluster.as_str()])
        })?;
        Ok(changed > 0)
    }

    fn list_where(
        &self,
        operation_name: &str,
        condition: &str,
        cluster: ClusterId,
    ) -> PersistenceResult<Vec<JobRecord>> {
        self.with_connection(operation_name, |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM job_info WHERE clusterid = ?1 AND ({condition}) ORDER BY id"
            ))?;
            let rows = statement.query_map([cluster.as_str()], job_from_row)?;
            rows.collect()
        })
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Recorded versions with missing tables are repaired by replaying the DDL.
                for version in 1..=target_version {
                    execute_batch_tolerant(connection, defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl JobStore for SqliteStore {
    fn insert_job(&self, job: &NewJobRecord) -> PersistenceResult<bool> {
        let inserted = self.with_connection("insert_job", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO job_info (
    uid, jobid, outpath, errpath, job_type, job_path, clusterid, job_status, created_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, strftime('%s', 'now'))
ON CONFLICT(jobid, clusterid) DO NOTHING
",
                params![
                    job.uid,
                    job.job_id,
                    job.outpath,
                    job.errpath,
                    job.job_type,
                    job.job_path,
                    job.cluster.as_str(),
                    job.status.as_str(),
                ],
            )
        })?;
        Ok(inserted > 0)
    }

    fn find_job(&self, key: &JobKey) -> PersistenceResult<Option<JobRecord>> {
        self.with_connection("find_job", |connection| {
            ensure_schema_ready(connection)?;
            select_job(connection, key)
        })
    }

    fn get_job(&self, key: &JobKey) -> PersistenceResult<JobRecord> {
        self.find_job(key)?.ok_or_else(|| not_found(key))
    }

    fn list_user_jobs(&self, uid: Uid, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>> {
        self.with_connection("list_user_jobs", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM job_info WHERE uid = ?1 AND clusterid = ?2 ORDER BY id"
            ))?;
            let rows = statement.query_map(params![uid, cluster.as_str()], job_from_row)?;
            rows.collect()
        })
    }

    fn update_status(&self, key: &JobKey, status: JobStatus) -> PersistenceResult<StatusUpdate> {
        let predecessors = JobStatus::predecessors_of(status);
        let predecessor_texts: Vec<&'static str> =
            predecessors.iter().map(|entry| entry.as_str()).collect();
        let status_text = status.as_str();
        let cluster_text = key.cluster.as_str();

        let outcome = self.with_connection("update_status", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;

            let changed = if predecessors.is_empty() {
                0
            } else {
                let placeholders = (0..predecessors.len())
                    .map(|index| format!("?{}", index + 5))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE job_info SET job_status = ?1 \
                     WHERE uid = ?2 AND jobid = ?3 AND clusterid = ?4 AND job_status IN ({placeholders})"
                );
                let mut values: Vec<&dyn ToSql> =
                    vec![&status_text, &key.uid, &key.job_id, &cluster_text];
                values.extend(predecessor_texts.iter().map(|entry| entry as &dyn ToSql));
                transaction.execute(&sql, params_from_iter(values))?
            };

            let outcome = if changed > 0 {
                Some(StatusUpdate::Applied)
            } else {
                let stored: Option<String> = transaction
                    .query_row(
                        "SELECT job_status FROM job_info WHERE uid = ?1 AND jobid = ?2 AND clusterid = ?3",
                        params![key.uid, key.job_id, key.cluster.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                match stored {
                    None => None,
                    Some(raw) => {
                        let stored = parse_status(&raw)?;
                        if stored == status {
                            Some(StatusUpdate::Unchanged)
                        } else {
                            Some(StatusUpdate::Rejected { stored })
                        }
                    }
                }
            };

            transaction.commit()?;
            Ok(outcome)
        })?;

        outcome.ok_or_else(|| not_found(key))
    }

    fn set_connect_sign(&self, key: &JobKey, connected: bool) -> PersistenceResult<()> {
        self.update_field(
            "set_connect_sign",
            key,
            "connect_sign",
            connect_sign_to_str(connected),
        )
    }

    fn set_start_time(&self, key: &JobKey, start: SystemTime) -> PersistenceResult<()> {
        let seconds = to_unix_seconds(start).map_err(|error| storage_error("set_start_time", error))?;
        self.update_field("set_start_time", key, "job_start_time", seconds)
    }

    fn set_end_time(&self, key: &JobKey, end: SystemTime) -> PersistenceResult<()> {
        let seconds = to_unix_seconds(end).map_err(|error| storage_error("set_end_time", error))?;
        self.update_field("set_end_time", key, "job_end_time", seconds)
    }

    fn set_start_time_if_missing(&self, key: &JobKey, start: SystemTime) -> PersistenceResult<bool> {
        self.update_time_if_missing("set_start_time_if_missing", key, "job_start_time", start)
    }

    fn set_end_time_if_missing(&self, key: &JobKey, end: SystemTime) -> PersistenceResult<bool> {
        self.update_time_if_missing("set_end_time_if_missing", key, "job_end_time", end)
    }

    fn record_gateway_port(&self, key: &JobKey, port: u32) -> PersistenceResult<bool> {
        if port == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "gateway port must be non-zero",
            )
            .with_operation(JobOperation::Store));
        }
        let changed = self.with_connection("record_gateway_port", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "UPDATE job_info SET iptable_status = ?1 \
                 WHERE uid = ?2 AND jobid = ?3 AND clusterid = ?4 \
                 AND iptable_status = 0 AND iptable_clean = 0",
                params![port, key.uid, key.job_id, key.cluster.as_str()],
            )
        })?;
        Ok(changed > 0)
    }

    fn mark_gateway_cleaned(&self, key: &JobKey) -> PersistenceResult<bool> {
        let changed = self.with_connection("mark_gateway_cleaned", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "UPDATE job_info SET iptable_status = 0, iptable_clean = 1 \
                 WHERE uid = ?1 AND jobid = ?2 AND clusterid = ?3 AND iptable_clean = 0",
                params![key.uid, key.job_id, key.cluster.as_str()],
            )
        })?;
        Ok(changed > 0)
    }

    fn list_unfinished_jobs(&self, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>> {
        self.list_where(
            "list_unfinished_jobs",
            "job_status NOT IN ('COMPLETED', 'CANCELED')",
            cluster,
        )
    }

    fn list_completed_jobs(&self, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>> {
        self.list_where(
            "list_completed_jobs",
            "job_status IN ('COMPLETED', 'CANCELED')",
            cluster,
        )
    }

    fn list_jobs_with_null_times(&self, cluster: ClusterId) -> PersistenceResult<Vec<JobRecord>> {
        self.list_where(
            "list_jobs_with_null_times",
            "job_start_time IS NULL OR job_end_time IS NULL",
            cluster,
        )
    }

    fn delete_jobs(&self, cluster: ClusterId, job_ids: &[String]) -> PersistenceResult<usize> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        self.with_connection("delete_jobs", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let mut deleted = 0;
            {
                let mut statement = transaction
                    .prepare("DELETE FROM job_info WHERE clusterid = ?1 AND jobid = ?2")?;
                for job_id in job_ids {
                    deleted += statement.execute(params![cluster.as_str(), job_id])?;
                }
            }
            transaction.commit()?;
            Ok(deleted)
        })
    }

    fn job_paths(&self, key: &JobKey) -> PersistenceResult<Option<JobPaths>> {
        self.with_connection("job_paths", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "SELECT outpath, errpath, job_path FROM job_info \
                     WHERE uid = ?1 AND jobid = ?2 AND clusterid = ?3",
                    params![key.uid, key.job_id, key.cluster.as_str()],
                    |row| {
                        Ok(JobPaths {
                            outpath: row.get(0)?,
                            errpath: row.get(1)?,
                            job_path: row.get(2)?,
                        })
                    },
                )
                .optional()
        })
    }
}

fn select_job(connection: &Connection, key: &JobKey) -> rusqlite::Result<Option<JobRecord>> {
    connection
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM job_info WHERE uid = ?1 AND jobid = ?2 AND clusterid = ?3"
            ),
            params![key.uid, key.job_id, key.cluster.as_str()],
            job_from_row,
        )
        .optional()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let cluster_raw: String = row.get(7)?;
    let status_raw: String = row.get(8)?;
    let clean: i64 = row.get(9)?;
    let port: i64 = row.get(10)?;
    let connect_sign: String = row.get(11)?;
    let start: Option<i64> = row.get(12)?;
    let end: Option<i64> = row.get(13)?;

    Ok(JobRecord {
        id: row.get(0)?,
        uid: row.get(1)?,
        job_id: row.get(2)?,
        outpath: row.get(3)?,
        errpath: row.get(4)?,
        job_type: row.get(5)?,
        job_path: row.get(6)?,
        cluster: parse_cluster_id(&cluster_raw)?,
        status: parse_status(&status_raw)?,
        iptable_clean: sqlite_to_bool(clean),
        iptable_status: u32::try_from(port)
            .map_err(|_| storage_error_sqlite("iptable_status is out of port range"))?,
        connect_sign: parse_connect_sign(&connect_sign),
        start_time: start.map(from_unix_seconds).transpose()?,
        end_time: end.map(from_unix_seconds).transpose()?,
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before job operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    execute_batch_tolerant(&transaction, migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

/// `ALTER TABLE ADD COLUMN` is not idempotent in SQLite; a duplicate column is tolerated.
fn execute_batch_tolerant(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    match connection.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(e),
    }
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn not_found(key: &JobKey) -> CoreError {
    CoreError::new(
        CoreErrorKind::RecordNotFound,
        format!("no job record for job '{}' on {}", key.job_id, key.cluster),
    )
    .with_operation(JobOperation::Store)
    .with_cluster(key.cluster)
    .with_uid(key.uid)
    .with_job_id(key.job_id.clone())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
    .with_operation(JobOperation::Store)
}

fn parse_cluster_id(raw: &str) -> rusqlite::Result<ClusterId> {
    raw.parse::<ClusterId>().map_err(|_| {
        storage_error_sqlite(&format!(
            "unknown cluster id '{raw}' found in persisted sqlite record"
        ))
    })
}

fn parse_status(raw: &str) -> rusqlite::Result<JobStatus> {
    raw.parse::<JobStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown job status '{raw}' in sqlite record"))
    })
}

fn connect_sign_to_str(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

fn parse_connect_sign(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("true") || raw == "1"
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    let seconds = i64::try_from(duration.as_secs())
        .map_err(|_| storage_error_sqlite("unix timestamp seconds exceed i64 range"))?;
    Ok(seconds)
}

fn from_unix_seconds(value: i64) -> rusqlite::Result<SystemTime> {
    if value < 0 {
        return Err(storage_error_sqlite(
            "negative unix timestamps are not supported",
        ));
    }
    let seconds = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("failed to convert unix timestamp to u64"))?;
    Ok(UNIX_EPOCH + Duration::from_secs(seconds))
}
