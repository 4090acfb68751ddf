#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "create_job_info",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS job_info (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uid INTEGER NOT NULL,
    jobid TEXT NOT NULL,
    outpath TEXT NOT NULL DEFAULT '',
    errpath TEXT NOT NULL DEFAULT '',
    job_type TEXT NOT NULL DEFAULT '',
    job_path TEXT NOT NULL DEFAULT '',
    clusterid TEXT NOT NULL,
    job_status TEXT NOT NULL DEFAULT 'SUBMITTED',
    iptable_clean INTEGER NOT NULL DEFAULT 0,
    iptable_status INTEGER NOT NULL DEFAULT 0,
    connect_sign TEXT NOT NULL DEFAULT 'False',
    job_start_time INTEGER,
    job_end_time INTEGER,
    UNIQUE (jobid, clusterid)
);

CREATE INDEX IF NOT EXISTS idx_job_info_uid ON job_info (uid);
CREATE INDEX IF NOT EXISTS idx_job_info_clusterid ON job_info (clusterid);
CREATE INDEX IF NOT EXISTS idx_job_info_jobid ON job_info (jobid);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_job_info_jobid;
DROP INDEX IF EXISTS idx_job_info_clusterid;
DROP INDEX IF EXISTS idx_job_info_uid;
DROP TABLE IF EXISTS job_info;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_job_info_created_at",
    up_sql: r#"
ALTER TABLE job_info ADD COLUMN created_at_unix INTEGER NOT NULL DEFAULT 0;
"#,
    down_sql: r#"
ALTER TABLE job_info DROP COLUMN created_at_unix;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
