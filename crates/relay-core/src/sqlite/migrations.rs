#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_relay_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS job_specs (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    start_at TEXT,
    end_at TEXT,
    min_payment TEXT
);

CREATE TABLE IF NOT EXISTS initiators (
    id TEXT PRIMARY KEY,
    job_spec_id TEXT NOT NULL REFERENCES job_specs (id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    initiator_type TEXT NOT NULL,
    params TEXT NOT NULL,
    feeds TEXT,
    UNIQUE (job_spec_id, position)
);

CREATE TABLE IF NOT EXISTS task_specs (
    id TEXT PRIMARY KEY,
    job_spec_id TEXT NOT NULL REFERENCES job_specs (id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    task_type TEXT NOT NULL,
    params TEXT NOT NULL,
    UNIQUE (job_spec_id, position)
);

CREATE TABLE IF NOT EXISTS job_runs (
    id TEXT PRIMARY KEY,
    job_spec_id TEXT NOT NULL REFERENCES job_specs (id) ON DELETE CASCADE,
    trigger_key TEXT NOT NULL,
    fired_at TEXT NOT NULL,
    initiator TEXT NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error_kind TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_job_runs_trigger
    ON job_runs (job_spec_id, trigger_key);

CREATE INDEX IF NOT EXISTS idx_job_runs_created
    ON job_runs (job_spec_id, created_at);

CREATE TABLE IF NOT EXISTS task_runs (
    id TEXT PRIMARY KEY,
    job_run_id TEXT NOT NULL REFERENCES job_runs (id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    task_spec_id TEXT NOT NULL,
    task_spec TEXT NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error_kind TEXT,
    error_message TEXT,
    started_at TEXT,
    finished_at TEXT,
    UNIQUE (job_run_id, position)
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS task_runs;
DROP INDEX IF EXISTS idx_job_runs_created;
DROP INDEX IF EXISTS idx_job_runs_trigger;
DROP TABLE IF EXISTS job_runs;
DROP TABLE IF EXISTS task_specs;
DROP TABLE IF EXISTS initiators;
DROP TABLE IF EXISTS job_specs;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_job_spec_archival",
    up_sql: r#"
ALTER TABLE job_specs ADD COLUMN archived_at TEXT;
"#,
    down_sql: r#"
ALTER TABLE job_specs DROP COLUMN archived_at;
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
