use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::CoreConfig;
use crate::models::{
    CoreError, CoreErrorKind, Feeds, Initiator, InitiatorParams, InitiatorType, JobRun, JobRunId,
    JobSpec, JobSpecId, Payment, RunStatus, TaskParams, TaskRun, TaskRunError, TaskRunId, TaskSpec,
    TaskType, TriggerEvent,
};
use crate::persistence::{
    JobSpecStore, MigrationStore, PersistenceResult, RunCreation, RunStore, finished_record_error,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "relay_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Feeds live in their own column; the params JSON is stored without them.
const FEEDS_PARAM: &str = "feeds";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// Store at `config.database_path`, migrated to the latest schema.
    pub fn from_config(config: &CoreConfig) -> PersistenceResult<Self> {
        let database_path = config.database_path.clone().ok_or_else(|| {
            CoreError::invalid_input("no database path is configured for the sqlite store")
        })?;
        let store = Self::new(database_path);
        store.migrate_to_latest()?;
        Ok(store)
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
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if !(0..=current_schema_version()).contains(&target_version) {
            return Err(storage_error_text(
                "apply_migration",
                format!(
                    "cannot migrate to version {target_version}; known versions are 0..={}",
                    current_schema_version()
                ),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let recorded = read_current_version(connection)?;

            let (versions, step): (Vec<i64>, MigrationStep) = if target_version >= recorded {
                ((recorded + 1..=target_version).collect(), MigrationStep::Up)
            } else {
                ((target_version + 1..=recorded).rev().collect(), MigrationStep::Down)
            };

            if versions.is_empty() {
                // Already at the target; recreate anything dropped out of band.
                for version in 1..=target_version {
                    run_ddl(connection, defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            for version in versions {
                run_migration_step(connection, defined_migration(version)?, step)?;
            }
            Ok(())
        })
    }
}

impl JobSpecStore for SqliteStore {
    fn create_job_spec(&self, spec: &JobSpec) -> PersistenceResult<()> {
        self.with_connection("create_job_spec", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = begin_write(connection)?;
            transaction.execute(
                "
INSERT INTO job_specs (id, created_at, start_at, end_at, min_payment, archived_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
",
                params![
                    spec.id.to_string(),
                    timestamp_to_sql(spec.created_at),
                    spec.start_at.map(timestamp_to_sql),
                    spec.end_at.map(timestamp_to_sql),
                    spec.min_payment.map(|payment| payment.to_string()),
                    spec.archived_at.map(timestamp_to_sql),
                ],
            )?;
            for (position, initiator) in spec.initiators.iter().enumerate() {
                insert_initiator(&transaction, initiator, to_i64(position)?)?;
            }
            for task in &spec.tasks {
                insert_task_spec(&transaction, task)?;
            }
            transaction.commit()?;
            Ok(())
        })
    }

    fn find_job_spec(&self, id: JobSpecId) -> PersistenceResult<Option<JobSpec>> {
        self.with_connection("find_job_spec", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = begin_read(connection)?;
            let spec = load_job_spec(&transaction, &id.to_string())?;
            transaction.commit()?;
            Ok(spec)
        })
    }

    fn list_job_specs(&self, include_archived: bool) -> PersistenceResult<Vec<JobSpec>> {
        self.with_connection("list_job_specs", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = begin_read(connection)?;
            let ids: Vec<String> = {
                let mut statement = transaction.prepare(
                    "
SELECT id
FROM job_specs
WHERE ?1 OR archived_at IS NULL
ORDER BY created_at, rowid
",
                )?;
                let rows = statement.query_map(params![include_archived], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut specs = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(spec) = load_job_spec(&transaction, &id)? {
                    specs.push(spec);
                }
            }
            transaction.commit()?;
            Ok(specs)
        })
    }

    fn archive_job_spec(
        &self,
        id: JobSpecId,
        archived_at: DateTime<Utc>,
    ) -> PersistenceResult<()> {
        let updated = self.with_connection("archive_job_spec", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "UPDATE job_specs SET archived_at = COALESCE(archived_at, ?2) WHERE id = ?1",
                params![id.to_string(), timestamp_to_sql(archived_at)],
            )
        })?;

        if updated == 0 {
            return Err(missing_job_spec(id));
        }
        Ok(())
    }
}

enum RunInsert {
    Created,
    Existing(JobRun),
    MissingSpec,
}

enum RunWrite {
    Written,
    NotPending,
    MissingRun,
    MissingTask(TaskRunId),
    Finished {
        record: String,
        stored: RunStatus,
        next: RunStatus,
    },
}

impl RunWrite {
    fn into_result(self, job_run_id: JobRunId) -> PersistenceResult<bool> {
        match self {
            Self::Written => Ok(true),
            Self::NotPending => Ok(false),
            Self::MissingRun => Err(missing_job_run(job_run_id)),
            Self::MissingTask(task_run_id) => Err(CoreError::not_found(format!(
                "task run '{task_run_id}' is not part of job run '{job_run_id}'"
            ))
            .with_job_run(job_run_id)),
            Self::Finished {
                record,
                stored,
                next,
            } => Err(finished_record_error(job_run_id, &record, stored, next)),
        }
    }
}

impl RunStore for SqliteStore {
    fn create_job_run(&self, run: &JobRun) -> PersistenceResult<RunCreation> {
        let outcome = self.with_connection("create_job_run", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = begin_write(connection)?;
            let job_spec_id = run.job_spec_id.to_string();

            let spec_exists = transaction
                .query_row("SELECT 1 FROM job_specs WHERE id = ?1", [&job_spec_id], |_| {
                    Ok(())
                })
                .optional()?
                .is_some();
            if !spec_exists {
                return Ok(RunInsert::MissingSpec);
            }

            let existing: Option<String> = transaction
                .query_row(
                    "SELECT id FROM job_runs WHERE job_spec_id = ?1 AND trigger_key = ?2",
                    params![job_spec_id, run.trigger.key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing_id) = existing {
                let existing = load_job_run(&transaction, &existing_id)?.ok_or_else(|| {
                    storage_error_sqlite("job run disappeared while reading it back")
                })?;
                return Ok(RunInsert::Existing(existing));
            }

            insert_job_run(&transaction, run)?;
            transaction.commit()?;
            Ok(RunInsert::Created)
        })?;

        match outcome {
            RunInsert::Created => Ok(RunCreation::Created(run.clone())),
            RunInsert::Existing(existing) => Ok(RunCreation::Existing(existing)),
            RunInsert::MissingSpec => Err(missing_job_spec(run.job_spec_id).with_job_run(run.id)),
        }
    }

    fn find_job_run(&self, id: JobRunId) -> PersistenceResult<Option<JobRun>> {
        self.with_connection("find_job_run", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = begin_read(connection)?;
            let run = load_job_run(&transaction, &id.to_string())?;
            transaction.commit()?;
            Ok(run)
        })
    }

    fn list_job_runs(&self, job_spec_id: JobSpecId) -> PersistenceResult<Vec<JobRun>> {
        self.with_connection("list_job_runs", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = begin_read(connection)?;
            let ids: Vec<String> = {
                let mut statement = transaction.prepare(
                    "
SELECT id
FROM job_runs
WHERE job_spec_id = ?1
ORDER BY created_at, rowid
",
                )?;
                let rows =
                    statement.query_map([job_spec_id.to_string()], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut runs = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(run) = load_job_run(&transaction, &id)? {
                    runs.push(run);
                }
            }
            transaction.commit()?;
            Ok(runs)
        })
    }

    fn claim_job_run(&self, run: &JobRun) -> PersistenceResult<bool> {
        let outcome = self.with_connection("claim_job_run", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = begin_write(connection)?;
            let claimed = transaction.execute(
                "
UPDATE job_runs
SET status = ?2, updated_at = ?3
WHERE id = ?1 AND status = 'pending'
",
                params![
                    run.id.to_string(),
                    run.status.as_str(),
                    timestamp_to_sql(run.updated_at),
                ],
            )?;
            if claimed == 0 {
                return Ok(match stored_run_status(&transaction, run.id)? {
                    Some(_) => RunWrite::NotPending,
                    None => RunWrite::MissingRun,
                });
            }

            for task_run in &run.task_runs {
                if write_task_run(&transaction, task_run)? == 0 {
                    return Ok(RunWrite::MissingTask(task_run.id));
                }
            }
            transaction.commit()?;
            Ok(RunWrite::Written)
        })?;

        outcome.into_result(run.id)
    }

    fn update_job_run(&self, run: &JobRun) -> PersistenceResult<()> {
        let outcome = self.with_connection("update_job_run", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = begin_write(connection)?;
            let Some(stored) = stored_run_status(&transaction, run.id)? else {
                return Ok(RunWrite::MissingRun);
            };
            if !stored.accepts_write_of(run.status) {
                return Ok(RunWrite::Finished {
                    record: format!("job run '{}'", run.id),
                    stored,
                    next: run.status,
                });
            }

            let (error_kind, error_message) = split_run_error(run.error.as_ref());
            transaction.execute(
                "
UPDATE job_runs
SET status = ?2, result = ?3, error_kind = ?4, error_message = ?5, updated_at = ?6,
    finished_at = ?7
WHERE id = ?1
",
                params![
                    run.id.to_string(),
                    run.status.as_str(),
                    json_to_sql(run.result.as_ref()),
                    error_kind,
                    error_message,
                    timestamp_to_sql(run.updated_at),
                    run.finished_at.map(timestamp_to_sql),
                ],
            )?;

            for task_run in &run.task_runs {
                let outcome = guarded_task_write(&transaction, task_run)?;
                if !matches!(outcome, RunWrite::Written) {
                    return Ok(outcome);
                }
            }
            transaction.commit()?;
            Ok(RunWrite::Written)
        })?;

        outcome.into_result(run.id).map(|_| ())
    }

    fn update_task_run(&self, task_run: &TaskRun) -> PersistenceResult<()> {
        let outcome = self.with_connection("update_task_run", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = begin_write(connection)?;
            let outcome = guarded_task_write(&transaction, task_run)?;
            if matches!(outcome, RunWrite::Written) {
                transaction.commit()?;
            }
            Ok(outcome)
        })?;

        outcome.into_result(task_run.job_run_id).map(|_| ())
    }
}

fn stored_run_status(
    transaction: &Transaction<'_>,
    id: JobRunId,
) -> rusqlite::Result<Option<RunStatus>> {
    let status: Option<String> = transaction
        .query_row(
            "SELECT status FROM job_runs WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    status.as_deref().map(parse_run_status).transpose()
}

/// Rewrites one task run unless its stored row has already finished with a
/// different status.
fn guarded_task_write(
    transaction: &Transaction<'_>,
    task_run: &TaskRun,
) -> rusqlite::Result<RunWrite> {
    let stored: Option<String> = transaction
        .query_row(
            "SELECT status FROM task_runs WHERE id = ?1 AND job_run_id = ?2",
            params![task_run.id.to_string(), task_run.job_run_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(stored) = stored.as_deref().map(parse_run_status).transpose()? else {
        return Ok(RunWrite::MissingTask(task_run.id));
    };
    if !stored.accepts_write_of(task_run.status) {
        return Ok(RunWrite::Finished {
            record: format!("task run '{}'", task_run.id),
            stored,
            next: task_run.status,
        });
    }
    write_task_run(transaction, task_run)?;
    Ok(RunWrite::Written)
}

fn insert_initiator(
    transaction: &Transaction<'_>,
    initiator: &Initiator,
    position: i64,
) -> rusqlite::Result<()> {
    let (params_json, feeds) = split_initiator_params(&initiator.params)?;
    transaction.execute(
        "
INSERT INTO initiators (id, job_spec_id, position, initiator_type, params, feeds)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
",
        params![
            initiator.id.to_string(),
            initiator.job_spec_id.to_string(),
            position,
            initiator.kind().as_str(),
            params_json,
            feeds,
        ],
    )?;
    Ok(())
}

fn insert_task_spec(transaction: &Transaction<'_>, task: &TaskSpec) -> rusqlite::Result<()> {
    transaction.execute(
        "
INSERT INTO task_specs (id, job_spec_id, position, task_type, params)
VALUES (?1, ?2, ?3, ?4, ?5)
",
        params![
            task.id.to_string(),
            task.job_spec_id.to_string(),
            i64::from(task.position),
            task.task_type.as_str(),
            task.params.to_json_string(),
        ],
    )?;
    Ok(())
}

fn insert_job_run(transaction: &Transaction<'_>, run: &JobRun) -> rusqlite::Result<()> {
    let (error_kind, error_message) = split_run_error(run.error.as_ref());
    transaction.execute(
        "
INSERT INTO job_runs (
    id, job_spec_id, trigger_key, fired_at, initiator, status, result, error_kind,
    error_message, created_at, updated_at, finished_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
",
        params![
            run.id.to_string(),
            run.job_spec_id.to_string(),
            run.trigger.key,
            timestamp_to_sql(run.trigger.fired_at),
            to_json_text(&run.initiator)?,
            run.status.as_str(),
            json_to_sql(run.result.as_ref()),
            error_kind,
            error_message,
            timestamp_to_sql(run.created_at),
            timestamp_to_sql(run.updated_at),
            run.finished_at.map(timestamp_to_sql),
        ],
    )?;

    for (position, task_run) in run.task_runs.iter().enumerate() {
        let (error_kind, error_message) = split_run_error(task_run.error.as_ref());
        transaction.execute(
            "
INSERT INTO task_runs (
    id, job_run_id, position, task_spec_id, task_spec, status, result, error_kind,
    error_message, started_at, finished_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
",
            params![
                task_run.id.to_string(),
                task_run.job_run_id.to_string(),
                to_i64(position)?,
                task_run.task_spec.id.to_string(),
                to_json_text(&task_run.task_spec)?,
                task_run.status.as_str(),
                json_to_sql(task_run.result.as_ref()),
                error_kind,
                error_message,
                task_run.started_at.map(timestamp_to_sql),
                task_run.finished_at.map(timestamp_to_sql),
            ],
        )?;
    }
    Ok(())
}

/// Writes the mutable columns of one task run; returns the affected row count.
fn write_task_run(connection: &Connection, task_run: &TaskRun) -> rusqlite::Result<usize> {
    let (error_kind, error_message) = split_run_error(task_run.error.as_ref());
    connection.execute(
        "
UPDATE task_runs
SET status = ?3, result = ?4, error_kind = ?5, error_message = ?6, started_at = ?7,
    finished_at = ?8
WHERE id = ?1 AND job_run_id = ?2
",
        params![
            task_run.id.to_string(),
            task_run.job_run_id.to_string(),
            task_run.status.as_str(),
            json_to_sql(task_run.result.as_ref()),
            error_kind,
            error_message,
            task_run.started_at.map(timestamp_to_sql),
            task_run.finished_at.map(timestamp_to_sql),
        ],
    )
}

fn load_job_spec(connection: &Connection, id: &str) -> rusqlite::Result<Option<JobSpec>> {
    let spec = connection
        .query_row(
            "
SELECT id, created_at, start_at, end_at, min_payment, archived_at
FROM job_specs
WHERE id = ?1
",
            [id],
            |row| {
                let id_raw: String = row.get(0)?;
                let created_at: String = row.get(1)?;
                let start_at: Option<String> = row.get(2)?;
                let end_at: Option<String> = row.get(3)?;
                let min_payment: Option<String> = row.get(4)?;
                let archived_at: Option<String> = row.get(5)?;

                Ok(JobSpec {
                    id: parse_id(&id_raw)?,
                    created_at: parse_timestamp(&created_at)?,
                    start_at: parse_optional_timestamp(start_at)?,
                    end_at: parse_optional_timestamp(end_at)?,
                    min_payment: min_payment.as_deref().map(parse_payment).transpose()?,
                    initiators: Vec::new(),
                    tasks: Vec::new(),
                    archived_at: parse_optional_timestamp(archived_at)?,
                })
            },
        )
        .optional()?;

    let Some(mut spec) = spec else {
        return Ok(None);
    };
    spec.initiators = load_initiators(connection, id)?;
    spec.tasks = load_task_specs(connection, id)?;
    Ok(Some(spec))
}

fn load_initiators(connection: &Connection, job_spec_id: &str) -> rusqlite::Result<Vec<Initiator>> {
    let mut statement = connection.prepare(
        "
SELECT id, job_spec_id, initiator_type, params, feeds
FROM initiators
WHERE job_spec_id = ?1
ORDER BY position
",
    )?;
    let rows = statement.query_map([job_spec_id], |row| {
        let id_raw: String = row.get(0)?;
        let job_spec_raw: String = row.get(1)?;
        let kind_raw: String = row.get(2)?;
        let params_raw: String = row.get(3)?;
        let feeds: Feeds = row.get(4)?;

        let kind = parse_initiator_type(&kind_raw)?;
        Ok(Initiator {
            id: parse_id(&id_raw)?,
            job_spec_id: parse_id(&job_spec_raw)?,
            params: join_initiator_params(kind, &params_raw, feeds)?,
        })
    })?;

    rows.collect()
}

fn load_task_specs(connection: &Connection, job_spec_id: &str) -> rusqlite::Result<Vec<TaskSpec>> {
    let mut statement = connection.prepare(
        "
SELECT id, job_spec_id, position, task_type, params
FROM task_specs
WHERE job_spec_id = ?1
ORDER BY position
",
    )?;
    let rows = statement.query_map([job_spec_id], |row| {
        let id_raw: String = row.get(0)?;
        let job_spec_raw: String = row.get(1)?;
        let position: i64 = row.get(2)?;
        let task_type_raw: String = row.get(3)?;
        let params_raw: String = row.get(4)?;

        Ok(TaskSpec {
            id: parse_id(&id_raw)?,
            job_spec_id: parse_id(&job_spec_raw)?,
            position: u32::try_from(position)
                .map_err(|_| storage_error_sqlite("task position out of range in sqlite record"))?,
            task_type: TaskType::new(&task_type_raw).map_err(core_error_sqlite)?,
            params: TaskParams::from_json_str(&params_raw).map_err(core_error_sqlite)?,
        })
    })?;

    rows.collect()
}

fn load_job_run(connection: &Connection, id: &str) -> rusqlite::Result<Option<JobRun>> {
    let run = connection
        .query_row(
            "
SELECT id, job_spec_id, trigger_key, fired_at, initiator, status, result, error_kind,
       error_message, created_at, updated_at, finished_at
FROM job_runs
WHERE id = ?1
",
            [id],
            |row| {
                let id_raw: String = row.get(0)?;
                let job_spec_raw: String = row.get(1)?;
                let trigger_key: String = row.get(2)?;
                let fired_at: String = row.get(3)?;
                let initiator_raw: String = row.get(4)?;
                let status_raw: String = row.get(5)?;
                let result: Option<String> = row.get(6)?;
                let error_kind: Option<String> = row.get(7)?;
                let error_message: Option<String> = row.get(8)?;
                let created_at: String = row.get(9)?;
                let updated_at: String = row.get(10)?;
                let finished_at: Option<String> = row.get(11)?;

                Ok(JobRun {
                    id: parse_id(&id_raw)?,
                    job_spec_id: parse_id(&job_spec_raw)?,
                    trigger: TriggerEvent::new(trigger_key, parse_timestamp(&fired_at)?),
                    initiator: parse_json_text(&initiator_raw, "initiator snapshot")?,
                    status: parse_run_status(&status_raw)?,
                    task_runs: Vec::new(),
                    result: parse_optional_json(result)?,
                    error: join_run_error(error_kind, error_message)?,
                    created_at: parse_timestamp(&created_at)?,
                    updated_at: parse_timestamp(&updated_at)?,
                    finished_at: parse_optional_timestamp(finished_at)?,
                })
            },
        )
        .optional()?;

    let Some(mut run) = run else {
        return Ok(None);
    };
    run.task_runs = load_task_runs(connection, id)?;
    Ok(Some(run))
}

fn load_task_runs(connection: &Connection, job_run_id: &str) -> rusqlite::Result<Vec<TaskRun>> {
    let mut statement = connection.prepare(
        "
SELECT id, job_run_id, task_spec, status, result, error_kind, error_message, started_at,
       finished_at
FROM task_runs
WHERE job_run_id = ?1
ORDER BY position
",
    )?;
    let rows = statement.query_map([job_run_id], |row| {
        let id_raw: String = row.get(0)?;
        let job_run_raw: String = row.get(1)?;
        let task_spec_raw: String = row.get(2)?;
        let status_raw: String = row.get(3)?;
        let result: Option<String> = row.get(4)?;
        let error_kind: Option<String> = row.get(5)?;
        let error_message: Option<String> = row.get(6)?;
        let started_at: Option<String> = row.get(7)?;
        let finished_at: Option<String> = row.get(8)?;

        Ok(TaskRun {
            id: parse_id(&id_raw)?,
            job_run_id: parse_id(&job_run_raw)?,
            task_spec: parse_json_text(&task_spec_raw, "task spec snapshot")?,
            status: parse_run_status(&status_raw)?,
            result: parse_optional_json(result)?,
            error: join_run_error(error_kind, error_message)?,
            started_at: parse_optional_timestamp(started_at)?,
            finished_at: parse_optional_timestamp(finished_at)?,
        })
    })?;

    rows.collect()
}

fn split_initiator_params(params: &InitiatorParams) -> rusqlite::Result<(String, Feeds)> {
    let mut value = params.params_value().map_err(core_error_sqlite)?;
    let feeds = match params {
        InitiatorParams::FluxMonitor(flux) => {
            if let Value::Object(map) = &mut value {
                map.remove(FEEDS_PARAM);
            }
            flux.feeds.clone()
        }
        _ => Feeds::empty(),
    };
    Ok((value.to_string(), feeds))
}

fn join_initiator_params(
    kind: InitiatorType,
    params_raw: &str,
    feeds: Feeds,
) -> rusqlite::Result<InitiatorParams> {
    let mut value: Value = parse_json_text(params_raw, "initiator params")?;
    if kind == InitiatorType::FluxMonitor
        && let Value::Object(map) = &mut value
    {
        map.insert(FEEDS_PARAM.to_string(), Value::from(feeds.into_inner()));
    }
    InitiatorParams::from_parts(kind, value).map_err(core_error_sqlite)
}

fn split_run_error(error: Option<&TaskRunError>) -> (Option<&'static str>, Option<&str>) {
    match error {
        Some(error) => (Some(error.kind.as_str()), Some(error.message.as_str())),
        None => (None, None),
    }
}

fn join_run_error(
    kind: Option<String>,
    message: Option<String>,
) -> rusqlite::Result<Option<TaskRunError>> {
    let Some(kind) = kind else {
        return Ok(None);
    };
    let kind = CoreErrorKind::from_str(&kind).map_err(core_error_sqlite)?;
    Ok(Some(TaskRunError::new(kind, message.unwrap_or_default())))
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.pragma_update(None, "foreign_keys", true)?;
    Ok(connection)
}

/// Writers take the lock up front so concurrent writers queue on the busy
/// timeout instead of failing on a read-to-write upgrade.
fn begin_write(connection: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    connection.transaction_with_behavior(TransactionBehavior::Immediate)
}

/// Multi-statement loads read one snapshot.
fn begin_read(connection: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    connection.transaction_with_behavior(TransactionBehavior::Deferred)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
"
    ))
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    if read_current_version(connection)? == 0 {
        return Err(storage_error_sqlite(
            "relay schema has not been migrated; run migrations before using the store",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection
        .query_row(
            &format!("SELECT MAX(version) FROM {MIGRATIONS_TABLE}"),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map(Option::unwrap_or_default)
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

#[derive(Clone, Copy)]
enum MigrationStep {
    Up,
    Down,
}

/// Runs one migration and records it in the same transaction.
fn run_migration_step(
    connection: &mut Connection,
    migration: &SqliteMigration,
    step: MigrationStep,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    match step {
        MigrationStep::Up => {
            run_ddl(&transaction, migration.up_sql)?;
            transaction.execute(
                &format!(
                    "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at) VALUES (?1, ?2, ?3)"
                ),
                params![migration.version, migration.name, timestamp_to_sql(Utc::now())],
            )?;
        }
        MigrationStep::Down => {
            transaction.execute_batch(migration.down_sql)?;
            transaction.execute(
                &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
                [migration.version],
            )?;
        }
    }
    transaction.commit()
}

/// `ADD COLUMN` has no `IF NOT EXISTS`; a column that is already there
/// counts as applied.
fn run_ddl(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    connection.execute_batch(sql).or_else(|error| {
        if error.to_string().contains("duplicate column name") {
            Ok(())
        } else {
            Err(error)
        }
    })
}

fn timestamp_to_sql(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| {
            storage_error_sqlite(&format!(
                "invalid timestamp '{raw}' in sqlite record: {error}"
            ))
        })
}

fn parse_optional_timestamp(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

fn parse_payment(raw: &str) -> rusqlite::Result<Payment> {
    raw.parse::<Payment>().map_err(core_error_sqlite)
}

fn parse_id<T>(raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = CoreError>,
{
    raw.parse::<T>().map_err(core_error_sqlite)
}

fn parse_initiator_type(raw: &str) -> rusqlite::Result<InitiatorType> {
    raw.parse::<InitiatorType>().map_err(|_| {
        storage_error_sqlite(&format!("unknown initiator type '{raw}' in sqlite record"))
    })
}

fn parse_run_status(raw: &str) -> rusqlite::Result<RunStatus> {
    raw.parse::<RunStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown run status '{raw}' in sqlite record"))
    })
}

fn json_to_sql(value: Option<&Value>) -> Option<String> {
    value.map(Value::to_string)
}

fn to_json_text<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))
}

fn parse_json_text<T: DeserializeOwned>(raw: &str, what: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("invalid {what} in sqlite record: {error}"))
    })
}

fn parse_optional_json(raw: Option<String>) -> rusqlite::Result<Option<Value>> {
    raw.as_deref()
        .map(|raw| parse_json_text(raw, "result"))
        .transpose()
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn missing_job_spec(id: JobSpecId) -> CoreError {
    CoreError::not_found(format!("job spec '{id}' does not exist")).with_job_spec(id)
}

fn missing_job_run(id: JobRunId) -> CoreError {
    CoreError::not_found(format!("job run '{id}' does not exist")).with_job_run(id)
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn core_error_sqlite(error: CoreError) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(error))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::storage(format!(
        "sqlite store '{operation}' failed: {}",
        message.as_ref()
    ))
}
