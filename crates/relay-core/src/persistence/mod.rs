pub mod in_memory;

pub use in_memory::InMemoryStore;

use chrono::{DateTime, Utc};

use crate::models::{
    CoreError, CoreErrorKind, JobRun, JobRunId, JobSpec, JobSpecId, RunStatus, TaskRun,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

/// Result of an idempotent run creation keyed on the trigger event.
#[derive(Clone, Debug, PartialEq)]
pub enum RunCreation {
    Created(JobRun),
    /// The same trigger event already produced this run.
    Existing(JobRun),
}

impl RunCreation {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn run(&self) -> &JobRun {
        match self {
            Self::Created(run) | Self::Existing(run) => run,
        }
    }

    pub fn into_run(self) -> JobRun {
        match self {
            Self::Created(run) | Self::Existing(run) => run,
        }
    }
}

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait JobSpecStore: Send + Sync {
    /// Writes the spec with its initiators and tasks, all or nothing.
    fn create_job_spec(&self, spec: &JobSpec) -> PersistenceResult<()>;

    fn find_job_spec(&self, id: JobSpecId) -> PersistenceResult<Option<JobSpec>>;

    fn list_job_specs(&self, include_archived: bool) -> PersistenceResult<Vec<JobSpec>>;

    /// Soft delete. Archiving an archived spec keeps the first timestamp.
    fn archive_job_spec(&self, id: JobSpecId, archived_at: DateTime<Utc>)
    -> PersistenceResult<()>;
}

pub trait RunStore: Send + Sync {
    /// Writes the run and all of its task runs, all or nothing. A second run
    /// for the same `(job_spec_id, trigger key)` is not written; the stored
    /// one comes back as [`RunCreation::Existing`].
    fn create_job_run(&self, run: &JobRun) -> PersistenceResult<RunCreation>;

    fn find_job_run(&self, id: JobRunId) -> PersistenceResult<Option<JobRun>>;

    /// Runs of one spec, oldest first.
    fn list_job_runs(&self, job_spec_id: JobSpecId) -> PersistenceResult<Vec<JobRun>>;

    /// Writes `run`, already moved to in progress, only if the stored run is
    /// still pending. Returns `false` when another executor claimed it first;
    /// the check and the write happen atomically.
    fn claim_job_run(&self, run: &JobRun) -> PersistenceResult<bool>;

    /// Persists the run row together with every task run in one write.
    /// Fails with `InvalidTransition` when the stored run or one of its task
    /// runs has finished and the write carries a different status.
    fn update_job_run(&self, run: &JobRun) -> PersistenceResult<()>;

    fn update_task_run(&self, task_run: &TaskRun) -> PersistenceResult<()>;
}

pub(crate) fn finished_record_error(
    job_run_id: JobRunId,
    record: &str,
    stored: RunStatus,
    next: RunStatus,
) -> CoreError {
    CoreError::new(
        CoreErrorKind::InvalidTransition,
        format!("{record} already finished as '{stored}' and cannot become '{next}'"),
    )
    .with_job_run(job_run_id)
}
