use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::models::{CoreError, JobRun, JobRunId, JobSpec, JobSpecId, RunStatus, TaskRun};
use crate::persistence::{
    JobSpecStore, PersistenceResult, RunCreation, RunStore, finished_record_error,
};

/// Process-local store with the same uniqueness and all-or-nothing
/// guarantees as the SQLite store. Every operation runs under one lock.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    specs: Vec<JobSpec>,
    runs: Vec<JobRun>,
    runs_by_trigger: HashMap<(JobSpecId, String), JobRunId>,
}

impl StoreState {
    fn spec_mut(&mut self, id: JobSpecId) -> PersistenceResult<&mut JobSpec> {
        self.specs
            .iter_mut()
            .find(|spec| spec.id == id)
            .ok_or_else(|| missing_job_spec(id))
    }

    fn run_mut(&mut self, id: JobRunId) -> PersistenceResult<&mut JobRun> {
        self.runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or_else(|| missing_job_run(id))
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::internal("in-memory store mutex poisoned"))
    }
}

impl JobSpecStore for InMemoryStore {
    fn create_job_spec(&self, spec: &JobSpec) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        if state.specs.iter().any(|existing| existing.id == spec.id) {
            return Err(CoreError::invalid_input(format!(
                "job spec '{}' already exists",
                spec.id
            ))
            .with_job_spec(spec.id));
        }
        state.specs.push(spec.clone());
        Ok(())
    }

    fn find_job_spec(&self, id: JobSpecId) -> PersistenceResult<Option<JobSpec>> {
        let state = self.lock_state()?;
        Ok(state.specs.iter().find(|spec| spec.id == id).cloned())
    }

    fn list_job_specs(&self, include_archived: bool) -> PersistenceResult<Vec<JobSpec>> {
        let state = self.lock_state()?;
        Ok(state
            .specs
            .iter()
            .filter(|spec| include_archived || !spec.is_archived())
            .cloned()
            .collect())
    }

    fn archive_job_spec(
        &self,
        id: JobSpecId,
        archived_at: DateTime<Utc>,
    ) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        let spec = state.spec_mut(id)?;
        spec.archived_at.get_or_insert(archived_at);
        Ok(())
    }
}

impl RunStore for InMemoryStore {
    fn create_job_run(&self, run: &JobRun) -> PersistenceResult<RunCreation> {
        let mut state = self.lock_state()?;
        if !state.specs.iter().any(|spec| spec.id == run.job_spec_id) {
            return Err(missing_job_spec(run.job_spec_id).with_job_run(run.id));
        }

        let trigger = (run.job_spec_id, run.trigger.key.clone());
        if let Some(existing_id) = state.runs_by_trigger.get(&trigger).copied() {
            let existing = state.run_mut(existing_id)?.clone();
            return Ok(RunCreation::Existing(existing));
        }
        if state.runs.iter().any(|existing| existing.id == run.id) {
            return Err(
                CoreError::invalid_input(format!("job run '{}' already exists", run.id))
                    .with_job_run(run.id),
            );
        }

        state.runs_by_trigger.insert(trigger, run.id);
        state.runs.push(run.clone());
        Ok(RunCreation::Created(run.clone()))
    }

    fn find_job_run(&self, id: JobRunId) -> PersistenceResult<Option<JobRun>> {
        let state = self.lock_state()?;
        Ok(state.runs.iter().find(|run| run.id == id).cloned())
    }

    fn list_job_runs(&self, job_spec_id: JobSpecId) -> PersistenceResult<Vec<JobRun>> {
        let state = self.lock_state()?;
        Ok(state
            .runs
            .iter()
            .filter(|run| run.job_spec_id == job_spec_id)
            .cloned()
            .collect())
    }

    fn claim_job_run(&self, run: &JobRun) -> PersistenceResult<bool> {
        let mut state = self.lock_state()?;
        let stored = state.run_mut(run.id)?;
        if stored.status != RunStatus::Pending {
            return Ok(false);
        }
        check_same_shape(stored, run)?;
        *stored = run.clone();
        Ok(true)
    }

    fn update_job_run(&self, run: &JobRun) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        let stored = state.run_mut(run.id)?;
        check_same_shape(stored, run)?;
        if !stored.status.accepts_write_of(run.status) {
            return Err(finished_record_error(
                run.id,
                &format!("job run '{}'", run.id),
                stored.status,
                run.status,
            ));
        }
        for (stored_task, task_run) in stored.task_runs.iter().zip(&run.task_runs) {
            if !stored_task.status.accepts_write_of(task_run.status) {
                return Err(finished_record_error(
                    run.id,
                    &format!("task run '{}'", task_run.id),
                    stored_task.status,
                    task_run.status,
                ));
            }
        }
        *stored = run.clone();
        Ok(())
    }

    fn update_task_run(&self, task_run: &TaskRun) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        let run = state.run_mut(task_run.job_run_id)?;
        let stored = run
            .task_runs
            .iter_mut()
            .find(|stored| stored.id == task_run.id)
            .ok_or_else(|| {
                CoreError::not_found(format!("task run '{}' does not exist", task_run.id))
                    .with_job_run(task_run.job_run_id)
            })?;
        if !stored.status.accepts_write_of(task_run.status) {
            return Err(finished_record_error(
                task_run.job_run_id,
                &format!("task run '{}'", task_run.id),
                stored.status,
                task_run.status,
            ));
        }
        *stored = task_run.clone();
        Ok(())
    }
}

fn check_same_shape(stored: &JobRun, run: &JobRun) -> PersistenceResult<()> {
    if stored.task_runs.len() != run.task_runs.len() {
        return Err(CoreError::invalid_input(format!(
            "job run '{}' cannot change its number of task runs",
            run.id
        ))
        .with_job_run(run.id));
    }
    Ok(())
}

fn missing_job_spec(id: JobSpecId) -> CoreError {
    CoreError::not_found(format!("job spec '{id}' does not exist")).with_job_spec(id)
}

fn missing_job_run(id: JobRunId) -> CoreError {
    CoreError::not_found(format!("job run '{id}' does not exist")).with_job_run(id)
}
