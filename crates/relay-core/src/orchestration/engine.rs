use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapters::RunContext;
use crate::config::CoreConfig;
use crate::models::{
    CoreError, CoreErrorKind, InitiatorId, JobRun, JobRunId, JobSpec, JobSpecId, JobSpecRequest,
    Payment, RunStatus, TaskRun, TaskRunError, TaskSpec, TriggerEvent,
};
use crate::orchestration::{FireOutcome, OrchestrationResult, SuppressionReason};
use crate::persistence::{JobSpecStore, PersistenceResult, RunCreation, RunStore};
use crate::registry::AdapterRegistry;

type ActiveRuns = Arc<Mutex<HashMap<JobRunId, CancellationToken>>>;

/// Turns fired triggers into runs and drives each run's pipeline.
///
/// Cloning is cheap; clones share stores, registry, the concurrency limit and
/// the table of executing runs.
#[derive(Clone)]
pub struct RunEngine {
    specs: Arc<dyn JobSpecStore>,
    runs: Arc<dyn RunStore>,
    registry: AdapterRegistry,
    config: Arc<CoreConfig>,
    permits: Arc<Semaphore>,
    active: ActiveRuns,
}

impl RunEngine {
    pub fn new(
        specs: Arc<dyn JobSpecStore>,
        runs: Arc<dyn RunStore>,
        registry: AdapterRegistry,
        config: CoreConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            specs,
            runs,
            registry,
            config: Arc::new(config),
            permits,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_store<S>(store: Arc<S>, registry: AdapterRegistry, config: CoreConfig) -> Self
    where
        S: JobSpecStore + RunStore + 'static,
    {
        Self::new(store.clone(), store, registry, config)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Validates the request, builds the spec with process defaults and
    /// stores it. Nothing is written when validation fails.
    pub async fn create_job_spec(&self, request: JobSpecRequest) -> OrchestrationResult<JobSpec> {
        let spec = JobSpec::from_request(request, &self.config.initiator_defaults())?;
        let specs = self.specs.clone();
        let stored = spec.clone();
        run_blocking("create_job_spec", move || specs.create_job_spec(&stored))
            .await
            .map_err(|error| error.with_job_spec(spec.id))?;

        tracing::info!(
            job_spec = %spec.id,
            initiators = spec.initiators.len(),
            tasks = spec.tasks.len(),
            "created job spec"
        );
        Ok(spec)
    }

    pub async fn archive_job_spec(&self, job_spec_id: JobSpecId) -> OrchestrationResult<()> {
        let specs = self.specs.clone();
        run_blocking("archive_job_spec", move || {
            specs.archive_job_spec(job_spec_id, Utc::now())
        })
        .await?;
        tracing::info!(job_spec = %job_spec_id, "archived job spec");
        Ok(())
    }

    /// Creates at most one run for `trigger`. Out-of-window and archived
    /// specs are suppressed rather than rejected.
    pub async fn fire(
        &self,
        job_spec_id: JobSpecId,
        initiator_id: InitiatorId,
        trigger: TriggerEvent,
    ) -> OrchestrationResult<FireOutcome> {
        self.fire_inner(job_spec_id, initiator_id, trigger, None)
            .await
    }

    /// Like [`RunEngine::fire`], for triggers that carry a payment offer.
    /// Offers below the spec's effective floor are suppressed.
    pub async fn fire_with_payment(
        &self,
        job_spec_id: JobSpecId,
        initiator_id: InitiatorId,
        trigger: TriggerEvent,
        offered: Payment,
    ) -> OrchestrationResult<FireOutcome> {
        self.fire_inner(job_spec_id, initiator_id, trigger, Some(offered))
            .await
    }

    async fn fire_inner(
        &self,
        job_spec_id: JobSpecId,
        initiator_id: InitiatorId,
        trigger: TriggerEvent,
        offered: Option<Payment>,
    ) -> OrchestrationResult<FireOutcome> {
        let specs = self.specs.clone();
        let spec = run_blocking("find_job_spec", move || specs.find_job_spec(job_spec_id))
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("job spec '{job_spec_id}' does not exist"))
                    .with_job_spec(job_spec_id)
            })?;
        let initiator = spec.initiator(initiator_id).ok_or_else(|| {
            CoreError::not_found(format!(
                "initiator '{initiator_id}' does not belong to job spec '{job_spec_id}'"
            ))
            .with_job_spec(job_spec_id)
        })?;

        if let Some(reason) = self.suppression_reason(&spec, &trigger, offered) {
            tracing::debug!(
                job_spec = %job_spec_id,
                initiator = %initiator_id,
                trigger = %trigger.key,
                reason = ?reason,
                "suppressed trigger"
            );
            return Ok(FireOutcome::Suppressed {
                job_spec_id,
                reason,
            });
        }

        let run = JobRun::new(&spec, initiator, trigger)?;
        let runs = self.runs.clone();
        let creation = run_blocking("create_job_run", move || runs.create_job_run(&run))
            .await
            .map_err(|error| error.with_job_spec(job_spec_id))?;

        match creation {
            RunCreation::Created(run) => {
                tracing::info!(
                    job_spec = %job_spec_id,
                    job_run = %run.id,
                    initiator = ?run.initiator.kind(),
                    trigger = %run.trigger.key,
                    "created job run"
                );
                Ok(FireOutcome::Created(run))
            }
            RunCreation::Existing(run) => {
                tracing::debug!(
                    job_spec = %job_spec_id,
                    job_run = %run.id,
                    trigger = %run.trigger.key,
                    "trigger already produced a run"
                );
                Ok(FireOutcome::Duplicate(run))
            }
        }
    }

    fn suppression_reason(
        &self,
        spec: &JobSpec,
        trigger: &TriggerEvent,
        offered: Option<Payment>,
    ) -> Option<SuppressionReason> {
        if spec.is_archived() {
            return Some(SuppressionReason::Archived);
        }
        if !spec.started(trigger.fired_at) {
            return Some(SuppressionReason::NotStarted);
        }
        if spec.ended(trigger.fired_at) {
            return Some(SuppressionReason::Ended);
        }
        if let (Some(offered), Some(required)) = (offered, spec.effective_min_payment(&self.config))
            && offered < required
        {
            return Some(SuppressionReason::Underpaid { offered, required });
        }
        None
    }

    /// Runs every pending step of the run in order and returns the final
    /// record. Each transition is persisted before the next step starts.
    ///
    /// The run is claimed in the store before any step runs, so engines
    /// sharing a store execute it at most once; the others get
    /// `InvalidTransition`.
    pub async fn execute(&self, job_run_id: JobRunId) -> OrchestrationResult<JobRun> {
        let runs = self.runs.clone();
        let mut run = run_blocking("find_job_run", move || runs.find_job_run(job_run_id))
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("job run '{job_run_id}' does not exist"))
                    .with_job_run(job_run_id)
            })?;

        if run.status.is_terminal() {
            return Ok(run);
        }
        if run.status != RunStatus::Pending {
            return Err(CoreError::new(
                CoreErrorKind::InvalidTransition,
                format!("job run '{job_run_id}' was already started"),
            )
            .with_job_run(job_run_id)
            .with_job_spec(run.job_spec_id));
        }

        let guard = ExecutionGuard::register(&self.active, job_run_id)?;
        run.start(Utc::now())?;
        if !self.claim_job_run(&run).await? {
            tracing::debug!(
                job_spec = %run.job_spec_id,
                job_run = %run.id,
                "job run was claimed by another executor"
            );
            return Err(CoreError::new(
                CoreErrorKind::InvalidTransition,
                format!("job run '{job_run_id}' was already started"),
            )
            .with_job_run(job_run_id)
            .with_job_spec(run.job_spec_id));
        }

        while let Some(index) = run.next_pending_index() {
            if guard.token.is_cancelled() {
                let error = TaskRunError::new(
                    CoreErrorKind::Cancelled,
                    "run cancelled before the step started",
                );
                run.abort(error, Utc::now())?;
                self.persist_job_run(&run).await?;
                break;
            }

            run.start_task(index, Utc::now())?;
            let task_run = run.task_runs[index].clone();
            self.persist_task_run(&task_run).await?;
            tracing::debug!(
                job_spec = %run.job_spec_id,
                job_run = %run.id,
                task_run = %task_run.id,
                task_type = %task_run.task_spec.task_type,
                position = task_run.task_spec.position,
                "started step"
            );

            let context = RunContext {
                job_spec_id: run.job_spec_id,
                job_run_id: run.id,
                task_run_id: task_run.id,
                task_type: task_run.task_spec.task_type.clone(),
                previous_result: run.latest_result().cloned(),
                cancellation: guard.token.clone(),
                deadline: self.config.task_timeout.map(|limit| Instant::now() + limit),
            };

            match self.run_step(&task_run.task_spec, context).await {
                Ok(result) => {
                    run.complete_task(index, result, Utc::now())?;
                    if run.status == RunStatus::Completed {
                        self.persist_job_run(&run).await?;
                    } else {
                        self.persist_task_run(&run.task_runs[index]).await?;
                    }
                    tracing::debug!(
                        job_run = %run.id,
                        task_run = %task_run.id,
                        "completed step"
                    );
                }
                Err(error) => {
                    let error = error.attribute(
                        run.job_spec_id,
                        run.id,
                        Some(&task_run.task_spec.task_type),
                    );
                    tracing::warn!(
                        job_spec = %run.job_spec_id,
                        job_run = %run.id,
                        task_run = %task_run.id,
                        task_type = %task_run.task_spec.task_type,
                        kind = ?error.kind,
                        message = %error.message,
                        "step failed"
                    );
                    run.fail_task(index, TaskRunError::from(error), Utc::now())?;
                    self.persist_job_run(&run).await?;
                    break;
                }
            }
        }

        tracing::info!(
            job_spec = %run.job_spec_id,
            job_run = %run.id,
            status = %run.status,
            "finished job run"
        );
        Ok(run)
    }

    /// Executes the run on the runtime, waiting for a free slot when
    /// `max_concurrent_runs` runs are already executing.
    pub fn spawn(&self, job_run_id: JobRunId) -> JoinHandle<OrchestrationResult<JobRun>> {
        let engine = self.clone();
        tokio::spawn(async move {
            let _permit = engine.permits.clone().acquire_owned().await.map_err(|_| {
                CoreError::internal("run engine concurrency limiter closed").with_job_run(job_run_id)
            })?;

            let result = engine.execute(job_run_id).await;
            if let Err(error) = &result {
                tracing::error!(
                    job_run = %job_run_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "background job run failed"
                );
            }
            result
        })
    }

    /// Fires and, when a new run was created, spawns its execution.
    pub async fn fire_and_spawn(
        &self,
        job_spec_id: JobSpecId,
        initiator_id: InitiatorId,
        trigger: TriggerEvent,
    ) -> OrchestrationResult<(FireOutcome, Option<JoinHandle<OrchestrationResult<JobRun>>>)> {
        let outcome = self.fire(job_spec_id, initiator_id, trigger).await?;
        let handle = outcome.created().map(|run| self.spawn(run.id));
        Ok((outcome, handle))
    }

    /// Signals an executing run to stop. Returns `false` when the run is not
    /// executing in this engine.
    pub fn cancel(&self, job_run_id: JobRunId) -> OrchestrationResult<bool> {
        let active = lock_active(&self.active)?;
        match active.get(&job_run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(job_run = %job_run_id, "cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_executing(&self, job_run_id: JobRunId) -> OrchestrationResult<bool> {
        Ok(lock_active(&self.active)?.contains_key(&job_run_id))
    }

    async fn run_step(&self, task_spec: &TaskSpec, context: RunContext) -> OrchestrationResult<Value> {
        let adapter =
            self.registry
                .resolve(&task_spec.task_type, &self.config, self.runs.clone())?;
        let params = task_spec.params.clone();
        let cancellation = context.cancellation.clone();
        let deadline = context.deadline;

        let mut step = tokio::spawn(async move { adapter.run(&params, &context).await });

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                step.abort();
                Err(CoreError::new(
                    CoreErrorKind::Cancelled,
                    "run cancelled while the step was in flight",
                ))
            }
            _ = sleep_until_deadline(deadline) => {
                step.abort();
                Err(CoreError::new(
                    CoreErrorKind::Timeout,
                    format!(
                        "step exceeded the task timeout of {:?}",
                        self.config.task_timeout.unwrap_or_default()
                    ),
                ))
            }
            joined = &mut step => joined.map_err(|join_error| {
                let detail = if join_error.is_panic() { "panicked" } else { "was aborted" };
                CoreError::internal(format!("adapter {detail}: {join_error}"))
            })?,
        }
    }

    async fn claim_job_run(&self, run: &JobRun) -> OrchestrationResult<bool> {
        let runs = self.runs.clone();
        let claimed = run.clone();
        run_blocking("claim_job_run", move || runs.claim_job_run(&claimed))
            .await
            .map_err(|error| self.log_persistence_failure(error, run.job_spec_id, run.id))
    }

    async fn persist_job_run(&self, run: &JobRun) -> OrchestrationResult<()> {
        let runs = self.runs.clone();
        let stored = run.clone();
        run_blocking("update_job_run", move || runs.update_job_run(&stored))
            .await
            .map_err(|error| self.log_persistence_failure(error, run.job_spec_id, run.id))
    }

    async fn persist_task_run(&self, task_run: &TaskRun) -> OrchestrationResult<()> {
        let runs = self.runs.clone();
        let stored = task_run.clone();
        run_blocking("update_task_run", move || runs.update_task_run(&stored))
            .await
            .map_err(|error| {
                self.log_persistence_failure(error, task_run.task_spec.job_spec_id, task_run.job_run_id)
            })
    }

    fn log_persistence_failure(
        &self,
        error: CoreError,
        job_spec_id: JobSpecId,
        job_run_id: JobRunId,
    ) -> CoreError {
        let attributed = error.attribute(job_spec_id, job_run_id, None);
        tracing::error!(
            job_spec = %job_spec_id,
            job_run = %job_run_id,
            kind = ?attributed.kind,
            message = %attributed.message,
            "failed to persist job run state"
        );
        attributed
    }
}

/// Holds the run's cancellation token in the active table for as long as
/// the run executes.
struct ExecutionGuard {
    active: ActiveRuns,
    job_run_id: JobRunId,
    token: CancellationToken,
}

impl ExecutionGuard {
    fn register(active: &ActiveRuns, job_run_id: JobRunId) -> OrchestrationResult<Self> {
        let mut table = lock_active(active)?;
        if table.contains_key(&job_run_id) {
            return Err(CoreError::invalid_input(format!(
                "job run '{job_run_id}' is already executing"
            ))
            .with_job_run(job_run_id));
        }
        let token = CancellationToken::new();
        table.insert(job_run_id, token.clone());
        Ok(Self {
            active: active.clone(),
            job_run_id,
            token,
        })
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if let Ok(mut table) = self.active.lock() {
            table.remove(&self.job_run_id);
        }
    }
}

fn lock_active(
    active: &ActiveRuns,
) -> OrchestrationResult<MutexGuard<'_, HashMap<JobRunId, CancellationToken>>> {
    active
        .lock()
        .map_err(|_| CoreError::internal("active run table mutex poisoned"))
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_blocking<T, F>(operation: &'static str, work: F) -> OrchestrationResult<T>
where
    F: FnOnce() -> PersistenceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|join_error| {
            CoreError::internal(format!("{operation} persistence join failure: {join_error}"))
        })?
}
