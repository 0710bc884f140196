//! Execution records created when a job's trigger fires.
//!
//! Both `JobRun` and `TaskRun` move through the same [`RunStatus`] machine.
//! Every status change goes through [`RunStatus::transition`], which refuses
//! to leave a terminal state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Initiator, JobRunId, JobSpec, JobSpecId, TaskRunId,
    TaskSpec,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Errored,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::InProgress,
        RunStatus::Completed,
        RunStatus::Errored,
        RunStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Cancelled)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Errored)
        )
    }

    /// Stored records may be rewritten freely until they finish; after that
    /// only a write carrying the same status is accepted.
    pub fn accepts_write_of(self, next: RunStatus) -> bool {
        !self.is_terminal() || self == next
    }

    pub fn transition(self, next: RunStatus) -> CoreResult<RunStatus> {
        if !self.can_transition_to(next) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidTransition,
                format!("run cannot transition from '{self}' to '{next}'"),
            ));
        }
        Ok(next)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| CoreError::invalid_input(format!("unknown run status '{raw}'")))
    }
}

/// Failure recorded on a run, kept as data rather than as a live error.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskRunError {
    pub kind: CoreErrorKind,
    pub message: String,
}

impl TaskRunError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&CoreError> for TaskRunError {
    fn from(error: &CoreError) -> Self {
        Self::new(error.kind, error.message.clone())
    }
}

impl From<CoreError> for TaskRunError {
    fn from(error: CoreError) -> Self {
        Self::new(error.kind, error.message)
    }
}

/// Identity of one firing of a trigger source.
///
/// Observing the same event twice must not produce two runs, so stores key
/// run creation on `(job_spec_id, key)`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub key: String,
    pub fired_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(key: impl Into<String>, fired_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            fired_at,
        }
    }

    /// An event no other observer can collide with.
    pub fn unique() -> Self {
        Self::new(Uuid::new_v4().simple().to_string(), Utc::now())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub job_run_id: JobRunId,
    pub task_spec: TaskSpec,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub error: Option<TaskRunError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    fn new(job_run_id: JobRunId, task_spec: TaskSpec) -> Self {
        Self {
            id: TaskRunId::new(),
            job_run_id,
            task_spec,
            status: RunStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::InProgress)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::Completed)?;
        self.result = Some(result);
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, error: TaskRunError, now: DateTime<Utc>) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::Errored)?;
        self.error = Some(error);
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::Cancelled)?;
        self.finished_at = Some(now);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub job_spec_id: JobSpecId,
    pub trigger: TriggerEvent,
    pub initiator: Initiator,
    pub status: RunStatus,
    pub task_runs: Vec<TaskRun>,
    pub result: Option<Value>,
    pub error: Option<TaskRunError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    /// Builds a pending run with one pending task run per pipeline step.
    pub fn new(spec: &JobSpec, initiator: &Initiator, trigger: TriggerEvent) -> CoreResult<Self> {
        if initiator.job_spec_id != spec.id {
            return Err(CoreError::invalid_input(format!(
                "initiator '{}' does not belong to job spec '{}'",
                initiator.id, spec.id
            ))
            .with_job_spec(spec.id));
        }
        if spec.tasks.is_empty() {
            return Err(
                CoreError::invalid_input("job spec has no tasks to run").with_job_spec(spec.id)
            );
        }

        let id = JobRunId::new();
        let now = Utc::now();
        let task_runs = spec
            .tasks
            .iter()
            .map(|task| TaskRun::new(id, task.clone()))
            .collect();

        Ok(Self {
            id,
            job_spec_id: spec.id,
            trigger,
            initiator: initiator.clone(),
            status: RunStatus::Pending,
            task_runs,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        })
    }

    pub fn task_run(&self, id: TaskRunId) -> Option<&TaskRun> {
        self.task_runs.iter().find(|task_run| task_run.id == id)
    }

    pub fn next_pending_index(&self) -> Option<usize> {
        self.task_runs
            .iter()
            .position(|task_run| task_run.status == RunStatus::Pending)
    }

    /// Output of the most recent completed step, fed to the next one.
    pub fn latest_result(&self) -> Option<&Value> {
        self.task_runs
            .iter()
            .rev()
            .find(|task_run| task_run.status == RunStatus::Completed)
            .and_then(|task_run| task_run.result.as_ref())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::InProgress)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn start_task(&mut self, index: usize, now: DateTime<Utc>) -> CoreResult<()> {
        if let Some(previous) = index.checked_sub(1).and_then(|i| self.task_runs.get(i))
            && previous.status != RunStatus::Completed
        {
            return Err(CoreError::new(
                CoreErrorKind::InvalidTransition,
                format!(
                    "task run {index} cannot start while the previous step is '{}'",
                    previous.status
                ),
            )
            .with_job_run(self.id));
        }
        self.task_run_mut(index)?.start(now)?;
        self.updated_at = now;
        Ok(())
    }

    /// Records a step's output; completes the job once every step has.
    pub fn complete_task(&mut self, index: usize, result: Value, now: DateTime<Utc>) -> CoreResult<()> {
        self.task_run_mut(index)?.complete(result.clone(), now)?;
        self.updated_at = now;

        if self
            .task_runs
            .iter()
            .all(|task_run| task_run.status == RunStatus::Completed)
        {
            self.status = self.status.transition(RunStatus::Completed)?;
            self.result = Some(result);
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Fails one step, cancels every step after it and fails the job.
    pub fn fail_task(
        &mut self,
        index: usize,
        error: TaskRunError,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.task_run_mut(index)?.fail(error.clone(), now)?;
        self.abort(error, now)
    }

    /// Cancels all pending steps and fails the job without running anything else.
    pub fn abort(&mut self, error: TaskRunError, now: DateTime<Utc>) -> CoreResult<()> {
        for task_run in &mut self.task_runs {
            if task_run.status == RunStatus::Pending {
                task_run.cancel(now)?;
            }
        }
        self.status = self.status.transition(RunStatus::Errored)?;
        self.error = Some(error);
        self.updated_at = now;
        self.finished_at = Some(now);
        Ok(())
    }

    fn task_run_mut(&mut self, index: usize) -> CoreResult<&mut TaskRun> {
        let job_run = self.id;
        self.task_runs.get_mut(index).ok_or_else(|| {
            CoreError::not_found(format!("job run has no task run at position {index}"))
                .with_job_run(job_run)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{
        CronParams, InitiatorDefaults, InitiatorParams, InitiatorRequest, JobSpecRequest,
        TaskSpecRequest,
    };

    fn spec(task_types: &[&str]) -> JobSpec {
        let request = JobSpecRequest {
            initiators: vec![InitiatorRequest::new(InitiatorParams::Cron(CronParams {
                schedule: "1 * * * *".to_string(),
            }))],
            tasks: task_types
                .iter()
                .map(|task_type| TaskSpecRequest::new(*task_type, json!({"a": 1})))
                .collect(),
            ..JobSpecRequest::default()
        };
        JobSpec::from_request(request, &InitiatorDefaults::default()).unwrap()
    }

    fn run(task_types: &[&str]) -> JobRun {
        let spec = spec(task_types);
        JobRun::new(&spec, &spec.initiators[0], TriggerEvent::unique()).unwrap()
    }

    #[test]
    fn terminal_states_are_never_left() {
        for from in RunStatus::ALL.into_iter().filter(|status| status.is_terminal()) {
            for to in RunStatus::ALL {
                assert!(from.transition(to).is_err(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn finished_records_only_accept_their_own_status() {
        for stored in RunStatus::ALL {
            for next in RunStatus::ALL {
                let expected = !stored.is_terminal() || stored == next;
                assert_eq!(stored.accepts_write_of(next), expected, "{stored} <- {next}");
            }
        }
        assert!(RunStatus::InProgress.accepts_write_of(RunStatus::Pending));
        assert!(!RunStatus::Completed.accepts_write_of(RunStatus::InProgress));
    }

    #[test]
    fn only_forward_transitions_are_allowed() {
        assert!(RunStatus::Pending.transition(RunStatus::InProgress).is_ok());
        assert!(RunStatus::Pending.transition(RunStatus::Cancelled).is_ok());
        assert!(RunStatus::InProgress.transition(RunStatus::Completed).is_ok());
        assert!(RunStatus::InProgress.transition(RunStatus::Errored).is_ok());

        assert!(RunStatus::Pending.transition(RunStatus::Completed).is_err());
        assert!(RunStatus::InProgress.transition(RunStatus::Pending).is_err());
        assert!(RunStatus::InProgress.transition(RunStatus::Cancelled).is_err());
        assert_eq!(
            RunStatus::Pending
                .transition(RunStatus::Pending)
                .unwrap_err()
                .kind,
            CoreErrorKind::InvalidTransition
        );
    }

    #[test]
    fn new_run_mirrors_the_pipeline() {
        let spec = spec(&["NoOp", "copy", "multiply"]);
        let run = JobRun::new(&spec, &spec.initiators[0], TriggerEvent::unique()).unwrap();

        assert_eq!(run.job_spec_id, spec.id);
        assert_eq!(run.initiator, spec.initiators[0]);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.task_runs.len(), 3);
        for (task_run, task_spec) in run.task_runs.iter().zip(&spec.tasks) {
            assert_eq!(&task_run.task_spec, task_spec);
            assert_eq!(task_run.job_run_id, run.id);
            assert_eq!(task_run.status, RunStatus::Pending);
        }
    }

    #[test]
    fn initiator_from_another_spec_is_rejected() {
        let first = spec(&["noop"]);
        let second = spec(&["noop"]);
        let error =
            JobRun::new(&first, &second.initiators[0], TriggerEvent::unique()).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    }

    #[test]
    fn failing_a_step_cancels_the_rest_and_fails_the_job() {
        let mut run = run(&["noop", "noop", "noop"]);
        let now = Utc::now();
        run.start(now).unwrap();
        run.start_task(0, now).unwrap();
        run.complete_task(0, json!(1), now).unwrap();
        run.start_task(1, now).unwrap();
        run.fail_task(1, TaskRunError::new(CoreErrorKind::AdapterFailure, "boom"), now)
            .unwrap();

        assert_eq!(run.status, RunStatus::Errored);
        assert_eq!(run.task_runs[0].status, RunStatus::Completed);
        assert_eq!(run.task_runs[1].status, RunStatus::Errored);
        assert_eq!(run.task_runs[2].status, RunStatus::Cancelled);
        assert_eq!(
            run.error.as_ref().map(|error| error.kind),
            Some(CoreErrorKind::AdapterFailure)
        );
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn job_completes_only_after_every_step() {
        let mut run = run(&["noop", "noop"]);
        let now = Utc::now();
        run.start(now).unwrap();
        run.start_task(0, now).unwrap();
        run.complete_task(0, json!("first"), now).unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert_eq!(run.latest_result(), Some(&json!("first")));

        run.start_task(1, now).unwrap();
        run.complete_task(1, json!("second"), now).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result, Some(json!("second")));
    }

    #[test]
    fn steps_cannot_start_out_of_order() {
        let mut run = run(&["noop", "noop"]);
        let now = Utc::now();
        run.start(now).unwrap();

        let error = run.start_task(1, now).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidTransition);
        assert_eq!(run.task_runs[1].status, RunStatus::Pending);
    }

    #[test]
    fn completed_step_cannot_be_failed_afterwards() {
        let mut run = run(&["noop"]);
        let now = Utc::now();
        run.start(now).unwrap();
        run.start_task(0, now).unwrap();
        run.complete_task(0, json!(null), now).unwrap();

        let error = run
            .fail_task(0, TaskRunError::new(CoreErrorKind::Internal, "late"), now)
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidTransition);
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn statuses_roundtrip_through_storage_strings() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }
}
