pub mod builtin;

pub use builtin::{CopyAdapter, MultiplyAdapter, NoOpAdapter, SleepAdapter};

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::{
    CoreError, CoreErrorKind, JobRunId, JobSpecId, TaskParams, TaskRunId, TaskType,
};

pub type AdapterResult<T> = Result<T, CoreError>;

/// Everything an adapter may know about the step it is executing.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub job_spec_id: JobSpecId,
    pub job_run_id: JobRunId,
    pub task_run_id: TaskRunId,
    pub task_type: TaskType,
    /// Output of the previous step, `None` for the first one.
    pub previous_result: Option<Value>,
    pub cancellation: CancellationToken,
    pub deadline: Option<Instant>,
}

impl RunContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Executable unit behind a task type tag.
///
/// Implementations receive the step's params verbatim, including the injected
/// `type` key, and return the step's result. Long-running adapters should
/// watch `context.cancellation`; the engine also drops the future when the
/// run is cancelled or the step times out.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn run(&self, params: &TaskParams, context: &RunContext) -> AdapterResult<Value>;
}

pub(crate) fn adapter_failure(task_type: &TaskType, message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::AdapterFailure, message)
        .with_task_type(task_type.clone())
}
