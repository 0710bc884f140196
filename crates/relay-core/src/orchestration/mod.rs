pub mod engine;

pub use engine::RunEngine;

use crate::models::{CoreError, JobRun, JobSpecId, Payment};

pub type OrchestrationResult<T> = Result<T, CoreError>;

/// Why a trigger did not produce a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuppressionReason {
    NotStarted,
    Ended,
    Archived,
    Underpaid { offered: Payment, required: Payment },
}

/// What happened to one firing of a trigger.
#[derive(Clone, Debug, PartialEq)]
pub enum FireOutcome {
    Created(JobRun),
    /// The trigger event was seen before; this is the run it produced.
    Duplicate(JobRun),
    Suppressed {
        job_spec_id: JobSpecId,
        reason: SuppressionReason,
    },
}

impl FireOutcome {
    pub fn run(&self) -> Option<&JobRun> {
        match self {
            Self::Created(run) | Self::Duplicate(run) => Some(run),
            Self::Suppressed { .. } => None,
        }
    }

    pub fn created(&self) -> Option<&JobRun> {
        match self {
            Self::Created(run) => Some(run),
            _ => None,
        }
    }
}
