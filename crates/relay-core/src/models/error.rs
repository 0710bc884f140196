use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{JobRunId, JobSpecId, TaskType};

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    InvalidTag,
    InvalidFeeds,
    InvalidInput,
    UnknownAdapter,
    AdapterFailure,
    Cancelled,
    Timeout,
    InvalidTransition,
    NotFound,
    StorageFailure,
    Internal,
}

impl CoreErrorKind {
    pub const ALL: [CoreErrorKind; 11] = [
        CoreErrorKind::InvalidTag,
        CoreErrorKind::InvalidFeeds,
        CoreErrorKind::InvalidInput,
        CoreErrorKind::UnknownAdapter,
        CoreErrorKind::AdapterFailure,
        CoreErrorKind::Cancelled,
        CoreErrorKind::Timeout,
        CoreErrorKind::InvalidTransition,
        CoreErrorKind::NotFound,
        CoreErrorKind::StorageFailure,
        CoreErrorKind::Internal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidTag => "invalid_tag",
            Self::InvalidFeeds => "invalid_feeds",
            Self::InvalidInput => "invalid_input",
            Self::UnknownAdapter => "unknown_adapter",
            Self::AdapterFailure => "adapter_failure",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::InvalidTransition => "invalid_transition",
            Self::NotFound => "not_found",
            Self::StorageFailure => "storage_failure",
            Self::Internal => "internal",
        }
    }

    /// Validation failures are rejected before anything is persisted.
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            Self::InvalidTag | Self::InvalidFeeds | Self::InvalidInput
        )
    }
}

impl FromStr for CoreErrorKind {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| CoreError::invalid_input(format!("unknown error kind '{raw}'")))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub job_spec: Option<JobSpecId>,
    pub job_run: Option<JobRunId>,
    pub task_type: Option<TaskType>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            job_spec: None,
            job_run: None,
            task_type: None,
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_tag(raw: &str) -> Self {
        Self::new(
            CoreErrorKind::InvalidTag,
            format!("invalid type tag '{raw}': only letters, digits, '-' and '_' are allowed"),
        )
    }

    pub fn invalid_feeds(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::InvalidFeeds, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::InvalidInput, message)
    }

    pub fn unknown_adapter(task_type: &TaskType) -> Self {
        Self::new(
            CoreErrorKind::UnknownAdapter,
            format!("no adapter is registered for task type '{task_type}'"),
        )
        .with_task_type(task_type.clone())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::NotFound, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::StorageFailure, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Internal, message)
    }

    pub fn with_job_spec(mut self, job_spec: JobSpecId) -> Self {
        self.job_spec = Some(job_spec);
        self
    }

    pub fn with_job_run(mut self, job_run: JobRunId) -> Self {
        self.job_run = Some(job_run);
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    /// Fills in context the producer of the error did not know about,
    /// keeping anything it already set.
    pub fn attribute(
        self,
        job_spec: JobSpecId,
        job_run: JobRunId,
        task_type: Option<&TaskType>,
    ) -> Self {
        Self {
            job_spec: self.job_spec.or(Some(job_spec)),
            job_run: self.job_run.or(Some(job_run)),
            task_type: self.task_type.or_else(|| task_type.cloned()),
            kind: self.kind,
            message: self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_roundtrip_through_storage_strings() {
        for kind in CoreErrorKind::ALL {
            assert_eq!(kind.as_str().parse::<CoreErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn attribute_keeps_existing_context() {
        let original_spec = JobSpecId::new();
        let error = CoreError::invalid_input("bad").with_job_spec(original_spec);

        let attributed = error.attribute(JobSpecId::new(), JobRunId::new(), None);

        assert_eq!(attributed.job_spec, Some(original_spec));
        assert!(attributed.job_run.is_some());
        assert_eq!(attributed.task_type, None);
    }
}
