use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreResult};

/// Normalized tag naming a pipeline step kind and its adapter.
///
/// Only `[A-Za-z0-9_-]` is accepted on input; the stored form is lowercase.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskType(String);

impl TaskType {
    pub fn new(raw: &str) -> CoreResult<Self> {
        normalize_tag(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validates a free-text type identifier and returns its lowercase form.
pub fn normalize_tag(raw: &str) -> CoreResult<String> {
    if raw.is_empty() || !raw.chars().all(is_tag_char) {
        return Err(CoreError::invalid_tag(raw));
    }
    Ok(raw.to_ascii_lowercase())
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::new(raw)
    }
}

impl TryFrom<String> for TaskType {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(&raw)
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.0
    }
}

impl PartialEq<str> for TaskType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TaskType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
