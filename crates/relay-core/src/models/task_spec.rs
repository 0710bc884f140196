use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{CoreError, CoreResult, JobSpecId, TaskSpecId, TaskType};

/// Key under which a step's own type tag is injected into its params.
pub const TASK_TYPE_PARAM: &str = "type";

/// Opaque parameter object handed verbatim to the resolved adapter.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskParams(Map<String, Value>);

impl TaskParams {
    pub fn new(params: Map<String, Value>) -> Self {
        Self(params)
    }

    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(params) => Ok(Self(params)),
            other => Err(CoreError::invalid_input(format!(
                "task params must be a JSON object, got '{other}'"
            ))),
        }
    }

    pub fn from_json_str(raw: &str) -> CoreResult<Self> {
        let value = serde_json::from_str(raw)
            .map_err(|error| CoreError::invalid_input(format!("invalid task params: {error}")))?;
        Self::from_value(value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn to_json_string(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    fn with_task_type(mut self, task_type: &TaskType) -> Self {
        self.0.insert(
            TASK_TYPE_PARAM.to_string(),
            Value::String(task_type.as_str().to_string()),
        );
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpecRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub params: Value,
}

impl TaskSpecRequest {
    pub fn new(task_type: impl Into<String>, params: Value) -> Self {
        Self {
            task_type: task_type.into(),
            params,
        }
    }
}

/// One ordered step of a job's pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskSpecId,
    pub job_spec_id: JobSpecId,
    pub position: u32,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub params: TaskParams,
}

impl TaskSpec {
    pub fn from_request(
        request: TaskSpecRequest,
        job_spec_id: JobSpecId,
        position: u32,
    ) -> CoreResult<Self> {
        let task_type = TaskType::new(&request.task_type)?;
        let params = TaskParams::from_value(request.params)
            .map_err(|error| error.with_task_type(task_type.clone()))?
            .with_task_type(&task_type);

        Ok(Self {
            id: TaskSpecId::new(),
            job_spec_id,
            position,
            task_type,
            params,
        })
    }
}
