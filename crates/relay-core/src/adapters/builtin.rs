//! Adapters shipped with the core. They only reshape data already in the
//! run; anything reaching outside the process is registered by the embedder.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Number, Value};

use crate::adapters::{Adapter, AdapterResult, RunContext, adapter_failure};
use crate::models::initiator::parse_duration;
use crate::models::{CoreError, CoreErrorKind, TaskParams};

/// Passes the previous step's result through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpAdapter;

#[async_trait]
impl Adapter for NoOpAdapter {
    async fn run(&self, _params: &TaskParams, context: &RunContext) -> AdapterResult<Value> {
        Ok(context.previous_result.clone().unwrap_or(Value::Null))
    }
}

/// Extracts the value at `copyPath` from the previous result.
///
/// `copyPath` is either a list of keys or a dot-separated string; numeric
/// segments index into arrays.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyAdapter;

#[async_trait]
impl Adapter for CopyAdapter {
    async fn run(&self, params: &TaskParams, context: &RunContext) -> AdapterResult<Value> {
        let path = copy_path(params).map_err(|message| adapter_failure(&context.task_type, message))?;
        let input = context.previous_result.as_ref().unwrap_or(&Value::Null);

        let mut current = input;
        for segment in &path {
            current = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| {
                adapter_failure(
                    &context.task_type,
                    format!("copyPath segment '{segment}' not found in input"),
                )
            })?;
        }
        Ok(current.clone())
    }
}

fn copy_path(params: &TaskParams) -> Result<Vec<String>, String> {
    match params.get("copyPath") {
        Some(Value::String(dotted)) => Ok(dotted
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()),
        Some(Value::Array(segments)) => segments
            .iter()
            .map(|segment| match segment {
                Value::String(key) => Ok(key.clone()),
                Value::Number(index) => Ok(index.to_string()),
                other => Err(format!("copyPath segment '{other}' must be a string")),
            })
            .collect(),
        Some(other) => Err(format!("copyPath '{other}' must be a list or a dotted string")),
        None => Err("copyPath is required".to_string()),
    }
}

/// Multiplies the input by `times`.
///
/// The input is the `input` param when present, otherwise the previous
/// result. Numbers and numeric strings are both accepted.
#[derive(Clone, Copy, Debug, Default)]
pub struct MultiplyAdapter;

#[async_trait]
impl Adapter for MultiplyAdapter {
    async fn run(&self, params: &TaskParams, context: &RunContext) -> AdapterResult<Value> {
        let fail = |message: String| adapter_failure(&context.task_type, message);

        let times = params
            .get("times")
            .ok_or_else(|| fail("times is required".to_string()))
            .and_then(|value| as_number(value).map_err(fail))?;
        let input = params
            .get("input")
            .or(context.previous_result.as_ref())
            .ok_or_else(|| fail("multiply requires an input value".to_string()))
            .and_then(|value| as_number(value).map_err(fail))?;

        number_value(input * times)
            .ok_or_else(|| fail(format!("product of {input} and {times} is not a finite number")))
    }
}

fn as_number(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| format!("'{number}' is not representable as a number")),
        Value::String(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{raw}' is not a number")),
        other => Err(format!("'{other}' is not a number")),
    }
}

const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

fn number_value(product: f64) -> Option<Value> {
    if product.fract() == 0.0 && product.abs() < MAX_EXACT_INTEGER {
        return Some(Value::from(product as i64));
    }
    Number::from_f64(product).map(Value::Number)
}

/// Waits for `duration` (`"500ms"`, `"2s"`, or a number of seconds), then
/// passes the previous result through.
#[derive(Clone, Copy, Debug, Default)]
pub struct SleepAdapter;

#[async_trait]
impl Adapter for SleepAdapter {
    async fn run(&self, params: &TaskParams, context: &RunContext) -> AdapterResult<Value> {
        let duration = sleep_duration(params)
            .map_err(|message| adapter_failure(&context.task_type, message))?;

        tokio::select! {
            _ = context.cancellation.cancelled() => Err(CoreError::new(
                CoreErrorKind::Cancelled,
                "sleep interrupted by cancellation",
            )
            .with_task_type(context.task_type.clone())),
            _ = tokio::time::sleep(duration) => {
                Ok(context.previous_result.clone().unwrap_or(Value::Null))
            }
        }
    }
}

fn sleep_duration(params: &TaskParams) -> Result<Duration, String> {
    match params.get("duration") {
        Some(Value::String(raw)) => parse_duration(raw),
        Some(Value::Number(seconds)) => seconds
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {seconds} must be a whole number of seconds")),
        Some(other) => Err(format!("duration '{other}' must be a string or a number")),
        None => Err("duration is required".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::models::{JobRunId, JobSpecId, TaskRunId, TaskType};

    fn context(task_type: &str, previous_result: Option<Value>) -> RunContext {
        RunContext {
            job_spec_id: JobSpecId::new(),
            job_run_id: JobRunId::new(),
            task_run_id: TaskRunId::new(),
            task_type: TaskType::new(task_type).unwrap(),
            previous_result,
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    fn params(value: Value) -> TaskParams {
        TaskParams::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn noop_passes_previous_result_through() {
        let output = NoOpAdapter
            .run(&params(json!({})), &context("noop", Some(json!({"a": 1}))))
            .await
            .unwrap();
        assert_eq!(output, json!({"a": 1}));

        let first = NoOpAdapter
            .run(&params(json!({})), &context("noop", None))
            .await
            .unwrap();
        assert_eq!(first, Value::Null);
    }

    #[tokio::test]
    async fn copy_walks_objects_and_arrays() {
        let input = json!({"data": {"prices": [{"usd": "1.5"}, {"usd": "2.5"}]}});
        let by_list = CopyAdapter
            .run(
                &params(json!({"copyPath": ["data", "prices", 1, "usd"]})),
                &context("copy", Some(input.clone())),
            )
            .await
            .unwrap();
        assert_eq!(by_list, json!("2.5"));

        let dotted = CopyAdapter
            .run(
                &params(json!({"copyPath": "data.prices.0.usd"})),
                &context("copy", Some(input)),
            )
            .await
            .unwrap();
        assert_eq!(dotted, json!("1.5"));
    }

    #[tokio::test]
    async fn copy_reports_missing_segments() {
        let error = CopyAdapter
            .run(
                &params(json!({"copyPath": ["missing"]})),
                &context("copy", Some(json!({"present": 1}))),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::AdapterFailure);
        assert_eq!(error.task_type.as_ref().map(TaskType::as_str), Some("copy"));
    }

    #[tokio::test]
    async fn multiply_accepts_numeric_strings() {
        let output = MultiplyAdapter
            .run(
                &params(json!({"times": 100})),
                &context("multiply", Some(json!("1.5"))),
            )
            .await
            .unwrap();
        assert_eq!(output, json!(150));

        let fractional = MultiplyAdapter
            .run(
                &params(json!({"times": "0.5", "input": 3})),
                &context("multiply", None),
            )
            .await
            .unwrap();
        assert_eq!(fractional, json!(1.5));
    }

    #[tokio::test]
    async fn multiply_rejects_non_numeric_input() {
        let error = MultiplyAdapter
            .run(
                &params(json!({"times": 2})),
                &context("multiply", Some(json!({"not": "a number"}))),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::AdapterFailure);
    }

    #[tokio::test]
    async fn sleep_stops_when_cancelled() {
        let context = context("sleep", None);
        context.cancellation.cancel();
        let error = SleepAdapter
            .run(&params(json!({"duration": "1h"})), &context)
            .await
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn sleep_returns_previous_result() {
        let output = SleepAdapter
            .run(
                &params(json!({"duration": "5ms"})),
                &context("sleep", Some(json!(7))),
            )
            .await
            .unwrap();
        assert_eq!(output, json!(7));
    }
}
