use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;
use crate::models::{
    CoreError, CoreResult, Initiator, InitiatorDefaults, InitiatorId, InitiatorRequest,
    InitiatorType, JobSpecId, Payment, TaskSpec, TaskSpecRequest, build_initiator,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpecRequest {
    #[serde(default)]
    pub initiators: Vec<InitiatorRequest>,
    #[serde(default)]
    pub tasks: Vec<TaskSpecRequest>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub min_payment: Option<Payment>,
}

impl JobSpecRequest {
    /// Structural checks every request must pass before a spec is built.
    pub fn validate(&self) -> CoreResult<()> {
        if self.initiators.is_empty() {
            return Err(CoreError::invalid_input(
                "job spec requires at least one initiator",
            ));
        }
        if self.tasks.is_empty() {
            return Err(CoreError::invalid_input("job spec requires at least one task"));
        }
        if let (Some(start_at), Some(end_at)) = (self.start_at, self.end_at)
            && end_at < start_at
        {
            return Err(CoreError::invalid_input(format!(
                "job spec endAt {end_at} is before startAt {start_at}"
            )));
        }
        for initiator in &self.initiators {
            initiator.validate()?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub id: JobSpecId,
    pub created_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub min_payment: Option<Payment>,
    pub initiators: Vec<Initiator>,
    pub tasks: Vec<TaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn from_request(request: JobSpecRequest, defaults: &InitiatorDefaults) -> CoreResult<Self> {
        request.validate()?;

        let id = JobSpecId::new();
        let tasks = request
            .tasks
            .into_iter()
            .enumerate()
            .map(|(position, task)| {
                let position = u32::try_from(position).map_err(|_| {
                    CoreError::invalid_input("job spec has too many tasks").with_job_spec(id)
                })?;
                TaskSpec::from_request(task, id, position).map_err(|error| error.with_job_spec(id))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        let initiators = request
            .initiators
            .into_iter()
            .map(|initiator| build_initiator(initiator, id, defaults))
            .collect();

        Ok(Self {
            id,
            created_at: Utc::now(),
            start_at: request.start_at,
            end_at: request.end_at,
            min_payment: request.min_payment,
            initiators,
            tasks,
            archived_at: None,
        })
    }

    /// `true` when no start is set or `now` is at or after it.
    pub fn started(&self, now: DateTime<Utc>) -> bool {
        self.start_at.is_none_or(|start_at| now >= start_at)
    }

    /// `true` only when an end is set and `now` is strictly after it.
    pub fn ended(&self, now: DateTime<Utc>) -> bool {
        self.end_at.is_some_and(|end_at| now > end_at)
    }

    pub fn runnable_at(&self, now: DateTime<Utc>) -> bool {
        self.started(now) && !self.ended(now)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// The spec's own payment floor, or the process default when it has none.
    pub fn effective_min_payment(&self, config: &CoreConfig) -> Option<Payment> {
        self.min_payment.or(config.default_min_payment)
    }

    pub fn initiator(&self, id: InitiatorId) -> Option<&Initiator> {
        self.initiators.iter().find(|initiator| initiator.id == id)
    }

    pub fn initiators_of(&self, kind: InitiatorType) -> impl Iterator<Item = &Initiator> {
        self.initiators
            .iter()
            .filter(move |initiator| initiator.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::models::{CoreErrorKind, CronParams, InitiatorParams, WebParams};

    fn cron_request() -> JobSpecRequest {
        JobSpecRequest {
            initiators: vec![InitiatorRequest::new(InitiatorParams::Cron(CronParams {
                schedule: "* * * * 7".to_string(),
            }))],
            tasks: vec![TaskSpecRequest::new("NoOp", json!({"a": 1}))],
            ..JobSpecRequest::default()
        }
    }

    fn boundary() -> DateTime<Utc> {
        "3000-01-01T00:00:00.000Z".parse().unwrap()
    }

    fn spec_with_window(
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
    ) -> JobSpec {
        let mut spec = JobSpec::from_request(cron_request(), &InitiatorDefaults::default()).unwrap();
        spec.start_at = start_at;
        spec.end_at = end_at;
        spec
    }

    #[test]
    fn ended_is_strict_at_the_boundary() {
        let end_at = boundary();
        let one_ns = TimeDelta::nanoseconds(1);
        let cases = [
            ("no end at", None, end_at, false),
            ("before end at", Some(end_at), end_at - one_ns, false),
            ("at end at", Some(end_at), end_at, false),
            ("after end at", Some(end_at), end_at + one_ns, true),
        ];

        for (name, configured, now, expected) in cases {
            let spec = spec_with_window(None, configured);
            assert_eq!(spec.ended(now), expected, "{name}");
        }
    }

    #[test]
    fn started_is_inclusive_at_the_boundary() {
        let start_at = boundary();
        let one_ns = TimeDelta::nanoseconds(1);
        let cases = [
            ("no start at", None, start_at, true),
            ("before start at", Some(start_at), start_at - one_ns, false),
            ("at start at", Some(start_at), start_at, true),
            ("after start at", Some(start_at), start_at + one_ns, true),
        ];

        for (name, configured, now, expected) in cases {
            let spec = spec_with_window(configured, None);
            assert_eq!(spec.started(now), expected, "{name}");
        }
    }

    #[test]
    fn unset_start_is_always_started() {
        let spec = spec_with_window(None, None);
        for now in [DateTime::<Utc>::MIN_UTC, Utc::now(), DateTime::<Utc>::MAX_UTC] {
            assert!(spec.started(now));
            assert!(spec.runnable_at(now));
        }
    }

    #[test]
    fn from_request_binds_children_to_the_new_spec() {
        let mut request = cron_request();
        request.min_payment = Some(Payment(5));
        request.tasks.push(TaskSpecRequest::new("Copy", json!({"copyPath": ["a"]})));

        let spec = JobSpec::from_request(request, &InitiatorDefaults::default()).unwrap();

        assert_eq!(spec.initiators.len(), 1);
        assert_eq!(spec.initiators[0].job_spec_id, spec.id);
        assert_eq!(spec.tasks.len(), 2);
        assert_eq!(spec.tasks[0].task_type, "noop");
        assert_eq!(spec.tasks[1].task_type, "copy");
        assert_eq!(spec.tasks[1].position, 1);
        assert!(spec.tasks.iter().all(|task| task.job_spec_id == spec.id));
        assert_eq!(spec.min_payment, Some(Payment(5)));
    }

    #[test]
    fn missing_payment_floor_inherits_process_default() {
        let spec = spec_with_window(None, None);
        let config = CoreConfig {
            default_min_payment: Some(Payment(100)),
            ..CoreConfig::default()
        };
        assert_eq!(spec.min_payment, None);
        assert_eq!(spec.effective_min_payment(&config), Some(Payment(100)));

        let mut floored = spec.clone();
        floored.min_payment = Some(Payment::ZERO);
        assert_eq!(floored.effective_min_payment(&config), Some(Payment::ZERO));
    }

    #[test]
    fn validation_rejects_incomplete_requests() {
        let mut no_tasks = cron_request();
        no_tasks.tasks.clear();
        assert_eq!(no_tasks.validate().unwrap_err().kind, CoreErrorKind::InvalidInput);

        let mut no_initiators = cron_request();
        no_initiators.initiators.clear();
        assert_eq!(
            no_initiators.validate().unwrap_err().kind,
            CoreErrorKind::InvalidInput
        );

        let mut inverted = cron_request();
        inverted.start_at = Some(boundary());
        inverted.end_at = Some(boundary() - TimeDelta::seconds(1));
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn invalid_task_tag_fails_the_whole_request() {
        let mut request = cron_request();
        request.tasks.push(TaskSpecRequest::new("bad tag", json!({})));

        let error = JobSpec::from_request(request, &InitiatorDefaults::default()).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidTag);
        assert!(error.job_spec.is_some());
    }

    #[test]
    fn request_decodes_from_camel_case_json() {
        let request: JobSpecRequest = serde_json::from_value(json!({
            "initiators": [{"type": "web"}],
            "tasks": [{"type": "NoOp", "params": {"a": 1}}],
            "startAt": "2030-01-01T00:00:00Z",
            "minPayment": "1000000000000000000"
        }))
        .unwrap();

        assert_eq!(
            request.initiators[0].params,
            InitiatorParams::Web(WebParams::default())
        );
        assert_eq!(request.min_payment, Some(Payment(1_000_000_000_000_000_000)));
        assert!(request.start_at.is_some());
        assert!(request.end_at.is_none());
    }
}
