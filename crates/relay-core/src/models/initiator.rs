//! Trigger definitions attached to a job specification.
//!
//! Each initiator kind owns its own parameter shape. On the wire an initiator
//! is `{"type": "<tag>", "params": {...}}`; the tag is normalized like any
//! other type tag and the params are decoded strictly into the kind's shape.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::models::task_type::normalize_tag;
use crate::models::{CoreError, CoreResult, Feeds, InitiatorId, JobSpecId};

pub const DEFAULT_FLUX_POLLING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum InitiatorType {
    Web,
    Cron,
    RunLog,
    EthLog,
    RunAt,
    External,
    FluxMonitor,
}

impl InitiatorType {
    pub const ALL: [InitiatorType; 7] = [
        InitiatorType::Web,
        InitiatorType::Cron,
        InitiatorType::RunLog,
        InitiatorType::EthLog,
        InitiatorType::RunAt,
        InitiatorType::External,
        InitiatorType::FluxMonitor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Cron => "cron",
            Self::RunLog => "runlog",
            Self::EthLog => "ethlog",
            Self::RunAt => "runat",
            Self::External => "external",
            Self::FluxMonitor => "fluxmonitor",
        }
    }
}

impl fmt::Display for InitiatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InitiatorType {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_tag(raw)?;
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| CoreError::invalid_input(format!("unknown initiator type '{raw}'")))
    }
}

/// Values substituted for unset initiator params when an initiator is built.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InitiatorDefaults {
    pub polling_interval: Duration,
}

impl Default for InitiatorDefaults {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_FLUX_POLLING_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebParams {}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CronParams {
    pub schedule: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunLogParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub requesters: Vec<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EthLogParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunAtParams {
    pub time: DateTime<Utc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExternalParams {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FluxMonitorParams {
    pub address: String,
    #[serde(default)]
    pub feeds: Feeds,
    pub threshold: f64,
    pub precision: u32,
    #[serde(
        default,
        with = "polling_interval_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub polling_interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

/// Parameters of one initiator, one variant per trigger kind.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawInitiatorParams")]
pub enum InitiatorParams {
    Web(WebParams),
    Cron(CronParams),
    RunLog(RunLogParams),
    EthLog(EthLogParams),
    RunAt(RunAtParams),
    External(ExternalParams),
    FluxMonitor(FluxMonitorParams),
}

impl InitiatorParams {
    pub fn kind(&self) -> InitiatorType {
        match self {
            Self::Web(_) => InitiatorType::Web,
            Self::Cron(_) => InitiatorType::Cron,
            Self::RunLog(_) => InitiatorType::RunLog,
            Self::EthLog(_) => InitiatorType::EthLog,
            Self::RunAt(_) => InitiatorType::RunAt,
            Self::External(_) => InitiatorType::External,
            Self::FluxMonitor(_) => InitiatorType::FluxMonitor,
        }
    }

    /// Decodes `params` into the shape owned by `kind`. `null` means "no params".
    pub fn from_parts(kind: InitiatorType, params: Value) -> CoreResult<Self> {
        let params = match params {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        let decoded = match kind {
            InitiatorType::Web => serde_json::from_value(params).map(Self::Web),
            InitiatorType::Cron => serde_json::from_value(params).map(Self::Cron),
            InitiatorType::RunLog => serde_json::from_value(params).map(Self::RunLog),
            InitiatorType::EthLog => serde_json::from_value(params).map(Self::EthLog),
            InitiatorType::RunAt => serde_json::from_value(params).map(Self::RunAt),
            InitiatorType::External => serde_json::from_value(params).map(Self::External),
            InitiatorType::FluxMonitor => serde_json::from_value(params).map(Self::FluxMonitor),
        };
        decoded.map_err(|error| {
            CoreError::invalid_input(format!("invalid params for initiator '{kind}': {error}"))
        })
    }

    /// JSON form of the kind-specific params, as persisted next to the type tag.
    pub fn params_value(&self) -> CoreResult<Value> {
        let encoded = match self {
            Self::Web(params) => serde_json::to_value(params),
            Self::Cron(params) => serde_json::to_value(params),
            Self::RunLog(params) => serde_json::to_value(params),
            Self::EthLog(params) => serde_json::to_value(params),
            Self::RunAt(params) => serde_json::to_value(params),
            Self::External(params) => serde_json::to_value(params),
            Self::FluxMonitor(params) => serde_json::to_value(params),
        };
        encoded.map_err(|error| {
            CoreError::internal(format!(
                "failed to encode params for initiator '{}': {error}",
                self.kind()
            ))
        })
    }

    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Self::Web(_) | Self::RunLog(_) | Self::EthLog(_) | Self::RunAt(_) => Ok(()),
            Self::Cron(params) => validate_cron_schedule(&params.schedule),
            Self::External(params) => {
                if params.name.trim().is_empty() {
                    return Err(CoreError::invalid_input(
                        "external initiator requires a non-empty name",
                    ));
                }
                Ok(())
            }
            Self::FluxMonitor(params) => {
                if params.address.trim().is_empty() {
                    return Err(CoreError::invalid_input(
                        "fluxmonitor initiator requires a contract address",
                    ));
                }
                if params.feeds.is_empty() {
                    return Err(CoreError::invalid_input(
                        "fluxmonitor initiator requires at least one feed",
                    ));
                }
                if !params.threshold.is_finite() || params.threshold < 0.0 {
                    return Err(CoreError::invalid_input(format!(
                        "fluxmonitor threshold {} must be a non-negative number",
                        params.threshold
                    )));
                }
                Ok(())
            }
        }
    }
}

impl Serialize for InitiatorParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let params = self.params_value().map_err(serde::ser::Error::custom)?;
        let mut state = serializer.serialize_struct("InitiatorParams", 2)?;
        state.serialize_field("type", self.kind().as_str())?;
        state.serialize_field("params", &params)?;
        state.end()
    }
}

#[derive(Deserialize)]
struct RawInitiatorParams {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Value,
}

impl TryFrom<RawInitiatorParams> for InitiatorParams {
    type Error = CoreError;

    fn try_from(raw: RawInitiatorParams) -> Result<Self, Self::Error> {
        let kind: InitiatorType = raw.kind.parse()?;
        Self::from_parts(kind, raw.params)
    }
}

fn validate_cron_schedule(schedule: &str) -> CoreResult<()> {
    let fields = schedule.split_whitespace().count();
    if !(5..=6).contains(&fields) {
        return Err(CoreError::invalid_input(format!(
            "cron schedule '{schedule}' must have five or six fields"
        )));
    }
    Ok(())
}

/// Inbound trigger definition, before it is bound to a job specification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InitiatorRequest {
    pub params: InitiatorParams,
}

impl InitiatorRequest {
    pub fn new(params: InitiatorParams) -> Self {
        Self { params }
    }

    pub fn kind(&self) -> InitiatorType {
        self.params.kind()
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.params.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Initiator {
    pub id: InitiatorId,
    pub job_spec_id: JobSpecId,
    #[serde(flatten)]
    pub params: InitiatorParams,
}

impl Initiator {
    pub fn kind(&self) -> InitiatorType {
        self.params.kind()
    }
}

/// Binds a request to its owning job, filling in kind-specific defaults.
pub fn build_initiator(
    request: InitiatorRequest,
    job_spec_id: JobSpecId,
    defaults: &InitiatorDefaults,
) -> Initiator {
    let params = match request.params {
        InitiatorParams::FluxMonitor(mut params) => {
            if params.polling_interval.is_none_or(|interval| interval.is_zero()) {
                params.polling_interval = Some(defaults.polling_interval);
            }
            InitiatorParams::FluxMonitor(params)
        }
        other => other,
    };

    Initiator {
        id: InitiatorId::new(),
        job_spec_id,
        params,
    }
}

pub(crate) use polling_interval_serde::parse_duration;

/// Polling intervals are read as `"<n>ns"`, `"<n>us"`, `"<n>ms"`, `"<n>s"`,
/// `"<n>m"` or `"<n>h"`; bare integers are seconds. Writes pick the coarsest
/// unit that represents the interval exactly.
mod polling_interval_serde {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let Some(duration) = value else {
            return serializer.serialize_none();
        };
        let nanos = duration.subsec_nanos();
        if nanos == 0 {
            serializer.collect_str(&format_args!("{}s", duration.as_secs()))
        } else if nanos % 1_000_000 == 0 {
            serializer.collect_str(&format_args!("{}ms", duration.as_millis()))
        } else if nanos % 1_000 == 0 {
            serializer.collect_str(&format_args!("{}us", duration.as_micros()))
        } else {
            serializer.collect_str(&format_args!("{}ns", duration.as_nanos()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        deserializer.deserialize_option(OptionalDurationVisitor)
    }

    struct OptionalDurationVisitor;

    impl<'de> Visitor<'de> for OptionalDurationVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration such as \"30s\" or a number of seconds")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
            deserializer.deserialize_any(self)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_secs(value)))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            u64::try_from(value)
                .map(|secs| Some(Duration::from_secs(secs)))
                .map_err(|_| E::custom(format!("polling interval {value} must not be negative")))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            parse_duration(value).map(Some).map_err(E::custom)
        }
    }

    const NANOS_PER_SEC: u128 = 1_000_000_000;

    pub(crate) fn parse_duration(raw: &str) -> Result<Duration, String> {
        let trimmed = raw.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        let amount: u128 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{raw}'"))?;
        let nanos_per_unit: u128 = match unit {
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "" | "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3_600 * NANOS_PER_SEC,
            _ => return Err(format!("invalid duration unit in '{raw}'")),
        };
        let total = amount
            .checked_mul(nanos_per_unit)
            .ok_or_else(|| format!("duration '{raw}' is out of range"))?;
        let secs = u64::try_from(total / NANOS_PER_SEC)
            .map_err(|_| format!("duration '{raw}' is out of range"))?;
        Ok(Duration::new(secs, (total % NANOS_PER_SEC) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CoreErrorKind;

    fn flux_params(polling_interval: Option<Duration>) -> FluxMonitorParams {
        FluxMonitorParams {
            address: "0x3cCad4715152693fE3BC4460591e3D3Fbd071b42".to_string(),
            feeds: Feeds::new(vec!["https://lambda.staging.devnet.tools/bnc/call".to_string()])
                .unwrap(),
            threshold: 5.0,
            precision: 2,
            polling_interval,
            request_data: None,
        }
    }

    #[test]
    fn web_initiator_carries_no_defaults() {
        let job_spec_id = JobSpecId::new();
        let request = InitiatorRequest::new(InitiatorParams::Web(WebParams::default()));

        let initiator = build_initiator(request, job_spec_id, &InitiatorDefaults::default());

        assert_eq!(initiator.job_spec_id, job_spec_id);
        assert_eq!(initiator.kind(), InitiatorType::Web);
        assert_eq!(initiator.params, InitiatorParams::Web(WebParams::default()));
    }

    #[test]
    fn flux_monitor_gets_default_polling_interval() {
        let job_spec_id = JobSpecId::new();
        let defaults = InitiatorDefaults {
            polling_interval: Duration::from_secs(42),
        };

        for unset in [None, Some(Duration::ZERO)] {
            let request = InitiatorRequest::new(InitiatorParams::FluxMonitor(flux_params(unset)));
            let initiator = build_initiator(request, job_spec_id, &defaults);

            assert_eq!(
                initiator.params,
                InitiatorParams::FluxMonitor(flux_params(Some(Duration::from_secs(42))))
            );
        }
    }

    #[test]
    fn flux_monitor_keeps_explicit_polling_interval() {
        let request = InitiatorRequest::new(InitiatorParams::FluxMonitor(flux_params(Some(
            Duration::from_secs(5),
        ))));
        let initiator = build_initiator(request, JobSpecId::new(), &InitiatorDefaults::default());

        let InitiatorParams::FluxMonitor(params) = initiator.params else {
            panic!("expected fluxmonitor params");
        };
        assert_eq!(params.polling_interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn request_type_tag_is_normalized() {
        let request: InitiatorRequest =
            serde_json::from_str(r#"{"type":"Cron","params":{"schedule":"* * * * 7"}}"#).unwrap();
        assert_eq!(request.kind(), InitiatorType::Cron);

        let request: InitiatorRequest = serde_json::from_str(r#"{"type":"web"}"#).unwrap();
        assert_eq!(request.kind(), InitiatorType::Web);
    }

    #[test]
    fn request_rejects_fields_of_other_kinds() {
        let result = serde_json::from_str::<InitiatorRequest>(
            r#"{"type":"web","params":{"schedule":"* * * * *"}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn request_rejects_unknown_or_malformed_tags() {
        assert!(serde_json::from_str::<InitiatorRequest>(r#"{"type":"carrier-pigeon"}"#).is_err());
        assert!(serde_json::from_str::<InitiatorRequest>(r#"{"type":"web!"}"#).is_err());
        assert_eq!(
            "Run Log".parse::<InitiatorType>().unwrap_err().kind,
            CoreErrorKind::InvalidTag
        );
    }

    #[test]
    fn flux_monitor_request_decodes_feeds_and_interval() {
        let request: InitiatorRequest = serde_json::from_str(
            r#"{"type":"fluxmonitor","params":{
                "address":"0x3cCad4715152693fE3BC4460591e3D3Fbd071b42",
                "feeds":["https://lambda.staging.devnet.tools/bnc/call"],
                "threshold":0.5,
                "precision":2,
                "pollingInterval":"1m"
            }}"#,
        )
        .unwrap();

        let InitiatorParams::FluxMonitor(params) = request.params else {
            panic!("expected fluxmonitor params");
        };
        assert_eq!(params.polling_interval, Some(Duration::from_secs(60)));
        assert_eq!(params.feeds.len(), 1);
    }

    #[test]
    fn flux_monitor_request_rejects_relative_feed() {
        let result = serde_json::from_str::<InitiatorRequest>(
            r#"{"type":"fluxmonitor","params":{
                "address":"0x01","feeds":["brokenURL"],"threshold":1,"precision":0
            }}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn serialization_roundtrips_through_wire_shape() {
        let params = InitiatorParams::FluxMonitor(flux_params(Some(Duration::from_millis(1500))));
        let encoded = serde_json::to_value(&params).unwrap();

        assert_eq!(encoded["type"], "fluxmonitor");
        assert_eq!(encoded["params"]["pollingInterval"], "1500ms");
        let decoded: InitiatorParams = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn validation_checks_kind_specific_fields() {
        let bad_cron = InitiatorParams::Cron(CronParams {
            schedule: "* *".to_string(),
        });
        assert_eq!(bad_cron.validate().unwrap_err().kind, CoreErrorKind::InvalidInput);

        let mut negative = flux_params(None);
        negative.threshold = -1.0;
        assert!(InitiatorParams::FluxMonitor(negative).validate().is_err());

        let mut no_feeds = flux_params(None);
        no_feeds.feeds = Feeds::empty();
        assert!(InitiatorParams::FluxMonitor(no_feeds).validate().is_err());

        assert!(InitiatorParams::FluxMonitor(flux_params(None)).validate().is_ok());
    }

    #[test]
    fn duration_parser_accepts_units() {
        use super::polling_interval_serde::parse_duration;
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5d").is_err());
        assert_eq!(parse_duration("1000500us").unwrap(), Duration::from_micros(1_000_500));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::from_nanos(7));
        assert!(parse_duration(&format!("{}h", u128::MAX)).is_err());
    }

    #[test]
    fn polling_interval_serialization_is_exact() {
        let cases = [
            (Duration::from_secs(90), "90s"),
            (Duration::from_millis(1500), "1500ms"),
            (Duration::from_micros(1_000_500), "1000500us"),
            (Duration::new(1, 1), "1000000001ns"),
            (Duration::from_nanos(250), "250ns"),
        ];
        for (interval, wire) in cases {
            let params = InitiatorParams::FluxMonitor(flux_params(Some(interval)));
            let encoded = serde_json::to_value(&params).unwrap();
            assert_eq!(encoded["params"]["pollingInterval"], wire);

            let decoded: InitiatorParams = serde_json::from_value(encoded).unwrap();
            assert_eq!(decoded, params, "interval {interval:?}");
        }
    }
}
