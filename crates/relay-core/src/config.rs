use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::{
    CoreError, CoreResult, DEFAULT_FLUX_POLLING_INTERVAL, InitiatorDefaults, Payment,
};

pub const DATABASE_PATH_ENV: &str = "RELAY_DATABASE_PATH";
pub const FLUX_POLLING_INTERVAL_ENV: &str = "RELAY_FLUX_POLLING_INTERVAL_SECS";
pub const MINIMUM_CONTRACT_PAYMENT_ENV: &str = "RELAY_MINIMUM_CONTRACT_PAYMENT";
pub const TASK_TIMEOUT_ENV: &str = "RELAY_TASK_TIMEOUT_SECS";
pub const MAX_CONCURRENT_RUNS_ENV: &str = "RELAY_MAX_CONCURRENT_RUNS";

pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 16;

/// Process-level settings shared by intake, the registry and the run engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    pub database_path: Option<PathBuf>,
    pub default_polling_interval: Duration,
    /// Payment floor for specs that do not set their own.
    pub default_min_payment: Option<Payment>,
    /// Upper bound on a single step; `None` lets steps run until cancelled.
    pub task_timeout: Option<Duration>,
    pub max_concurrent_runs: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            default_polling_interval: DEFAULT_FLUX_POLLING_INTERVAL,
            default_min_payment: None,
            task_timeout: None,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or blank keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let mut config = Self::default();

        if let Some(path) = value(DATABASE_PATH_ENV) {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = value(FLUX_POLLING_INTERVAL_ENV) {
            let seconds: u64 = parse_setting(FLUX_POLLING_INTERVAL_ENV, &raw)?;
            if seconds == 0 {
                return Err(CoreError::invalid_input(format!(
                    "{FLUX_POLLING_INTERVAL_ENV} must be greater than zero"
                )));
            }
            config.default_polling_interval = Duration::from_secs(seconds);
        }
        if let Some(raw) = value(MINIMUM_CONTRACT_PAYMENT_ENV) {
            config.default_min_payment = Some(parse_setting(MINIMUM_CONTRACT_PAYMENT_ENV, &raw)?);
        }
        if let Some(raw) = value(TASK_TIMEOUT_ENV) {
            let seconds: u64 = parse_setting(TASK_TIMEOUT_ENV, &raw)?;
            config.task_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        }
        if let Some(raw) = value(MAX_CONCURRENT_RUNS_ENV) {
            let limit: usize = parse_setting(MAX_CONCURRENT_RUNS_ENV, &raw)?;
            if limit == 0 {
                return Err(CoreError::invalid_input(format!(
                    "{MAX_CONCURRENT_RUNS_ENV} must be greater than zero"
                )));
            }
            config.max_concurrent_runs = limit;
        }

        Ok(config)
    }

    pub fn initiator_defaults(&self) -> InitiatorDefaults {
        InitiatorDefaults {
            polling_interval: self.default_polling_interval,
        }
    }
}

fn parse_setting<T>(key: &str, raw: &str) -> CoreResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|error| CoreError::invalid_input(format!("invalid value '{raw}' for {key}: {error}")))
}
