//! Type-safe configuration loaded from the environment.
//!
//! Every tunable is a `nutype` newtype validated at construction, so a
//! `OrderCoreConfig` that exists is a `OrderCoreConfig` that is usable.

use std::str::FromStr;
use std::time::Duration;

use nutype::nutype;
use ordercore_types::QueueName;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Maximum number of attempts for one activity or store call.
///
/// Validated to be between 1 and 10 attempts to prevent infinite loops
/// while allowing reasonable retry behavior.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetryAttempts(u32);

/// Base delay between retry attempts in milliseconds.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// Convert to Duration for use with `tokio::time::sleep`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Maximum delay between retry attempts in milliseconds.
///
/// Validated to be between 100ms and 5 minutes to prevent excessive
/// delays while allowing reasonable exponential backoff.
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

impl RetryMaxDelayMs {
    /// Convert to Duration for use with `tokio::time::sleep`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Exponential backoff multiplier for retry delays.
#[nutype(
    validate(greater_or_equal = 1.1, less_or_equal = 3.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Serialize, Deserialize)
)]
pub struct BackoffMultiplier(f64);

/// How long an idle dispatch worker waits before polling again.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 60_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct PollIntervalMs(u64);

impl PollIntervalMs {
    /// Convert to Duration for use with `tokio::time::sleep`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Upper bound on deliveries a dispatch worker processes at once.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxInFlight(usize);

/// Names of the two queues the system uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    /// Dispatch messages from intake.
    pub to_process: QueueName,
    /// Outcome messages for downstream consumers.
    pub processed: QueueName,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            to_process: QueueName::try_new(DEFAULT_QUEUE_TO_PROCESS)
                .expect("default queue name is valid"),
            processed: QueueName::try_new(DEFAULT_QUEUE_PROCESSED)
                .expect("default queue name is valid"),
        }
    }
}

/// Dispatch worker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Pause after an empty receive.
    pub poll_interval: PollIntervalMs,
    /// Deliveries handled concurrently.
    pub max_in_flight: MaxInFlight,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: PollIntervalMs::try_new(DEFAULT_POLL_INTERVAL_MS)
                .expect("default poll interval is valid"),
            max_in_flight: MaxInFlight::try_new(DEFAULT_MAX_IN_FLIGHT)
                .expect("default in-flight bound is valid"),
        }
    }
}

const DEFAULT_QUEUE_TO_PROCESS: &str = "orders-to-process";
const DEFAULT_QUEUE_PROCESSED: &str = "orders-processed";
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Complete runtime configuration of the engine.
#[derive(Debug, Clone, Default)]
pub struct OrderCoreConfig {
    /// Policy every activity and store call is retried under.
    pub retry: RetryPolicy,
    pub queues: QueueNames,
    /// Dispatch worker tuning.
    pub worker: WorkerConfig,
}

/// A configuration variable was present but unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{variable} is invalid: {detail}")]
pub struct ConfigError {
    /// Environment variable name.
    pub variable: &'static str,
    /// Why the value was rejected.
    pub detail: String,
}

impl OrderCoreConfig {
    /// Load from process environment variables, falling back to defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable source.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_attempts = parse_var(
            &lookup,
            "ORDERCORE_RETRY_MAX_ATTEMPTS",
            defaults.retry.max_attempts(),
            MaxRetryAttempts::try_new,
        )?;
        let base_delay = parse_var(
            &lookup,
            "ORDERCORE_RETRY_BASE_DELAY_MS",
            defaults.retry.base_delay(),
            RetryBaseDelayMs::try_new,
        )?;
        let max_delay = parse_var(
            &lookup,
            "ORDERCORE_RETRY_MAX_DELAY_MS",
            defaults.retry.max_delay(),
            RetryMaxDelayMs::try_new,
        )?;
        let multiplier = parse_var(
            &lookup,
            "ORDERCORE_RETRY_BACKOFF_MULTIPLIER",
            defaults.retry.multiplier(),
            BackoffMultiplier::try_new,
        )?;
        if u64::from(max_delay) < u64::from(base_delay) {
            return Err(ConfigError {
                variable: "ORDERCORE_RETRY_MAX_DELAY_MS",
                detail: "must not be lower than ORDERCORE_RETRY_BASE_DELAY_MS".to_string(),
            });
        }

        let queues = QueueNames {
            to_process: parse_var(
                &lookup,
                "ORDERCORE_QUEUE_TO_PROCESS",
                defaults.queues.to_process,
                |raw: String| QueueName::try_new(raw),
            )?,
            processed: parse_var(
                &lookup,
                "ORDERCORE_QUEUE_PROCESSED",
                defaults.queues.processed,
                |raw: String| QueueName::try_new(raw),
            )?,
        };
        if queues.to_process == queues.processed {
            return Err(ConfigError {
                variable: "ORDERCORE_QUEUE_PROCESSED",
                detail: "must differ from ORDERCORE_QUEUE_TO_PROCESS".to_string(),
            });
        }

        let worker = WorkerConfig {
            poll_interval: parse_var(
                &lookup,
                "ORDERCORE_WORKER_POLL_INTERVAL_MS",
                defaults.worker.poll_interval,
                PollIntervalMs::try_new,
            )?,
            max_in_flight: parse_var(
                &lookup,
                "ORDERCORE_WORKER_MAX_IN_FLIGHT",
                defaults.worker.max_in_flight,
                MaxInFlight::try_new,
            )?,
        };

        Ok(Self {
            retry: RetryPolicy::new(max_attempts, base_delay, max_delay, multiplier),
            queues,
            worker,
        })
    }
}

fn parse_var<L, R, T, E>(
    lookup: &L,
    variable: &'static str,
    default: T,
    build: impl FnOnce(R) -> Result<T, E>,
) -> Result<T, ConfigError>
where
    L: Fn(&str) -> Option<String>,
    R: FromStr,
    R::Err: std::fmt::Display,
    E: std::fmt::Display,
{
    let Some(raw) = lookup(variable) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<R>().map_err(|error| ConfigError {
        variable,
        detail: format!("`{raw}` does not parse: {error}"),
    })?;

    build(parsed).map_err(|error| ConfigError {
        variable,
        detail: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = OrderCoreConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(u32::from(config.retry.max_attempts()), 3);
        assert_eq!(config.queues.to_process.as_ref(), "orders-to-process");
        assert_eq!(config.queues.processed.as_ref(), "orders-processed");
        assert_eq!(
            config.worker.poll_interval.as_duration(),
            Duration::from_millis(250)
        );
        assert_eq!(usize::from(config.worker.max_in_flight), 16);
    }

    #[test]
    fn overrides_are_applied() {
        let config = OrderCoreConfig::from_lookup(lookup_from(&[
            ("ORDERCORE_RETRY_MAX_ATTEMPTS", "5"),
            ("ORDERCORE_QUEUE_PROCESSED", "results"),
            ("ORDERCORE_WORKER_MAX_IN_FLIGHT", "2"),
        ]))
        .unwrap();

        assert_eq!(u32::from(config.retry.max_attempts()), 5);
        assert_eq!(config.queues.processed.as_ref(), "results");
        assert_eq!(usize::from(config.worker.max_in_flight), 2);
    }

    #[test]
    fn out_of_range_value_names_the_variable() {
        let error =
            OrderCoreConfig::from_lookup(lookup_from(&[("ORDERCORE_RETRY_MAX_ATTEMPTS", "11")]))
                .unwrap_err();

        assert_eq!(error.variable, "ORDERCORE_RETRY_MAX_ATTEMPTS");
    }

    #[test]
    fn unparsable_value_is_rejected() {
        let error = OrderCoreConfig::from_lookup(lookup_from(&[(
            "ORDERCORE_RETRY_BACKOFF_MULTIPLIER",
            "fast",
        )]))
        .unwrap_err();

        assert_eq!(error.variable, "ORDERCORE_RETRY_BACKOFF_MULTIPLIER");
        assert!(error.detail.contains("fast"));
    }

    #[test]
    fn identical_queue_names_are_rejected() {
        let error = OrderCoreConfig::from_lookup(lookup_from(&[
            ("ORDERCORE_QUEUE_TO_PROCESS", "orders"),
            ("ORDERCORE_QUEUE_PROCESSED", "orders"),
        ]))
        .unwrap_err();

        assert_eq!(error.variable, "ORDERCORE_QUEUE_PROCESSED");
    }
}
