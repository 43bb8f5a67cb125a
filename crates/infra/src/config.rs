//! Outbox pipeline configuration, read from the process environment.

use std::time::Duration;

use thiserror::Error;

use crate::outbox::retry::{DEFAULT_MAX_RETRY_COUNT, MAX_RETRY_COUNT_ENV, RetryBudget};

pub const SERVICE_NAME_ENV: &str = "OUTBOX_SERVICE_NAME";
pub const STALE_AFTER_ENV: &str = "OUTBOX_STALE_AFTER_MS";
pub const SUBSCRIBER_TIMEOUT_ENV: &str = "OUTBOX_SUBSCRIBER_TIMEOUT_MS";
pub const CLAIM_BATCH_SIZE_ENV: &str = "OUTBOX_CLAIM_BATCH_SIZE";
pub const REAP_BATCH_SIZE_ENV: &str = "OUTBOX_REAP_BATCH_SIZE";
pub const POLL_INTERVAL_ENV: &str = "OUTBOX_POLL_INTERVAL_MS";
pub const REAP_INTERVAL_ENV: &str = "OUTBOX_REAP_INTERVAL_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Default `source` of built envelopes.
    pub service_name: String,
    /// A `processing` row not heartbeated for this long is reclaimed by the reaper.
    pub stale_after: Duration,
    /// Re-read on every failure decision when sourced from the environment.
    pub max_retry_count: RetryBudget,
    pub default_subscriber_timeout: Duration,
    pub claim_batch_size: usize,
    pub reap_batch_size: usize,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            service_name: "courier".to_string(),
            stale_after: Duration::from_millis(300_000),
            max_retry_count: RetryBudget::FromEnv {
                var: MAX_RETRY_COUNT_ENV.to_string(),
                default: DEFAULT_MAX_RETRY_COUNT,
            },
            default_subscriber_timeout: Duration::from_millis(30_000),
            claim_batch_size: 50,
            reap_batch_size: 100,
            poll_interval: Duration::from_millis(500),
            reap_interval: Duration::from_millis(30_000),
        }
    }
}

impl OutboxConfig {
    /// Defaults overridden by whichever `OUTBOX_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |var: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(&lookup, var)?.map_or(default, Duration::from_millis))
        };
        let count = |var: &str, default: usize| -> Result<usize, ConfigError> {
            Ok(parse(&lookup, var)?.unwrap_or(default))
        };

        Ok(Self {
            service_name: lookup(SERVICE_NAME_ENV)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.service_name),
            stale_after: millis(STALE_AFTER_ENV, defaults.stale_after)?,
            max_retry_count: defaults.max_retry_count,
            default_subscriber_timeout: millis(
                SUBSCRIBER_TIMEOUT_ENV,
                defaults.default_subscriber_timeout,
            )?,
            claim_batch_size: count(CLAIM_BATCH_SIZE_ENV, defaults.claim_batch_size)?,
            reap_batch_size: count(REAP_BATCH_SIZE_ENV, defaults.reap_batch_size)?,
            poll_interval: millis(POLL_INTERVAL_ENV, defaults.poll_interval)?,
            reap_interval: millis(REAP_INTERVAL_ENV, defaults.reap_interval)?,
        })
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_max_retry_count(mut self, budget: RetryBudget) -> Self {
        self.max_retry_count = budget;
        self
    }
}

fn parse<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var: var.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = OutboxConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OutboxConfig::default());
        assert_eq!(config.default_subscriber_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn variables_override_defaults() {
        let config = OutboxConfig::from_lookup(lookup(&[
            (SERVICE_NAME_ENV, "orders"),
            (STALE_AFTER_ENV, "60000"),
            (CLAIM_BATCH_SIZE_ENV, "10"),
        ]))
        .unwrap();
        assert_eq!(config.service_name, "orders");
        assert_eq!(config.stale_after, Duration::from_secs(60));
        assert_eq!(config.claim_batch_size, 10);
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = OutboxConfig::from_lookup(lookup(&[(REAP_INTERVAL_ENV, "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: REAP_INTERVAL_ENV.to_string(),
                value: "soon".to_string(),
            }
        );
    }
}
