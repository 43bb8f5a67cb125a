//! Retry scheduling: the backoff curve and the failed/dead decision.
//!
//! Both the claimer (subscriber failure) and the reaper (stale row) go through
//! [`RetryPolicy::on_failure`], so an outbox row follows one state machine no
//! matter who observed the failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Upper bound on the delay between two delivery attempts.
pub const MAX_DELAY_SECONDS: u64 = 300;

/// Environment variable read by [`RetryBudget::from_env_default`].
pub const MAX_RETRY_COUNT_ENV: &str = "OUTBOX_MAX_RETRY_COUNT";

/// Retry budget used when nothing is configured.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;

/// `min(2^retry_count, 300)` seconds. Deterministic, no jitter.
pub fn next_delay_seconds(retry_count: u32) -> u64 {
    2u64.checked_pow(retry_count)
        .map_or(MAX_DELAY_SECONDS, |d| d.min(MAX_DELAY_SECONDS))
}

/// Outcome of a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTransition {
    /// Back to `failed`, eligible again at `next_retry_at`.
    Retry {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Budget exhausted: `dead` plus a dead-letter record.
    DeadLetter,
}

/// Failed/dead decision for a fixed retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retry_count: u32,
}

impl RetryPolicy {
    pub fn new(max_retry_count: u32) -> Self {
        Self { max_retry_count }
    }

    /// Decide what happens to a row that just failed with `retry_count` prior retries.
    ///
    /// The delay is taken from the count *before* incrementing, so the first
    /// retry waits 1s.
    pub fn on_failure(&self, retry_count: u32, now: DateTime<Utc>) -> FailureTransition {
        if retry_count.saturating_add(1) >= self.max_retry_count {
            return FailureTransition::DeadLetter;
        }
        let delay = chrono::Duration::seconds(next_delay_seconds(retry_count) as i64);
        FailureTransition::Retry {
            retry_count: retry_count + 1,
            next_retry_at: now + delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRY_COUNT)
    }
}

/// Where the retry budget comes from.
///
/// `FromEnv` is re-read on every [`RetryBudget::current`] call so operators can
/// tune it on a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryBudget {
    Fixed(u32),
    FromEnv { var: String, default: u32 },
}

impl RetryBudget {
    /// `OUTBOX_MAX_RETRY_COUNT`, defaulting to 10.
    pub fn from_env_default() -> Self {
        Self::FromEnv {
            var: MAX_RETRY_COUNT_ENV.to_string(),
            default: DEFAULT_MAX_RETRY_COUNT,
        }
    }

    pub fn current(&self) -> RetryPolicy {
        self.current_from(|var| std::env::var(var).ok())
    }

    /// [`Self::current`] with an explicit variable lookup.
    pub fn current_from<F>(&self, lookup: F) -> RetryPolicy
    where
        F: Fn(&str) -> Option<String>,
    {
        match self {
            Self::Fixed(max) => RetryPolicy::new(*max),
            Self::FromEnv { var, default } => {
                let max = match lookup(var) {
                    Some(raw) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
                        warn!(var = %var, value = %raw, default, "ignoring malformed retry budget");
                        *default
                    }),
                    None => *default,
                };
                RetryPolicy::new(max)
            }
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::from_env_default()
    }
}
