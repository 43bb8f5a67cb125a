//! The subscriber contract.
//!
//! Delivery is **at-least-once**: a retry redelivers the full envelope to every
//! matched subscriber, including ones that succeeded on an earlier attempt.
//! Subscribers must be idempotent.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::IntegrationEventEnvelope;

/// Failure reported by a subscriber's `handle`.
///
/// Opaque on purpose: the dispatcher only needs the message for `last_error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SubscriberError {
    message: String,
}

impl SubscriberError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Capture any error, including its cause chain.
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error,
    {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for SubscriberError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
        }
    }
}

/// Static description of what a subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberDescriptor {
    pub subscriber_name: String,
    pub event_name: String,
    /// `None` matches every version of `event_name`.
    pub event_version: Option<u32>,
    /// Per-subscriber override of the dispatcher's default timeout.
    pub timeout: Option<Duration>,
}

impl SubscriberDescriptor {
    pub fn new(subscriber_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            subscriber_name: subscriber_name.into(),
            event_name: event_name.into(),
            event_version: None,
            timeout: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.event_version = Some(version);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The matching rule: same event name, and either no version (wildcard)
    /// or exactly the envelope's version.
    pub fn matches(&self, event_name: &str, event_version: u32) -> bool {
        self.event_name == event_name && self.event_version.is_none_or(|v| v == event_version)
    }

    /// Structural validity: names must be non-blank and a pinned version must be >= 1.
    pub fn validate(&self) -> Result<(), String> {
        if self.subscriber_name.trim().is_empty() {
            return Err("subscriber name is empty".to_string());
        }
        if self.event_name.trim().is_empty() {
            return Err(format!(
                "subscriber '{}' has an empty event name",
                self.subscriber_name
            ));
        }
        if self.event_version == Some(0) {
            return Err(format!(
                "subscriber '{}' pins event version 0",
                self.subscriber_name
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(format!(
                "subscriber '{}' has a zero timeout",
                self.subscriber_name
            ));
        }
        Ok(())
    }
}

/// In-process consumer of integration events.
#[async_trait]
pub trait IntegrationEventSubscriber: Send + Sync + 'static {
    fn descriptor(&self) -> SubscriberDescriptor;

    /// Handle one envelope. Runs inside a `subscriber` tracing span carrying
    /// the subscriber name and the envelope's identity.
    async fn handle(&self, envelope: &IntegrationEventEnvelope) -> Result<(), SubscriberError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unversioned_descriptor_matches_any_version() {
        let d = SubscriberDescriptor::new("audit", "order.placed");
        assert!(d.matches("order.placed", 1));
        assert!(d.matches("order.placed", 7));
        assert!(!d.matches("order.cancelled", 1));
    }

    #[test]
    fn pinned_descriptor_matches_exact_version_only() {
        let d = SubscriberDescriptor::new("billing", "order.placed").with_version(2);
        assert!(d.matches("order.placed", 2));
        assert!(!d.matches("order.placed", 1));
        assert!(!d.matches("order.placed", 3));
    }

    #[test]
    fn validation_rejects_malformed_descriptors() {
        assert!(SubscriberDescriptor::new("", "order.placed").validate().is_err());
        assert!(SubscriberDescriptor::new("audit", " ").validate().is_err());
        assert!(
            SubscriberDescriptor::new("audit", "order.placed")
                .with_version(0)
                .validate()
                .is_err()
        );
        assert!(
            SubscriberDescriptor::new("audit", "order.placed")
                .with_timeout(Duration::from_millis(10))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn subscriber_error_keeps_cause_chain() {
        let err = anyhow::anyhow!("connection refused").context("publishing to search index");
        let err = SubscriberError::from(err);
        assert_eq!(err.message(), "publishing to search index: connection refused");
    }

    #[test]
    fn from_error_walks_std_sources() {
        #[derive(Debug, thiserror::Error)]
        #[error("indexing order-42 failed")]
        struct IndexFailed(#[source] std::io::Error);

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "search index timed out");
        let err = SubscriberError::from_error(IndexFailed(io));
        assert_eq!(err.message(), "indexing order-42 failed: search index timed out");

        let parse = "x1".parse::<u32>().unwrap_err();
        assert_eq!(
            SubscriberError::from_error(parse).message(),
            "invalid digit found in string"
        );
    }
}
