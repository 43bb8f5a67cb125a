//! Fan-out of one envelope to its matching subscribers.
//!
//! ## Semantics
//!
//! - **Ordered**: matched subscribers run one after another, in registration order.
//! - **Fail-fast**: the first failure (error, timeout, panic) stops the fan-out
//!   and is returned to the caller, which owns the outbox transition.
//! - **Per-subscriber timeout**: each `handle` races its own deadline; deadlines
//!   are not cumulative across the list.
//! - **No cancellation**: a timed-out handler keeps running in the background as
//!   a detached task. Only the await is abandoned.
//!
//! The dispatcher never touches the outbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{Instrument, debug, info_span, warn};

use crate::IntegrationEventEnvelope;
use crate::registry::{RegisteredSubscriber, SubscriberRegistry};
use crate::subscriber::{IntegrationEventSubscriber, SubscriberError};

/// Default per-subscriber timeout.
pub const DEFAULT_SUBSCRIBER_TIMEOUT: Duration = Duration::from_millis(30_000);

/// A delivery attempt failed at one subscriber.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("subscriber '{subscriber}' failed handling {event_name}@v{event_version}: {source}")]
    SubscriberFailed {
        subscriber: String,
        event_name: String,
        event_version: u32,
        #[source]
        source: SubscriberError,
    },

    #[error("subscriber '{subscriber}' timed out after {timeout_ms}ms handling {event_name}@v{event_version}")]
    Timeout {
        subscriber: String,
        event_name: String,
        event_version: u32,
        timeout_ms: u64,
    },

    #[error("subscriber '{subscriber}' panicked handling {event_name}@v{event_version}")]
    Panicked {
        subscriber: String,
        event_name: String,
        event_version: u32,
    },
}

impl DispatchError {
    /// Name of the subscriber that failed.
    pub fn subscriber(&self) -> &str {
        match self {
            Self::SubscriberFailed { subscriber, .. }
            | Self::Timeout { subscriber, .. }
            | Self::Panicked { subscriber, .. } => subscriber,
        }
    }
}

/// Delivers envelopes to the subscribers of a [`SubscriberRegistry`].
#[derive(Debug)]
pub struct SubscriberDispatcher {
    entries: Vec<RegisteredSubscriber>,
    /// event name -> entry positions, ascending (registration order).
    by_event: HashMap<String, Vec<usize>>,
    default_timeout: Duration,
}

impl SubscriberDispatcher {
    pub fn new(registry: SubscriberRegistry, default_timeout: Duration) -> Self {
        let entries = registry.into_entries();
        let mut by_event: HashMap<String, Vec<usize>> = HashMap::new();
        for (pos, entry) in entries.iter().enumerate() {
            by_event
                .entry(entry.descriptor().event_name.clone())
                .or_default()
                .push(pos);
        }
        Self {
            entries,
            by_event,
            default_timeout,
        }
    }

    /// A dispatcher with no subscribers; every dispatch is a no-op.
    pub fn empty() -> Self {
        Self::new(SubscriberRegistry::new(), DEFAULT_SUBSCRIBER_TIMEOUT)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Entries matching `(event_name, event_version)`, in registration order.
    pub fn matching(
        &self,
        event_name: &str,
        event_version: u32,
    ) -> impl Iterator<Item = &RegisteredSubscriber> {
        self.by_event
            .get(event_name)
            .into_iter()
            .flatten()
            .map(|&pos| &self.entries[pos])
            .filter(move |e| e.descriptor().matches(event_name, event_version))
    }

    /// Deliver `envelope` to every matching subscriber.
    ///
    /// Returns how many subscribers handled it. Entries that fail to resolve
    /// are logged and skipped, not counted.
    pub async fn dispatch(&self, envelope: &IntegrationEventEnvelope) -> Result<usize, DispatchError> {
        let event_name = envelope.event_name();
        let event_version = envelope.event_version();
        let mut delivered = 0;

        for entry in self.matching(event_name, event_version) {
            let descriptor = entry.descriptor();
            let subscriber = match entry.resolve() {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        subscriber = %descriptor.subscriber_name,
                        event_id = %envelope.event_id(),
                        event_name,
                        event_version,
                        error = %e,
                        "skipping subscriber that failed to resolve"
                    );
                    continue;
                }
            };

            let timeout = descriptor.timeout.unwrap_or(self.default_timeout);
            self.invoke(&descriptor.subscriber_name, subscriber, envelope, timeout)
                .await?;
            delivered += 1;
        }

        if delivered > 0 {
            debug!(event_id = %envelope.event_id(), event_name, event_version, delivered, "envelope dispatched");
        }
        Ok(delivered)
    }

    async fn invoke(
        &self,
        subscriber_name: &str,
        subscriber: Arc<dyn IntegrationEventSubscriber>,
        envelope: &IntegrationEventEnvelope,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let span = info_span!(
            "subscriber",
            subscriber = %subscriber_name,
            event_id = %envelope.event_id(),
            tenant_id = %envelope.tenant_id(),
            event_name = %envelope.event_name(),
            event_version = envelope.event_version(),
        );
        let owned = envelope.clone();
        let task = tokio::spawn(async move { subscriber.handle(&owned).await }.instrument(span));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(source))) => Err(DispatchError::SubscriberFailed {
                subscriber: subscriber_name.to_string(),
                event_name: envelope.event_name().to_string(),
                event_version: envelope.event_version(),
                source,
            }),
            Ok(Err(join_err)) => {
                warn!(subscriber = %subscriber_name, error = %join_err, "subscriber task aborted");
                Err(DispatchError::Panicked {
                    subscriber: subscriber_name.to_string(),
                    event_name: envelope.event_name().to_string(),
                    event_version: envelope.event_version(),
                })
            }
            // Dropping the JoinHandle detaches the task; it may still finish.
            Err(_elapsed) => Err(DispatchError::Timeout {
                subscriber: subscriber_name.to_string(),
                event_name: envelope.event_name().to_string(),
                event_version: envelope.event_version(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResolveError;
    use crate::subscriber::SubscriberDescriptor;
    use crate::{EnvelopeBuilder, EventDraft};
    use async_trait::async_trait;
    use courier_core::{IdentityContext, TenantId};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Succeed,
        Fail(&'static str),
        Hang,
        Panic,
    }

    struct Recording {
        descriptor: SubscriberDescriptor,
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl IntegrationEventSubscriber for Recording {
        fn descriptor(&self) -> SubscriberDescriptor {
            self.descriptor.clone()
        }

        async fn handle(&self, _: &IntegrationEventEnvelope) -> Result<(), SubscriberError> {
            self.log
                .lock()
                .unwrap()
                .push(self.descriptor.subscriber_name.clone());
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail(msg) => Err(SubscriberError::new(msg)),
                Behaviour::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                Behaviour::Panic => panic!("boom"),
            }
        }
    }

    fn subscriber(
        log: &Arc<Mutex<Vec<String>>>,
        descriptor: SubscriberDescriptor,
        behaviour: Behaviour,
    ) -> Arc<dyn IntegrationEventSubscriber> {
        Arc::new(Recording {
            descriptor,
            behaviour,
            log: Arc::clone(log),
        })
    }

    fn envelope(name: &str, version: u32) -> IntegrationEventEnvelope {
        EnvelopeBuilder::new("orders")
            .build(
                &IdentityContext::for_tenant(TenantId::new("t-001").unwrap()),
                EventDraft::new(name, version),
            )
            .unwrap()
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn dispatch_without_subscribers_is_a_noop() {
        let dispatcher = SubscriberDispatcher::empty();
        assert_eq!(dispatcher.dispatch(&envelope("order.placed", 1)).await, Ok(0));
    }

    #[tokio::test]
    async fn dispatch_without_matching_subscribers_is_a_noop() {
        let log = log();
        let registry = SubscriberRegistry::new()
            .register(subscriber(
                &log,
                SubscriberDescriptor::new("audit", "order.cancelled"),
                Behaviour::Succeed,
            ))
            .unwrap()
            .register(subscriber(
                &log,
                SubscriberDescriptor::new("billing", "order.placed").with_version(2),
                Behaviour::Succeed,
            ))
            .unwrap();
        let dispatcher = SubscriberDispatcher::new(registry, DEFAULT_SUBSCRIBER_TIMEOUT);

        assert_eq!(dispatcher.dispatch(&envelope("order.placed", 1)).await, Ok(0));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn matched_subscribers_run_in_registration_order() {
        let log = log();
        let registry = SubscriberRegistry::new()
            .register(subscriber(&log, SubscriberDescriptor::new("first", "order.placed"), Behaviour::Succeed))
            .unwrap()
            .register(subscriber(&log, SubscriberDescriptor::new("other", "order.cancelled"), Behaviour::Succeed))
            .unwrap()
            .register(subscriber(
                &log,
                SubscriberDescriptor::new("second", "order.placed").with_version(1),
                Behaviour::Succeed,
            ))
            .unwrap();
        let dispatcher = SubscriberDispatcher::new(registry, DEFAULT_SUBSCRIBER_TIMEOUT);

        assert_eq!(dispatcher.dispatch(&envelope("order.placed", 1)).await, Ok(2));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn first_failure_aborts_remaining_subscribers() {
        let log = log();
        let registry = SubscriberRegistry::new()
            .register(subscriber(&log, SubscriberDescriptor::new("a", "order.placed"), Behaviour::Succeed))
            .unwrap()
            .register(subscriber(&log, SubscriberDescriptor::new("b", "order.placed"), Behaviour::Fail("index down")))
            .unwrap()
            .register(subscriber(&log, SubscriberDescriptor::new("c", "order.placed"), Behaviour::Succeed))
            .unwrap();
        let dispatcher = SubscriberDispatcher::new(registry, DEFAULT_SUBSCRIBER_TIMEOUT);

        let err = dispatcher.dispatch(&envelope("order.placed", 1)).await.unwrap_err();

        assert_eq!(
            err,
            DispatchError::SubscriberFailed {
                subscriber: "b".to_string(),
                event_name: "order.placed".to_string(),
                event_version: 1,
                source: SubscriberError::new("index down"),
            }
        );
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn hanging_subscriber_times_out_with_its_name_and_event() {
        let log = log();
        let registry = SubscriberRegistry::new()
            .register(subscriber(
                &log,
                SubscriberDescriptor::new("slow", "order.placed")
                    .with_timeout(Duration::from_millis(20)),
                Behaviour::Hang,
            ))
            .unwrap()
            .register(subscriber(&log, SubscriberDescriptor::new("after", "order.placed"), Behaviour::Succeed))
            .unwrap();
        let dispatcher = SubscriberDispatcher::new(registry, DEFAULT_SUBSCRIBER_TIMEOUT);

        let err = dispatcher.dispatch(&envelope("order.placed", 3)).await.unwrap_err();

        assert_eq!(
            err,
            DispatchError::Timeout {
                subscriber: "slow".to_string(),
                event_name: "order.placed".to_string(),
                event_version: 3,
                timeout_ms: 20,
            }
        );
        let message = err.to_string();
        assert!(message.contains("slow") && message.contains("order.placed@v3"));
        assert_eq!(*log.lock().unwrap(), vec!["slow"]);
    }

    #[tokio::test]
    async fn default_timeout_applies_without_override() {
        let log = log();
        let registry = SubscriberRegistry::new()
            .register(subscriber(&log, SubscriberDescriptor::new("slow", "order.placed"), Behaviour::Hang))
            .unwrap();
        let dispatcher = SubscriberDispatcher::new(registry, Duration::from_millis(15));

        let err = dispatcher.dispatch(&envelope("order.placed", 1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { timeout_ms: 15, .. }));
    }

    #[tokio::test]
    async fn panicking_subscriber_is_a_failure() {
        let log = log();
        let registry = SubscriberRegistry::new()
            .register(subscriber(&log, SubscriberDescriptor::new("crashy", "order.placed"), Behaviour::Panic))
            .unwrap();
        let dispatcher = SubscriberDispatcher::new(registry, DEFAULT_SUBSCRIBER_TIMEOUT);

        let err = dispatcher.dispatch(&envelope("order.placed", 1)).await.unwrap_err();
        assert_eq!(err.subscriber(), "crashy");
        assert!(matches!(err, DispatchError::Panicked { .. }));
    }

    #[tokio::test]
    async fn unresolvable_plugin_is_skipped_and_the_rest_delivered() {
        let log = log();
        let resolutions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resolutions);
        let tail_log = Arc::clone(&log);

        let registry = SubscriberRegistry::new()
            .register_plugin(SubscriberDescriptor::new("crm", "order.placed"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ResolveError::new("crm module not installed"))
            })
            .register_plugin(SubscriberDescriptor::new("search", "order.placed"), move || {
                Ok(subscriber(
                    &tail_log,
                    SubscriberDescriptor::new("search", "order.placed"),
                    Behaviour::Succeed,
                ))
            });
        let dispatcher = SubscriberDispatcher::new(registry, DEFAULT_SUBSCRIBER_TIMEOUT);

        assert_eq!(dispatcher.dispatch(&envelope("order.placed", 1)).await, Ok(1));
        assert_eq!(resolutions.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec!["search"]);
    }
}
