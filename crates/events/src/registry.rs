//! Startup-time table of subscribers.
//!
//! Two ways in:
//! - [`SubscriberRegistry::register`] for subscribers wired in code. Their
//!   descriptors are validated up front and a bad one is a startup error.
//! - [`SubscriberRegistry::register_plugin`] for optional modules resolved
//!   lazily. These keep the skip-and-log policy: a bad descriptor is dropped
//!   with a warning at registration, and a resolver failure (or an instance
//!   that disagrees with its registered descriptor) is skipped at dispatch.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::subscriber::{IntegrationEventSubscriber, SubscriberDescriptor};

/// A plugin resolver could not produce a usable subscriber.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ResolveError(String);

impl ResolveError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid subscriber descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("subscriber '{0}' is already registered")]
    DuplicateSubscriber(String),
}

type Resolver =
    dyn Fn() -> Result<Arc<dyn IntegrationEventSubscriber>, ResolveError> + Send + Sync;

enum Source {
    Static(Arc<dyn IntegrationEventSubscriber>),
    Plugin(Arc<Resolver>),
}

/// One entry of the registry, in registration order.
pub struct RegisteredSubscriber {
    descriptor: SubscriberDescriptor,
    source: Source,
}

impl RegisteredSubscriber {
    pub fn descriptor(&self) -> &SubscriberDescriptor {
        &self.descriptor
    }

    pub fn is_plugin(&self) -> bool {
        matches!(self.source, Source::Plugin(_))
    }

    /// Produce the live instance for this entry.
    pub(crate) fn resolve(&self) -> Result<Arc<dyn IntegrationEventSubscriber>, ResolveError> {
        match &self.source {
            Source::Static(subscriber) => Ok(Arc::clone(subscriber)),
            Source::Plugin(resolver) => {
                let subscriber = resolver()?;
                let actual = subscriber.descriptor();
                let expected = &self.descriptor;
                if actual.subscriber_name != expected.subscriber_name
                    || actual.event_name != expected.event_name
                    || actual.event_version != expected.event_version
                {
                    return Err(ResolveError::new(format!(
                        "resolved instance describes '{}' on {}@{:?}, registered as '{}' on {}@{:?}",
                        actual.subscriber_name,
                        actual.event_name,
                        actual.event_version,
                        expected.subscriber_name,
                        expected.event_name,
                        expected.event_version,
                    )));
                }
                Ok(subscriber)
            }
        }
    }
}

impl fmt::Debug for RegisteredSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSubscriber")
            .field("descriptor", &self.descriptor)
            .field("plugin", &self.is_plugin())
            .finish()
    }
}

/// Ordered list of subscribers, built once at process start.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    entries: Vec<RegisteredSubscriber>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber wired in code.
    pub fn register(
        mut self,
        subscriber: Arc<dyn IntegrationEventSubscriber>,
    ) -> Result<Self, RegistryError> {
        let descriptor = subscriber.descriptor();
        descriptor
            .validate()
            .map_err(RegistryError::InvalidDescriptor)?;
        if self.contains(&descriptor.subscriber_name) {
            return Err(RegistryError::DuplicateSubscriber(descriptor.subscriber_name));
        }
        self.entries.push(RegisteredSubscriber {
            descriptor,
            source: Source::Static(subscriber),
        });
        Ok(self)
    }

    /// Register a subscriber supplied by an optional module.
    ///
    /// `resolver` runs on every dispatch that matches `descriptor`.
    pub fn register_plugin<F>(mut self, descriptor: SubscriberDescriptor, resolver: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn IntegrationEventSubscriber>, ResolveError>
            + Send
            + Sync
            + 'static,
    {
        if let Err(reason) = descriptor.validate() {
            warn!(
                subscriber = %descriptor.subscriber_name,
                event_name = %descriptor.event_name,
                %reason,
                "skipping plugin subscriber with invalid descriptor"
            );
            return self;
        }
        if self.contains(&descriptor.subscriber_name) {
            warn!(
                subscriber = %descriptor.subscriber_name,
                "skipping plugin subscriber with duplicate name"
            );
            return self;
        }
        self.entries.push(RegisteredSubscriber {
            descriptor,
            source: Source::Plugin(Arc::new(resolver)),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSubscriber> {
        self.entries.iter()
    }

    fn contains(&self, subscriber_name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.descriptor.subscriber_name == subscriber_name)
    }

    pub(crate) fn into_entries(self) -> Vec<RegisteredSubscriber> {
        self.entries
    }
}
