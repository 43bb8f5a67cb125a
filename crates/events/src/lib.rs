//! Integration events: the envelope, how it is built, and how it is delivered
//! to in-process subscribers.
//!
//! Persistence and scheduling live in `courier-infra`; this crate has no
//! notion of a database.

pub mod builder;
pub mod dispatcher;
pub mod envelope;
pub mod registry;
pub mod subscriber;
pub mod tenant;

pub use builder::{EnvelopeBuilder, EnvelopeError, EventDraft};
pub use dispatcher::{DEFAULT_SUBSCRIBER_TIMEOUT, DispatchError, SubscriberDispatcher};
pub use envelope::{Classification, IntegrationEventEnvelope};
pub use registry::{RegisteredSubscriber, RegistryError, ResolveError, SubscriberRegistry};
pub use subscriber::{IntegrationEventSubscriber, SubscriberDescriptor, SubscriberError};
pub use tenant::TenantScoped;
