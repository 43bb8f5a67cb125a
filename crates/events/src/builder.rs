//! Envelope construction from a caller's draft plus the request's identity.
//!
//! Building is pure: the only inputs are the draft, the [`IdentityContext`]
//! and the clock. Every call mints a fresh `EventId`; redelivery reuses the
//! stored envelope, never a rebuilt one.

use chrono::Utc;
use thiserror::Error;

use courier_core::{EventId, IdentityContext};

use crate::envelope::{Classification, EnvelopeParts, IntegrationEventEnvelope};

/// Envelope construction failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The identity context carried no tenant; tenant isolation downstream depends on it.
    #[error("cannot build integration event '{event_name}': identity context has no tenant")]
    MissingTenant { event_name: String },

    #[error("invalid event name: {0:?}")]
    InvalidEventName(String),

    #[error("invalid version {version} for event '{event_name}': versions start at 1")]
    InvalidEventVersion { event_name: String, version: u32 },
}

/// What the producer wants to emit, before identity and provenance are stamped on.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    event_name: String,
    event_version: u32,
    data: Option<serde_json::Value>,
    partition_key: Option<String>,
    classification: Option<Classification>,
    source: Option<String>,
}

impl EventDraft {
    pub fn new(event_name: impl Into<String>, event_version: u32) -> Self {
        Self {
            event_name: event_name.into(),
            event_version,
            data: None,
            partition_key: None,
            classification: None,
            source: None,
        }
    }

    /// Event body. Keep it minimal; reference records by id instead of embedding them.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Override the partition key (defaults to the tenant id).
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    /// Override the producing service (defaults to the builder's service name).
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }
}

/// Stamps drafts into [`IntegrationEventEnvelope`]s for one producing service.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    service_name: String,
}

impl EnvelopeBuilder {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Build an envelope for `draft` on behalf of `ctx`.
    ///
    /// Fails with [`EnvelopeError::MissingTenant`] when `ctx` has no tenant.
    pub fn build(
        &self,
        ctx: &IdentityContext,
        draft: EventDraft,
    ) -> Result<IntegrationEventEnvelope, EnvelopeError> {
        let Some(tenant_id) = ctx.require_tenant().cloned() else {
            return Err(EnvelopeError::MissingTenant {
                event_name: draft.event_name,
            });
        };
        if draft.event_name.trim().is_empty() {
            return Err(EnvelopeError::InvalidEventName(draft.event_name));
        }
        if draft.event_version == 0 {
            return Err(EnvelopeError::InvalidEventVersion {
                event_name: draft.event_name,
                version: draft.event_version,
            });
        }

        let partition_key = draft
            .partition_key
            .unwrap_or_else(|| tenant_id.as_str().to_string());
        let source = draft.source.unwrap_or_else(|| self.service_name.clone());

        Ok(IntegrationEventEnvelope::from_parts(EnvelopeParts {
            event_id: EventId::new(),
            event_name: draft.event_name,
            event_version: draft.event_version,
            tenant_id,
            partition_key,
            occurred_at: Utc::now(),
            source,
            actor_id: ctx.user_id.clone(),
            request_id: ctx.request_id.clone(),
            locale: ctx.locale.clone(),
            classification: draft.classification,
            data: draft.data,
        }))
    }
}
