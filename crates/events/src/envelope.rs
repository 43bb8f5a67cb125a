use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{EventId, RequestId, TenantId, UserId};

/// Data-sensitivity label carried by an envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Public,
    Internal,
    Pii,
}

/// Envelope for an integration event, stamped with identity and provenance.
///
/// This is the unit written to the outbox and handed to subscribers.
///
/// Notes:
/// - **Immutable**: only [`crate::EnvelopeBuilder`] constructs one; fields are read through getters.
/// - **Tenant-scoped**: `tenant_id` is always present.
/// - `partition_key` defaults to the tenant id and groups related events for consumers.
/// - `data` is the event-specific body (defaults to an empty JSON object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEventEnvelope {
    event_id: EventId,
    event_name: String,
    event_version: u32,

    tenant_id: TenantId,
    partition_key: String,

    occurred_at: DateTime<Utc>,
    source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    classification: Option<Classification>,

    #[serde(default = "empty_object")]
    data: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Field bag used by the builder; keeps the envelope's constructor private.
pub(crate) struct EnvelopeParts {
    pub event_id: EventId,
    pub event_name: String,
    pub event_version: u32,
    pub tenant_id: TenantId,
    pub partition_key: String,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub actor_id: Option<UserId>,
    pub request_id: Option<RequestId>,
    pub locale: Option<String>,
    pub classification: Option<Classification>,
    pub data: Option<serde_json::Value>,
}

impl IntegrationEventEnvelope {
    pub(crate) fn from_parts(parts: EnvelopeParts) -> Self {
        Self {
            event_id: parts.event_id,
            event_name: parts.event_name,
            event_version: parts.event_version,
            tenant_id: parts.tenant_id,
            partition_key: parts.partition_key,
            occurred_at: parts.occurred_at,
            source: parts.source,
            actor_id: parts.actor_id,
            request_id: parts.request_id,
            locale: parts.locale,
            classification: parts.classification,
            data: parts.data.unwrap_or_else(empty_object),
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn actor_id(&self) -> Option<&UserId> {
        self.actor_id.as_ref()
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn classification(&self) -> Option<Classification> {
        self.classification
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Serialize the full envelope, as persisted in the outbox `payload` column.
    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decode an envelope previously produced by [`Self::to_payload`].
    pub fn from_payload(payload: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload)
    }
}
