//! Persisted shapes: the outbox row and its dead-letter copy.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{EventId, TenantId};
use courier_events::{IntegrationEventEnvelope, TenantScoped};

use super::retry::FailureTransition;

/// Delivery state of an outbox row.
///
/// `pending` and `failed` are the only claimable states; `dead` is terminal.
/// Successful delivery deletes the row, so there is no "done" state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Failed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dead)
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// One outbox row.
///
/// `payload` is the serialized envelope and is never rewritten; the columns
/// next to it are copies kept for querying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub event_name: String,
    pub event_version: u32,
    pub partition_key: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// A freshly enqueued row.
    pub fn pending(
        envelope: &IntegrationEventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: envelope.event_id(),
            tenant_id: envelope.tenant_id().clone(),
            event_name: envelope.event_name().to_string(),
            event_version: envelope.event_version(),
            partition_key: envelope.partition_key().to_string(),
            payload: envelope.to_payload()?,
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Decode the stored envelope.
    pub fn envelope(&self) -> Result<IntegrationEventEnvelope, serde_json::Error> {
        IntegrationEventEnvelope::from_payload(self.payload.clone())
    }

    /// Claimable now: `pending`/`failed` with no retry time or one that has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Still `processing` and not heartbeated since `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Processing && self.updated_at < stale_before
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.updated_at = now;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Apply a failure decision. The retry count is left as-is on `DeadLetter`.
    pub fn apply_failure(
        &mut self,
        transition: FailureTransition,
        error: &str,
        now: DateTime<Utc>,
    ) {
        match transition {
            FailureTransition::Retry {
                retry_count,
                next_retry_at,
            } => {
                self.status = OutboxStatus::Failed;
                self.retry_count = retry_count;
                self.next_retry_at = Some(next_retry_at);
            }
            FailureTransition::DeadLetter => {
                self.status = OutboxStatus::Dead;
            }
        }
        self.last_error = Some(error.to_string());
        self.updated_at = now;
    }

    /// Operator requeue of a dead row: back to `pending` with a fresh budget.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.last_error = None;
        self.updated_at = now;
    }
}

impl TenantScoped for OutboxRecord {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

/// Immutable copy of a permanently failed row, kept for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub event_name: String,
    pub event_version: u32,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub error: String,
    pub dead_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_record(record: &OutboxRecord, error: impl Into<String>, dead_at: DateTime<Utc>) -> Self {
        Self {
            event_id: record.event_id,
            tenant_id: record.tenant_id.clone(),
            event_name: record.event_name.clone(),
            event_version: record.event_version,
            payload: record.payload.clone(),
            retry_count: record.retry_count,
            error: error.into(),
            dead_at,
        }
    }
}

impl TenantScoped for DeadLetterRecord {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

/// Row counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    pub dead: usize,
    pub dead_letters: usize,
}
