//! Outbox storage abstractions.
//!
//! - [`OutboxWriter`] is the producer side: it writes into the caller's own
//!   transaction, so the event commits or rolls back with the business change.
//! - [`OutboxStore`] is the worker side: claiming, outcome bookkeeping, stale
//!   row recovery and the operator surface.
//!
//! The caller must hand `insert` the *same* transaction as its business write.
//! Passing some other transaction compiles, and silently breaks the guarantee.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{EventId, TenantId};
use courier_events::IntegrationEventEnvelope;

use super::record::{DeadLetterRecord, OutboxRecord, OutboxStats};
use super::retry::{FailureTransition, RetryPolicy};

/// Outbox storage error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxStoreError {
    /// A row with this event id already exists; the envelope was enqueued twice.
    #[error("event already enqueued: {0}")]
    Duplicate(EventId),

    /// The transaction handle was not opened on this store.
    #[error("transaction does not belong to this outbox store")]
    ForeignTransaction,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for OutboxStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Producer-side insert into a caller-owned transaction of type `Tx`.
#[async_trait]
pub trait OutboxWriter<Tx: Send>: Send + Sync {
    /// Stage a `pending` row for `envelope` inside `tx`.
    async fn insert(
        &self,
        tx: &mut Tx,
        envelope: &IntegrationEventEnvelope,
    ) -> Result<(), OutboxStoreError>;
}

/// Worker-side outbox operations.
///
/// Every mutating call is a single-row (or single-batch) atomic transition and
/// must never hand the same row to two concurrent callers.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due rows, oldest first, flipping them to `processing`.
    async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError>;

    /// Refresh `updated_at` of a row still in `processing`.
    ///
    /// Returns `false` when the row has left `processing` (e.g. reclaimed).
    async fn heartbeat(&self, event_id: EventId, now: DateTime<Utc>)
    -> Result<bool, OutboxStoreError>;

    /// Delete a delivered row. Returns `false` if it was no longer `processing`.
    async fn complete(&self, event_id: EventId) -> Result<bool, OutboxStoreError>;

    /// Record a failed delivery of a `processing` row.
    ///
    /// Returns `None` when the row is gone, no longer `processing`, or locked
    /// by a concurrent reaper.
    async fn record_failure(
        &self,
        event_id: EventId,
        error: &str,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureTransition>, OutboxStoreError>;

    /// Reclaim up to `limit` rows stuck in `processing` since before `stale_before`.
    ///
    /// Returns the number of rows transitioned. Zero eligible rows writes nothing.
    async fn reclaim_stale(
        &self,
        limit: usize,
        stale_before: DateTime<Utc>,
        policy: RetryPolicy,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError>;

    /// Dead letters of one tenant, newest first.
    async fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, OutboxStoreError>;

    /// Operator action: move a `dead` row back to `pending` with a fresh budget.
    ///
    /// The dead-letter record is kept.
    async fn requeue_dead(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        (**self).claim_due(limit, now).await
    }

    async fn heartbeat(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        (**self).heartbeat(event_id, now).await
    }

    async fn complete(&self, event_id: EventId) -> Result<bool, OutboxStoreError> {
        (**self).complete(event_id).await
    }

    async fn record_failure(
        &self,
        event_id: EventId,
        error: &str,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureTransition>, OutboxStoreError> {
        (**self).record_failure(event_id, error, policy, now).await
    }

    async fn reclaim_stale(
        &self,
        limit: usize,
        stale_before: DateTime<Utc>,
        policy: RetryPolicy,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        (**self)
            .reclaim_stale(limit, stale_before, policy, error, now)
            .await
    }

    async fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, OutboxStoreError> {
        (**self).list_dead_letters(tenant_id, limit).await
    }

    async fn requeue_dead(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        (**self).requeue_dead(event_id, now).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }
}
