//! Recovery of rows abandoned in `processing`.
//!
//! A row that stays `processing` past the staleness threshold lost its claimer
//! (crash, hang, lost connection). The reaper puts it back on the retry path, or
//! dead-letters it once the budget is spent. It only rewrites bookkeeping;
//! redelivery is the claimer's job.
//!
//! Safe to run many instances on a fixed interval: the store hands each stale
//! row to at most one of them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::outbox::{OutboxStore, OutboxStoreError, RetryBudget};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReaperError {
    #[error("staleness threshold out of range: {0:?}")]
    InvalidThreshold(Duration),

    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

#[derive(Debug, Clone)]
pub struct Reaper<S> {
    store: S,
    stale_after: Duration,
    retry: RetryBudget,
}

impl<S> Reaper<S>
where
    S: OutboxStore,
{
    pub fn new(store: S, stale_after: Duration, retry: RetryBudget) -> Self {
        Self {
            store,
            stale_after,
            retry,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Error recorded on every reclaimed row.
    pub fn stalled_error(&self) -> String {
        format!(
            "stalled in processing for more than {}ms",
            self.stale_after.as_millis()
        )
    }

    /// Reclaim up to `max_batch_size` stale rows. Returns how many were reclaimed.
    pub async fn reap_batch(&self, max_batch_size: usize) -> Result<usize, ReaperError> {
        self.reap_batch_at(max_batch_size, Utc::now()).await
    }

    /// [`Self::reap_batch`] against an explicit clock reading.
    pub async fn reap_batch_at(
        &self,
        max_batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, ReaperError> {
        if max_batch_size == 0 {
            return Ok(0);
        }
        let threshold = chrono::Duration::from_std(self.stale_after)
            .map_err(|_| ReaperError::InvalidThreshold(self.stale_after))?;
        let stale_before = now
            .checked_sub_signed(threshold)
            .ok_or(ReaperError::InvalidThreshold(self.stale_after))?;

        // Re-read per batch so the budget can be tuned on a live process.
        let policy = self.retry.current();
        let reclaimed = self
            .store
            .reclaim_stale(max_batch_size, stale_before, policy, &self.stalled_error(), now)
            .await?;

        if reclaimed > 0 {
            info!(
                count = reclaimed,
                max_retry_count = policy.max_retry_count,
                "reclaimed stale outbox rows"
            );
        } else {
            debug!("no stale outbox rows");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{InMemoryOutboxStore, OutboxStatus, OutboxWriter};
    use courier_core::{IdentityContext, TenantId};
    use courier_events::{EnvelopeBuilder, EventDraft, IntegrationEventEnvelope};

    const STALE_AFTER: Duration = Duration::from_secs(60);

    /// Store with one row claimed at `claimed_at`.
    async fn store_with_processing_row(
        claimed_at: DateTime<Utc>,
    ) -> (InMemoryOutboxStore, IntegrationEventEnvelope) {
        let store = InMemoryOutboxStore::new();
        let envelope = EnvelopeBuilder::new("orders")
            .build(
                &IdentityContext::for_tenant(TenantId::new("t-001").unwrap()),
                EventDraft::new("order.placed", 2),
            )
            .unwrap();
        let mut tx = store.begin();
        store.insert(&mut tx, &envelope).await.unwrap();
        tx.commit().await.unwrap();

        let claimed = store.claim_due(10, claimed_at).await.unwrap();
        assert_eq!(claimed.len(), 1);
        (store, envelope)
    }

    #[tokio::test]
    async fn stale_row_below_budget_becomes_failed() {
        let claimed_at = Utc::now();
        let (store, envelope) = store_with_processing_row(claimed_at).await;
        let reaper = Reaper::new(store.clone(), STALE_AFTER, RetryBudget::Fixed(10));
        let now = claimed_at + chrono::Duration::minutes(5);

        assert_eq!(reaper.reap_batch_at(10, now).await.unwrap(), 1);

        let row = store.record(envelope.event_id()).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.next_retry_at, Some(now + chrono::Duration::seconds(1)));
        assert_eq!(
            row.last_error.as_deref(),
            Some("stalled in processing for more than 60000ms")
        );
        assert!(store.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn stale_row_at_budget_is_dead_lettered() {
        let claimed_at = Utc::now();
        let (store, envelope) = store_with_processing_row(claimed_at).await;
        let reaper = Reaper::new(store.clone(), STALE_AFTER, RetryBudget::Fixed(1));
        let now = claimed_at + chrono::Duration::minutes(5);

        assert_eq!(reaper.reap_batch_at(10, now).await.unwrap(), 1);

        let row = store.record(envelope.event_id()).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Dead);

        let letters = store.dead_letters().await;
        assert_eq!(letters.len(), 1);
        let letter = &letters[0];
        assert_eq!(letter.event_id, envelope.event_id());
        assert_eq!(letter.tenant_id.as_str(), "t-001");
        assert_eq!(letter.event_name, "order.placed");
        assert_eq!(letter.event_version, 2);
        assert_eq!(letter.payload, envelope.to_payload().unwrap());
        assert!(letter.error.contains("stalled"));
        assert_eq!(letter.dead_at, now);
    }

    #[tokio::test]
    async fn nothing_stale_returns_zero_and_writes_nothing() {
        let empty = InMemoryOutboxStore::new();
        let reaper = Reaper::new(empty.clone(), STALE_AFTER, RetryBudget::Fixed(10));
        assert_eq!(reaper.reap_batch(10).await.unwrap(), 0);
        assert!(empty.records().await.is_empty());

        // Claimed recently: within the threshold.
        let claimed_at = Utc::now();
        let (store, _) = store_with_processing_row(claimed_at).await;
        let before = store.records().await;
        let reaper = Reaper::new(store.clone(), STALE_AFTER, RetryBudget::Fixed(10));

        assert_eq!(
            reaper
                .reap_batch_at(10, claimed_at + chrono::Duration::seconds(30))
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.records().await, before);
    }

    #[tokio::test]
    async fn second_reap_is_a_noop() {
        let claimed_at = Utc::now();
        let (store, _) = store_with_processing_row(claimed_at).await;
        let reaper = Reaper::new(store.clone(), STALE_AFTER, RetryBudget::Fixed(10));
        let now = claimed_at + chrono::Duration::minutes(5);

        assert_eq!(reaper.reap_batch_at(10, now).await.unwrap(), 1);
        let after_first = store.records().await;
        assert_eq!(reaper.reap_batch_at(10, now).await.unwrap(), 0);
        assert_eq!(store.records().await, after_first);
    }

    #[tokio::test]
    async fn batch_size_bounds_the_reclaim() {
        let store = InMemoryOutboxStore::new();
        let builder = EnvelopeBuilder::new("orders");
        let ctx = IdentityContext::for_tenant(TenantId::new("t-001").unwrap());
        let mut tx = store.begin();
        for _ in 0..5 {
            let envelope = builder.build(&ctx, EventDraft::new("order.placed", 1)).unwrap();
            store.insert(&mut tx, &envelope).await.unwrap();
        }
        tx.commit().await.unwrap();
        let claimed_at = Utc::now();
        store.claim_due(10, claimed_at).await.unwrap();

        let reaper = Reaper::new(store.clone(), STALE_AFTER, RetryBudget::Fixed(10));
        let now = claimed_at + chrono::Duration::minutes(5);
        assert_eq!(reaper.reap_batch_at(2, now).await.unwrap(), 2);
        assert_eq!(reaper.reap_batch_at(10, now).await.unwrap(), 3);
        assert_eq!(reaper.reap_batch_at(0, now).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reapers_never_reclaim_a_row_twice() {
        let store = InMemoryOutboxStore::new();
        let builder = EnvelopeBuilder::new("orders");
        let ctx = IdentityContext::for_tenant(TenantId::new("t-001").unwrap());
        let mut tx = store.begin();
        for _ in 0..50 {
            let envelope = builder.build(&ctx, EventDraft::new("order.placed", 1)).unwrap();
            store.insert(&mut tx, &envelope).await.unwrap();
        }
        tx.commit().await.unwrap();
        let claimed_at = Utc::now();
        assert_eq!(store.claim_due(50, claimed_at).await.unwrap().len(), 50);
        let now = claimed_at + chrono::Duration::minutes(5);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let reaper = Reaper::new(store.clone(), STALE_AFTER, RetryBudget::Fixed(10));
            tasks.push(tokio::spawn(async move {
                let mut reclaimed = 0;
                loop {
                    match reaper.reap_batch_at(3, now).await.unwrap() {
                        0 => break reclaimed,
                        n => reclaimed += n,
                    }
                }
            }));
        }
        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }

        assert_eq!(total, 50);
        let rows = store.records().await;
        assert_eq!(rows.len(), 50);
        assert!(rows
            .iter()
            .all(|row| row.status == OutboxStatus::Failed && row.retry_count == 1));
    }
}
