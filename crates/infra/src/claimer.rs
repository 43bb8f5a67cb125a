//! Claim-and-deliver loop body.
//!
//! One [`Claimer::run_once`] call:
//! 1. claims a batch of due rows (the store flips them to `processing`),
//! 2. heartbeats and dispatches each row outside the claiming transaction,
//! 3. deletes delivered rows, or applies the failed/dead decision.
//!
//! A row whose heartbeat finds it no longer `processing` was reclaimed by the
//! reaper while it sat in the batch; it is left alone. A store error on one row
//! is logged and counted, and the rest of the batch is still delivered.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use courier_events::SubscriberDispatcher;

use crate::outbox::{
    FailureTransition, OutboxRecord, OutboxStore, OutboxStoreError, RetryBudget,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimerError {
    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// What one [`Claimer::run_once`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClaimReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Rows taken over by the reaper before an outcome was recorded.
    pub abandoned: usize,
    /// Rows whose bookkeeping hit a store error; the reaper recovers them.
    pub store_errors: usize,
}

#[derive(Debug, Clone)]
pub struct Claimer<S> {
    store: S,
    dispatcher: Arc<SubscriberDispatcher>,
    retry: RetryBudget,
    batch_size: usize,
}

impl<S> Claimer<S>
where
    S: OutboxStore,
{
    pub fn new(
        store: S,
        dispatcher: Arc<SubscriberDispatcher>,
        retry: RetryBudget,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            dispatcher,
            retry,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn run_once(&self) -> Result<ClaimReport, ClaimerError> {
        let batch = self.store.claim_due(self.batch_size, Utc::now()).await?;
        let mut report = ClaimReport {
            claimed: batch.len(),
            ..ClaimReport::default()
        };

        for record in &batch {
            if let Err(err) = self.deliver(record, &mut report).await {
                error!(
                    event_id = %record.event_id,
                    tenant_id = %record.tenant_id,
                    event_name = %record.event_name,
                    error = %err,
                    "outbox store error during delivery"
                );
                report.store_errors += 1;
            }
        }

        if report.claimed > 0 {
            debug!(
                claimed = report.claimed,
                delivered = report.delivered,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                abandoned = report.abandoned,
                store_errors = report.store_errors,
                "outbox batch processed"
            );
        }
        Ok(report)
    }

    async fn deliver(
        &self,
        record: &OutboxRecord,
        report: &mut ClaimReport,
    ) -> Result<(), ClaimerError> {
        let event_id = record.event_id;
        if !self.store.heartbeat(event_id, Utc::now()).await? {
            report.abandoned += 1;
            return Ok(());
        }

        let outcome = match record.envelope() {
            Ok(envelope) => self
                .dispatcher
                .dispatch(&envelope)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(format!("payload decode failed: {e}")),
        };

        match outcome {
            Ok(_) => {
                if self.store.complete(event_id).await? {
                    report.delivered += 1;
                } else {
                    report.abandoned += 1;
                }
            }
            Err(error) => {
                let policy = self.retry.current();
                match self
                    .store
                    .record_failure(event_id, &error, policy, Utc::now())
                    .await?
                {
                    Some(FailureTransition::Retry {
                        retry_count,
                        next_retry_at,
                    }) => {
                        warn!(
                            event_id = %event_id,
                            tenant_id = %record.tenant_id,
                            event_name = %record.event_name,
                            retry_count,
                            %next_retry_at,
                            %error,
                            "delivery failed; retry scheduled"
                        );
                        report.retried += 1;
                    }
                    Some(FailureTransition::DeadLetter) => {
                        warn!(
                            event_id = %event_id,
                            tenant_id = %record.tenant_id,
                            event_name = %record.event_name,
                            retry_count = record.retry_count,
                            %error,
                            "delivery failed; retry budget exhausted, dead-lettered"
                        );
                        report.dead_lettered += 1;
                    }
                    None => report.abandoned += 1,
                }
            }
        }
        Ok(())
    }
}
