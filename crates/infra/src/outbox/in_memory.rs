//! In-memory outbox for tests/dev.
//!
//! A single async mutex stands in for row locks: every operation runs under it,
//! so no row can be handed to two callers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use courier_core::{EventId, TenantId};
use courier_events::{IntegrationEventEnvelope, TenantScoped};

use super::record::{DeadLetterRecord, OutboxRecord, OutboxStats, OutboxStatus};
use super::retry::{FailureTransition, RetryPolicy};
use super::store::{OutboxStore, OutboxStoreError, OutboxWriter};

#[derive(Debug, Default)]
struct State {
    rows: Vec<OutboxRecord>,
    dead_letters: Vec<DeadLetterRecord>,
}

impl State {
    fn contains(&self, event_id: EventId) -> bool {
        self.rows.iter().any(|r| r.event_id == event_id)
    }

    fn processing_mut(&mut self, event_id: EventId) -> Option<&mut OutboxRecord> {
        self.rows
            .iter_mut()
            .find(|r| r.event_id == event_id && r.status == OutboxStatus::Processing)
    }

    fn fail_row(
        &mut self,
        idx: usize,
        policy: RetryPolicy,
        error: &str,
        now: DateTime<Utc>,
    ) -> FailureTransition {
        let row = &mut self.rows[idx];
        let transition = policy.on_failure(row.retry_count, now);
        if transition == FailureTransition::DeadLetter {
            self.dead_letters
                .push(DeadLetterRecord::from_record(row, error, now));
        }
        row.apply_failure(transition, error, now);
        transition
    }
}

/// Shared-state outbox; clones are handles to the same rows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction. Rows inserted through it become visible on
    /// [`InMemoryTransaction::commit`]; dropping it discards them.
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }
    }

    /// Snapshot of all outbox rows, in insertion order.
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.rows.clone()
    }

    pub async fn record(&self, event_id: EventId) -> Option<OutboxRecord> {
        self.state
            .lock()
            .await
            .rows
            .iter()
            .find(|r| r.event_id == event_id)
            .cloned()
    }

    /// Snapshot of the dead-letter table, in insertion order.
    pub async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.state.lock().await.dead_letters.clone()
    }
}

/// Transaction handle of an [`InMemoryOutboxStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<Mutex<State>>,
    staged: Vec<OutboxRecord>,
}

impl InMemoryTransaction {
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Make staged rows visible, all or none.
    pub async fn commit(self) -> Result<(), OutboxStoreError> {
        let mut state = self.state.lock().await;
        if let Some(dup) = self.staged.iter().find(|r| state.contains(r.event_id)) {
            return Err(OutboxStoreError::Duplicate(dup.event_id));
        }
        state.rows.extend(self.staged);
        Ok(())
    }

    /// Discard staged rows. Dropping the transaction does the same.
    pub fn rollback(self) {}
}

#[async_trait]
impl OutboxWriter<InMemoryTransaction> for InMemoryOutboxStore {
    async fn insert(
        &self,
        tx: &mut InMemoryTransaction,
        envelope: &IntegrationEventEnvelope,
    ) -> Result<(), OutboxStoreError> {
        if !Arc::ptr_eq(&tx.state, &self.state) {
            return Err(OutboxStoreError::ForeignTransaction);
        }
        let event_id = envelope.event_id();
        let committed = self.state.lock().await.contains(event_id);
        if committed || tx.staged.iter().any(|r| r.event_id == event_id) {
            return Err(OutboxStoreError::Duplicate(event_id));
        }
        tx.staged.push(OutboxRecord::pending(envelope, Utc::now())?);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let mut state = self.state.lock().await;
        let mut due: Vec<usize> = (0..state.rows.len())
            .filter(|&i| state.rows[i].is_due(now))
            .collect();
        due.sort_by_key(|&i| state.rows[i].created_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for i in due {
            let row = &mut state.rows[i];
            row.mark_processing(now);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let mut state = self.state.lock().await;
        Ok(match state.processing_mut(event_id) {
            Some(row) => {
                row.touch(now);
                true
            }
            None => false,
        })
    }

    async fn complete(&self, event_id: EventId) -> Result<bool, OutboxStoreError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state
            .rows
            .retain(|r| !(r.event_id == event_id && r.status == OutboxStatus::Processing));
        Ok(state.rows.len() < before)
    }

    async fn record_failure(
        &self,
        event_id: EventId,
        error: &str,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureTransition>, OutboxStoreError> {
        let mut state = self.state.lock().await;
        let idx = state
            .rows
            .iter()
            .position(|r| r.event_id == event_id && r.status == OutboxStatus::Processing);
        Ok(idx.map(|i| state.fail_row(i, policy, error, now)))
    }

    async fn reclaim_stale(
        &self,
        limit: usize,
        stale_before: DateTime<Utc>,
        policy: RetryPolicy,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        let mut state = self.state.lock().await;
        let mut stale: Vec<usize> = (0..state.rows.len())
            .filter(|&i| state.rows[i].is_stale(stale_before))
            .collect();
        stale.sort_by_key(|&i| state.rows[i].updated_at);
        stale.truncate(limit);

        for &i in &stale {
            state.fail_row(i, policy, error, now);
        }
        Ok(stale.len())
    }

    async fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, OutboxStoreError> {
        let state = self.state.lock().await;
        let mut letters: Vec<DeadLetterRecord> = state
            .dead_letters
            .iter()
            .filter(|d| d.belongs_to(tenant_id))
            .cloned()
            .collect();
        letters.sort_by(|a, b| b.dead_at.cmp(&a.dead_at));
        letters.truncate(limit);
        Ok(letters)
    }

    async fn requeue_dead(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let mut state = self.state.lock().await;
        Ok(
            match state
                .rows
                .iter_mut()
                .find(|r| r.event_id == event_id && r.status.is_terminal())
            {
                Some(row) => {
                    row.requeue(now);
                    true
                }
                None => false,
            },
        )
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let state = self.state.lock().await;
        let mut stats = OutboxStats {
            dead_letters: state.dead_letters.len(),
            ..OutboxStats::default()
        };
        for row in &state.rows {
            match row.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}
