//! Transactional outbox: rows, retry scheduling, and storage backends.
//!
//! ## State machine
//!
//! ```text
//! pending ──claim──▶ processing ──ok──▶ (deleted)
//!    ▲                  │
//!    │               failure / stale
//!    │                  ▼
//!    └──(due)────── failed ──budget exhausted──▶ dead ──▶ dead-letter record
//! ```
//!
//! `failed` rows are claimed again once `next_retry_at` passes. `dead` is
//! terminal unless an operator requeues it.

pub mod in_memory;
pub mod postgres;
pub mod producer;
pub mod record;
pub mod retry;
pub mod schema;
pub mod store;

pub use in_memory::{InMemoryOutboxStore, InMemoryTransaction};
pub use postgres::PostgresOutboxStore;
pub use producer::{OutboxProducer, ProduceError};
pub use record::{DeadLetterRecord, OutboxRecord, OutboxStats, OutboxStatus};
pub use retry::{
    FailureTransition, MAX_DELAY_SECONDS, RetryBudget, RetryPolicy, next_delay_seconds,
};
pub use store::{OutboxStore, OutboxStoreError, OutboxWriter};
