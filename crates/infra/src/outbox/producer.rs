//! Producer-facing facade: build an envelope and stage it in one call.

use thiserror::Error;
use tracing::debug;

use courier_core::{EventId, IdentityContext};
use courier_events::{EnvelopeBuilder, EnvelopeError, EventDraft};

use super::store::{OutboxStoreError, OutboxWriter};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProduceError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// Couples an [`EnvelopeBuilder`] with an [`OutboxWriter`].
#[derive(Debug, Clone)]
pub struct OutboxProducer<W> {
    builder: EnvelopeBuilder,
    writer: W,
}

impl<W> OutboxProducer<W> {
    pub fn new(builder: EnvelopeBuilder, writer: W) -> Self {
        Self { builder, writer }
    }

    /// Build an envelope for `draft` and insert it into `tx`.
    ///
    /// `tx` must be the transaction carrying the business change. A build
    /// failure (e.g. no tenant) returns before anything is written.
    pub async fn enqueue<Tx>(
        &self,
        tx: &mut Tx,
        ctx: &IdentityContext,
        draft: EventDraft,
    ) -> Result<EventId, ProduceError>
    where
        Tx: Send,
        W: OutboxWriter<Tx>,
    {
        let envelope = self.builder.build(ctx, draft)?;
        self.writer.insert(tx, &envelope).await?;
        debug!(
            event_id = %envelope.event_id(),
            tenant_id = %envelope.tenant_id(),
            event_name = envelope.event_name(),
            event_version = envelope.event_version(),
            "integration event enqueued"
        );
        Ok(envelope.event_id())
    }
}
