//! DDL for the outbox and dead-letter tables.

/// Outbox table name.
pub const OUTBOX_TABLE: &str = "integration_event_outbox";

/// Dead-letter table name (insert-only).
pub const DEAD_LETTER_TABLE: &str = "integration_event_dead_letter";

/// Idempotent schema, applied by [`super::PostgresOutboxStore::ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS integration_event_outbox (
    event_id       UUID PRIMARY KEY,
    tenant_id      TEXT NOT NULL,
    event_name     TEXT NOT NULL,
    event_version  INTEGER NOT NULL CHECK (event_version >= 1),
    partition_key  TEXT NOT NULL,
    payload        JSONB NOT NULL,
    status         TEXT NOT NULL DEFAULT 'pending'
                   CHECK (status IN ('pending', 'processing', 'failed', 'dead')),
    retry_count    INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    next_retry_at  TIMESTAMPTZ NULL,
    last_error     TEXT NULL,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS integration_event_outbox_due_idx
    ON integration_event_outbox (created_at)
    WHERE status IN ('pending', 'failed');

CREATE INDEX IF NOT EXISTS integration_event_outbox_processing_idx
    ON integration_event_outbox (updated_at)
    WHERE status = 'processing';

CREATE TABLE IF NOT EXISTS integration_event_dead_letter (
    id             BIGSERIAL PRIMARY KEY,
    event_id       UUID NOT NULL,
    tenant_id      TEXT NOT NULL,
    event_name     TEXT NOT NULL,
    event_version  INTEGER NOT NULL,
    payload        JSONB NOT NULL,
    retry_count    INTEGER NOT NULL,
    error          TEXT NOT NULL,
    dead_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS integration_event_dead_letter_tenant_idx
    ON integration_event_dead_letter (tenant_id, dead_at DESC);
"#;
