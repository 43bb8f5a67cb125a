//! Runs the outbox reaper against Postgres on a fixed interval.
//!
//! Many instances may run side by side; each stale row is reclaimed by one.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use courier_infra::outbox::PostgresOutboxStore;
use courier_infra::{OutboxConfig, Reaper};

#[derive(Debug, Parser)]
#[command(name = "courier-reaper", about = "Reclaim outbox rows stuck in processing")]
struct Args {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum rows reclaimed per pass.
    #[arg(long, env = "OUTBOX_REAP_BATCH_SIZE", default_value_t = 100)]
    batch_size: usize,

    /// Delay between passes.
    #[arg(long, env = "OUTBOX_REAP_INTERVAL_MS", default_value_t = 30_000)]
    interval_ms: u64,

    /// Run a single pass, print the reclaimed count, and exit.
    #[arg(long)]
    once: bool,

    /// Create the outbox tables before starting.
    #[arg(long)]
    ensure_schema: bool,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "COURIER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 4)]
    max_connections: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    courier_observability::init_with_level(&args.log_level);

    let config = OutboxConfig::from_env().context("reading outbox configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .connect(&args.database_url)
        .await
        .context("connecting to postgres")?;
    let store = PostgresOutboxStore::new(pool);

    if args.ensure_schema {
        store.ensure_schema().await.context("applying outbox schema")?;
    }

    let reaper = Reaper::new(store.clone(), config.stale_after, config.max_retry_count.clone());

    if args.once {
        let reclaimed = reaper.reap_batch(args.batch_size).await?;
        println!("{reclaimed}");
        store.pool().close().await;
        return Ok(());
    }

    tracing::info!(
        batch_size = args.batch_size,
        interval_ms = args.interval_ms,
        stale_after_ms = config.stale_after.as_millis() as u64,
        "reaper started"
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reaper.reap_batch(args.batch_size).await {
                    tracing::error!(error = %e, "reap pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }
    store.pool().close().await;
    Ok(())
}
