use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::claimer::Claimer;
use crate::config::OutboxConfig;
use crate::outbox::OutboxStore;
use crate::reaper::Reaper;

/// Handle to stop and join the relay's background tasks.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// Request graceful shutdown and wait for every loop to stop.
    ///
    /// An in-flight batch finishes before its loop exits.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            let _ = join.await;
        }
    }
}

/// Background claim and reap loops for one process.
///
/// - The claim loop runs back-to-back while batches come back full, then
///   sleeps `poll_interval`.
/// - The reap loop runs every `reap_interval`.
/// - Store errors are logged and the loop carries on.
#[derive(Debug)]
pub struct OutboxRelay;

impl OutboxRelay {
    /// Spawn both loops on the current tokio runtime.
    pub fn spawn<S, R>(claimer: Claimer<S>, reaper: Reaper<R>, config: &OutboxConfig) -> RelayHandle
    where
        S: OutboxStore + 'static,
        R: OutboxStore + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let joins = vec![
            tokio::spawn(claim_loop(claimer, config.poll_interval, rx.clone())),
            tokio::spawn(reap_loop(
                reaper,
                config.reap_batch_size,
                config.reap_interval,
                rx,
            )),
        ];
        info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            reap_interval_ms = config.reap_interval.as_millis() as u64,
            "outbox relay started"
        );
        RelayHandle { shutdown, joins }
    }
}

async fn claim_loop<S>(claimer: Claimer<S>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>)
where
    S: OutboxStore,
{
    while !*shutdown.borrow() {
        let idle = match claimer.run_once().await {
            Ok(report) => report.claimed < claimer.batch_size(),
            Err(e) => {
                error!(error = %e, "outbox claim failed");
                true
            }
        };
        if idle && wait_or_shutdown(&mut shutdown, poll_interval).await {
            break;
        }
    }
    info!("outbox claim loop stopped");
}

async fn reap_loop<S>(
    reaper: Reaper<S>,
    batch_size: usize,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: OutboxStore,
{
    while !*shutdown.borrow() {
        if let Err(e) = reaper.reap_batch(batch_size).await {
            error!(error = %e, "outbox reap failed");
        }
        if wait_or_shutdown(&mut shutdown, interval).await {
            break;
        }
    }
    info!("outbox reap loop stopped");
}

/// Sleep for `period`; `true` if shutdown was requested meanwhile.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    match tokio::time::timeout(period, shutdown.changed()).await {
        Ok(Ok(())) | Err(_) => *shutdown.borrow(),
        // Sender dropped.
        Ok(Err(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{InMemoryOutboxStore, OutboxWriter, RetryBudget};
    use async_trait::async_trait;
    use courier_core::{IdentityContext, TenantId};
    use courier_events::{
        EnvelopeBuilder, EventDraft, IntegrationEventEnvelope, IntegrationEventSubscriber,
        SubscriberDescriptor, SubscriberDispatcher, SubscriberError, SubscriberRegistry,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl IntegrationEventSubscriber for Count {
        fn descriptor(&self) -> SubscriberDescriptor {
            SubscriberDescriptor::new("count", "order.placed")
        }

        async fn handle(&self, _: &IntegrationEventEnvelope) -> Result<(), SubscriberError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn relay_delivers_committed_events_and_shuts_down() {
        let store = InMemoryOutboxStore::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let registry = SubscriberRegistry::new()
            .register(Arc::new(Count(Arc::clone(&delivered))))
            .unwrap();
        let config = OutboxConfig {
            poll_interval: Duration::from_millis(10),
            reap_interval: Duration::from_millis(10),
            ..OutboxConfig::default()
        };
        let dispatcher = Arc::new(SubscriberDispatcher::new(
            registry,
            config.default_subscriber_timeout,
        ));
        let claimer = Claimer::new(store.clone(), dispatcher, RetryBudget::Fixed(10), 2);
        let reaper = Reaper::new(store.clone(), config.stale_after, RetryBudget::Fixed(10));
        let handle = OutboxRelay::spawn(claimer, reaper, &config);

        let builder = EnvelopeBuilder::new("orders");
        let ctx = IdentityContext::for_tenant(TenantId::new("t-001").unwrap());
        let mut tx = store.begin();
        for _ in 0..5 {
            let envelope = builder.build(&ctx, EventDraft::new("order.placed", 1)).unwrap();
            store.insert(&mut tx, &envelope).await.unwrap();
        }
        tx.commit().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while delivered.load(Ordering::SeqCst) < 5 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 5);
        assert!(store.records().await.is_empty());
    }
}
