//! Watch Driver
//!
//! Feeds the store's change stream for the election key into the state
//! machine. A stream that fails to open or ends is re-opened after a delay.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ElectionStateMachine;
use crate::lease::LeaseStore;

/// Background task forwarding watch events to a state machine
pub struct WatchDriver {
    handle: JoinHandle<()>,
}

impl WatchDriver {
    /// Start watching `machine.key()` on `store`
    pub fn spawn(
        machine: Arc<ElectionStateMachine>,
        store: Arc<dyn LeaseStore>,
        resubscribe_delay: Duration,
        store_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(async move {
            run(machine, store, resubscribe_delay, store_timeout, token).await;
        });
        Self { handle }
    }

    /// Wait up to `timeout` for the task to exit after cancellation; abort it after
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("Watch driver did not stop within {:?}, aborting", timeout);
                handle.abort();
                false
            }
        }
    }
}

async fn run(
    machine: Arc<ElectionStateMachine>,
    store: Arc<dyn LeaseStore>,
    resubscribe_delay: Duration,
    store_timeout: Duration,
    token: CancellationToken,
) {
    let key = machine.key().to_string();

    while !token.is_cancelled() {
        let opened = tokio::select! {
            _ = token.cancelled() => break,
            opened = tokio::time::timeout(store_timeout, store.watch(&key)) => opened,
        };

        match opened {
            Ok(Ok(mut stream)) => {
                tracing::debug!("Watching lease {}", key);
                loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(event) => machine.on_watch_event(event).await,
                        None => {
                            tracing::debug!("Watch stream for {} ended, resubscribing", key);
                            break;
                        }
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!("Failed to watch lease {}: {}", key, e),
            Err(_) => tracing::warn!("Opening watch on {} timed out", key),
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(resubscribe_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElectionConfig;
    use crate::election::TransitionNotifier;
    use crate::lease::{InMemoryLeaseStore, LeaseRecord};
    use std::time::Instant;

    #[tokio::test]
    async fn test_watch_events_reach_follower() {
        let memory = Arc::new(InMemoryLeaseStore::new());
        let store: Arc<dyn LeaseStore> = memory.clone();
        let config = ElectionConfig::new("watch/leader", "b")
            .with_timings(Duration::from_millis(300), Duration::from_millis(50))
            .with_store_timeout(Duration::from_millis(25));
        let notifier = Arc::new(TransitionNotifier::new());
        let machine =
            Arc::new(ElectionStateMachine::new(&config, Arc::clone(&store), notifier).unwrap());

        let token = CancellationToken::new();
        let driver = WatchDriver::spawn(
            Arc::clone(&machine),
            store,
            Duration::from_millis(20),
            Duration::from_millis(100),
            token.clone(),
        );

        // Wait until the driver has subscribed
        let start = Instant::now();
        while memory.watcher_count() == 0 && start.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        memory
            .create_if_absent("watch/leader", &LeaseRecord::new("a", u64::MAX))
            .await
            .unwrap();

        let start = Instant::now();
        let mut holder = None;
        while start.elapsed() < Duration::from_secs(2) {
            holder = machine.status().await.holder_id;
            if holder.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(holder.as_deref(), Some("a"));

        token.cancel();
        assert!(driver.shutdown(Duration::from_secs(1)).await);
    }
}
