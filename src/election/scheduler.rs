//! Renewal Scheduler
//!
//! Drives `tick` on a fixed cadence. Ticks run inline in one task, so a slow
//! tick delays the next one instead of overlapping it. Cancellation abandons
//! an in-flight tick at its next await point.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{ElectionStateMachine, TickOutcome};
use crate::clock::Clock;

/// Periodic driver of one candidate's state machine
pub struct RenewalScheduler {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

impl RenewalScheduler {
    /// Start ticking every `renew_interval`, after a random delay of up to
    /// `startup_jitter`
    pub fn spawn(
        machine: Arc<ElectionStateMachine>,
        clock: Arc<dyn Clock>,
        renew_interval: Duration,
        startup_jitter: Duration,
        token: CancellationToken,
    ) -> Self {
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            run(machine, clock, renew_interval, startup_jitter, task_token).await;
        });
        Self { handle, token }
    }

    /// Cancel and wait up to `timeout` for the task to exit; abort it after
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.token.cancel();
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("Renewal scheduler did not stop within {:?}, aborting", timeout);
                handle.abort();
                false
            }
        }
    }
}

/// Random delay in `[0, bound]`
fn startup_delay(bound: Duration) -> Duration {
    if bound.is_zero() {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=bound.as_millis() as u64))
}

async fn run(
    machine: Arc<ElectionStateMachine>,
    clock: Arc<dyn Clock>,
    renew_interval: Duration,
    startup_jitter: Duration,
    token: CancellationToken,
) {
    let delay = startup_delay(startup_jitter);
    if !delay.is_zero() {
        tracing::debug!("Delaying first election tick by {:?}", delay);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!(
        "Renewal scheduler started for {} on {} (every {:?})",
        machine.self_id(),
        machine.key(),
        renew_interval
    );

    let mut ticker = interval(renew_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = clock.now();
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("Abandoning in-flight tick for {}", machine.key());
                break;
            }
            outcome = machine.tick(now) => match outcome {
                TickOutcome::Acquired(version) => {
                    tracing::debug!("Tick acquired {} at {}", machine.key(), version)
                }
                TickOutcome::Demoted => tracing::debug!("Tick demoted on {}", machine.key()),
                other => tracing::trace!("Tick on {}: {:?}", machine.key(), other),
            },
        }
    }

    tracing::info!("Renewal scheduler stopped for {}", machine.self_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ElectionConfig;
    use crate::election::{Belief, TransitionNotifier};
    use crate::lease::{InMemoryLeaseStore, LeaseStore};
    use std::time::Instant;

    fn fast_machine(self_id: &str, store: Arc<dyn LeaseStore>) -> Arc<ElectionStateMachine> {
        let config = ElectionConfig::new("sched/leader", self_id)
            .with_timings(Duration::from_millis(300), Duration::from_millis(50))
            .with_store_timeout(Duration::from_millis(25));
        Arc::new(
            ElectionStateMachine::new(&config, store, Arc::new(TransitionNotifier::new())).unwrap(),
        )
    }

    async fn wait_for(machine: &ElectionStateMachine, belief: Belief, within: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < within {
            if machine.current_belief() == belief {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[test]
    fn test_startup_delay_bounds() {
        assert_eq!(startup_delay(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(startup_delay(Duration::from_millis(20)) <= Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn test_scheduler_acquires_and_stops() {
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
        let machine = fast_machine("a", store);

        let scheduler = RenewalScheduler::spawn(
            Arc::clone(&machine),
            Arc::new(SystemClock),
            Duration::from_millis(50),
            Duration::ZERO,
            CancellationToken::new(),
        );

        assert!(wait_for(&machine, Belief::Leader, Duration::from_secs(2)).await);
        assert!(scheduler.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_cancel_abandons_slow_tick() {
        let memory = Arc::new(InMemoryLeaseStore::new());
        memory.set_latency(Some(Duration::from_secs(10))).await;
        let store: Arc<dyn LeaseStore> = memory.clone();
        let machine = fast_machine("a", store);

        let scheduler = RenewalScheduler::spawn(
            Arc::clone(&machine),
            Arc::new(SystemClock),
            Duration::from_millis(50),
            Duration::ZERO,
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        let start = Instant::now();
        assert!(scheduler.shutdown(Duration::from_secs(1)).await);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(machine.current_belief(), Belief::Follower);
    }

    #[tokio::test]
    async fn test_leader_keeps_lease_across_many_ticks() {
        let memory = Arc::new(InMemoryLeaseStore::new());
        let store: Arc<dyn LeaseStore> = memory.clone();
        let a = fast_machine("a", Arc::clone(&store));
        let b = fast_machine("b", store);

        let token = CancellationToken::new();
        let sa = RenewalScheduler::spawn(
            Arc::clone(&a),
            Arc::new(SystemClock),
            Duration::from_millis(50),
            Duration::ZERO,
            token.clone(),
        );
        assert!(wait_for(&a, Belief::Leader, Duration::from_secs(2)).await);

        let sb = RenewalScheduler::spawn(
            Arc::clone(&b),
            Arc::new(SystemClock),
            Duration::from_millis(50),
            Duration::ZERO,
            token.clone(),
        );

        // Several lease durations pass without a handover
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(a.current_belief(), Belief::Leader);
        assert_eq!(b.current_belief(), Belief::Follower);

        token.cancel();
        assert!(sa.shutdown(Duration::from_secs(1)).await);
        assert!(sb.shutdown(Duration::from_secs(1)).await);
    }
}
