//! Lease Candidate
//!
//! One process's participation in an election: the state machine plus the
//! renewal scheduler and watch driver that run it, behind a small API for
//! querying belief and subscribing to transitions.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::ElectionConfig;
use crate::election::{
    Belief, CandidateStatus, ElectionStateMachine, RenewalScheduler, SubscriptionId,
    TransitionEvent, TransitionNotifier, WatchDriver,
};
use crate::error::{Error, Result};
use crate::lease::LeaseStore;

/// Background tasks of a started candidate
struct Running {
    token: CancellationToken,
    scheduler: RenewalScheduler,
    watcher: WatchDriver,
}

/// A participant in a lease election
pub struct LeaseCandidate {
    config: ElectionConfig,
    machine: Arc<ElectionStateMachine>,
    notifier: Arc<TransitionNotifier>,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    running: Mutex<Option<Running>>,
}

impl LeaseCandidate {
    /// Create a candidate. Unsafe timings are rejected here.
    pub fn new(
        config: ElectionConfig,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let notifier = Arc::new(TransitionNotifier::new());
        let machine = Arc::new(ElectionStateMachine::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&notifier),
        )?);

        Ok(Self {
            config,
            machine,
            notifier,
            store,
            clock,
            running: Mutex::new(None),
        })
    }

    /// This candidate's identity
    pub fn self_id(&self) -> &str {
        self.machine.self_id()
    }

    /// Start the renewal scheduler and watch driver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let scheduler = RenewalScheduler::spawn(
            Arc::clone(&self.machine),
            Arc::clone(&self.clock),
            self.config.renew_interval(),
            self.config.startup_jitter(),
            token.child_token(),
        );
        let watcher = WatchDriver::spawn(
            Arc::clone(&self.machine),
            Arc::clone(&self.store),
            self.config.renew_interval(),
            self.config.store_timeout(),
            token.child_token(),
        );

        tracing::info!(
            "Candidate {} joined election {} (lease {:?}, renew every {:?})",
            self.config.self_id,
            self.config.key,
            self.config.lease_duration(),
            self.config.renew_interval()
        );

        *running = Some(Running {
            token,
            scheduler,
            watcher,
        });
        Ok(())
    }

    /// Check if the background tasks are running
    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Request shutdown without waiting for it. Belief is left as is until
    /// [`stop`](Self::stop) runs.
    pub fn cancel(&self) {
        if let Some(running) = self.lock_running().as_ref() {
            running.token.cancel();
        }
    }

    /// Stop the candidate.
    ///
    /// Cancels the background tasks, waits at most the shutdown timeout for
    /// them, then steps down if leading. With `release_on_shutdown` the lease
    /// is expired in the store so a successor can take over immediately.
    pub async fn stop(&self) -> Result<()> {
        let running = self.lock_running().take();
        let Some(running) = running else {
            return Ok(());
        };

        running.token.cancel();
        let timeout = self.config.shutdown_timeout();
        running.scheduler.shutdown(timeout).await;
        running.watcher.shutdown(timeout).await;

        let now = self.clock.now();
        if self
            .machine
            .step_down(now, self.config.release_on_shutdown)
            .await
        {
            tracing::info!("Candidate {} released lease on shutdown", self.config.self_id);
        }

        tracing::info!("Candidate {} left election {}", self.config.self_id, self.config.key);
        Ok(())
    }

    /// Current belief. Never blocks.
    pub fn current_belief(&self) -> Belief {
        self.machine.current_belief()
    }

    /// Shorthand for `current_belief() == Leader`
    pub fn is_leader(&self) -> bool {
        self.current_belief().is_leader()
    }

    /// Snapshot of local state
    pub async fn status(&self) -> CandidateStatus {
        self.machine.status().await
    }

    /// Subscribe a callback to transitions
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(TransitionEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback)
    }

    /// Subscribe to transitions through a queue
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<TransitionEvent>) {
        self.notifier.subscribe_channel()
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// The underlying state machine, for driving ticks by hand
    pub fn machine(&self) -> Arc<ElectionStateMachine> {
        Arc::clone(&self.machine)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for LeaseCandidate {
    fn drop(&mut self) {
        self.cancel();
    }
}
