//! Transition Notifier
//!
//! Fans leadership transitions out to subscribers. Each subscriber owns an
//! unbounded queue drained by its own task, so publishing never waits and a
//! subscriber stuck in its handler delays nobody but itself. Every
//! subscriber sees every event published while it is subscribed, once, in
//! publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::clock::Timestamp;

/// Kind of leadership transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    BecameLeader,
    LostLeadership,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::BecameLeader => write!(f, "BECAME_LEADER"),
            Transition::LostLeadership => write!(f, "LOST_LEADERSHIP"),
        }
    }
}

/// A transition as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// What happened
    pub transition: Transition,
    /// Candidate the transition belongs to
    pub candidate_id: String,
    /// Per-candidate sequence number, starting at 1
    pub sequence: u64,
    /// When the transition was decided
    pub at: Timestamp,
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Transition fan-out
pub struct TransitionNotifier {
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<TransitionEvent>>>,
    next_id: AtomicU64,
}

impl TransitionNotifier {
    /// Create a notifier with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe with a queue the caller drains
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<TransitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Subscribe a callback, run on a dedicated task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(TransitionEvent) + Send + Sync + 'static,
    {
        let (id, mut rx) = self.subscribe_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(event);
            }
        });
        id
    }

    /// Remove a subscriber. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Queue an event for every subscriber. Never blocks on subscribers.
    pub fn publish(&self, event: TransitionEvent) {
        let mut subscribers = self.lock();
        // Receivers that were dropped unsubscribe themselves
        subscribers.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                tracing::debug!("Dropping closed transition subscriber {:?}", id);
            }
            alive
        });
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, mpsc::UnboundedSender<TransitionEvent>>>
    {
        // A panic while holding this lock cannot leave the map half-updated
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TransitionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(transition: Transition, sequence: u64) -> TransitionEvent {
        TransitionEvent {
            transition,
            candidate_id: "node-a".into(),
            sequence,
            at: 0,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event_in_order() {
        let notifier = TransitionNotifier::new();
        let (_, mut rx1) = notifier.subscribe_channel();
        let (_, mut rx2) = notifier.subscribe_channel();

        notifier.publish(event(Transition::BecameLeader, 1));
        notifier.publish(event(Transition::LostLeadership, 2));

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap().sequence, 1);
            assert_eq!(rx.recv().await.unwrap().sequence, 2);
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let notifier = TransitionNotifier::new();
        let (id, mut rx) = notifier.subscribe_channel();

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.publish(event(Transition::BecameLeader, 1));

        assert!(rx.recv().await.is_none());
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let notifier = TransitionNotifier::new();
        let (_, rx) = notifier.subscribe_channel();
        drop(rx);

        notifier.publish(event(Transition::BecameLeader, 1));
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_subscriber_does_not_block_publish() {
        let notifier = TransitionNotifier::new();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        // Blocks its own thread until released
        notifier.subscribe(move |_| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        });
        let (_, mut fast) = notifier.subscribe_channel();

        for seq in 1..=10 {
            notifier.publish(event(Transition::BecameLeader, seq));
        }
        for seq in 1..=10 {
            assert_eq!(fast.recv().await.unwrap().sequence, seq);
        }

        for _ in 0..10 {
            let _ = release_tx.send(());
        }
    }

    #[tokio::test]
    async fn test_duplicate_became_leader_is_idempotent_for_toggle() {
        let notifier = TransitionNotifier::new();
        let active = Arc::new(AtomicBool::new(false));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let flag = Arc::clone(&active);
        notifier.subscribe(move |event| {
            match event.transition {
                Transition::BecameLeader => flag.store(true, Ordering::SeqCst),
                Transition::LostLeadership => flag.store(false, Ordering::SeqCst),
            }
            let _ = done_tx.send(event.sequence);
        });

        notifier.publish(event(Transition::BecameLeader, 1));
        notifier.publish(event(Transition::BecameLeader, 1));

        assert_eq!(done_rx.recv().await, Some(1));
        assert_eq!(done_rx.recv().await, Some(1));
        assert!(active.load(Ordering::SeqCst));
    }
}
