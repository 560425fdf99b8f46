//! Election Module
//!
//! Lease-based leader election: the state machine that acquires, renews
//! and gives up the lease, the tasks that drive it, and the fan-out that
//! tells the local workload about transitions.

mod machine;
mod notifier;
mod scheduler;
mod watcher;

pub use machine::{CandidateStatus, ElectionStateMachine, TickOutcome};
pub use notifier::{SubscriptionId, Transition, TransitionEvent, TransitionNotifier};
pub use scheduler::RenewalScheduler;
pub use watcher::WatchDriver;

use serde::{Deserialize, Serialize};

/// A candidate's opinion of its own role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Belief {
    /// Not holding the lease
    Follower,
    /// Holding a lease it believes is valid
    Leader,
}

impl Belief {
    /// Check if this is the leader belief
    pub fn is_leader(self) -> bool {
        self == Belief::Leader
    }
}

impl std::fmt::Display for Belief {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Belief::Follower => write!(f, "FOLLOWER"),
            Belief::Leader => write!(f, "LEADER"),
        }
    }
}
