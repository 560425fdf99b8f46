//! LeaseKeeper - Lease-Based Leader Election
//!
//! Lets any number of equally privileged processes agree on exactly one
//! active leader at a time, using nothing but a shared record in a
//! strongly-consistent key/value store.
//!
//! # Architecture
//!
//! Each candidate periodically ticks an election state machine. A follower
//! that finds the lease absent or expired tries to claim it with a
//! conditional write; a leader renews it with a conditional write keyed on
//! the version it last wrote. Losing a conditional write is the only thing
//! that demotes a leader, so transient store failures never cause a spurious
//! handover and two candidates can never both win the same version.
//!
//! # Features
//!
//! - Pluggable lease stores behind the [`lease::LeaseStore`] trait
//! - In-memory store with fault injection and a shared-file SQLite store
//! - Non-blocking belief queries and decoupled transition subscriptions
//! - Early lease release on graceful shutdown
//! - Injectable clock for deterministic tests

pub mod candidate;
pub mod clock;
pub mod config;
pub mod election;
pub mod error;
pub mod lease;

pub use candidate::LeaseCandidate;
pub use config::LeaseKeeperConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::candidate::LeaseCandidate;
    pub use crate::clock::{Clock, ManualClock, SystemClock, Timestamp};
    pub use crate::config::{ElectionConfig, LeaseKeeperConfig};
    pub use crate::election::{Belief, ElectionStateMachine, Transition, TransitionEvent};
    pub use crate::error::{Error, Result};
    pub use crate::lease::{InMemoryLeaseStore, LeaseRecord, LeaseStore, SqliteLeaseStore, Version};
}
