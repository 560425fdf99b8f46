//! Lease Store Module
//!
//! The lease record shared by all candidates, and the capability interface
//! the election engine consumes to read and conditionally write it.
//!
//! Any store offering linearizable conditional writes and a change feed can
//! back an election. Two backends ship with the crate:
//!
//! - [`InMemoryLeaseStore`]: a single-process linearizable store with fault
//!   injection, used for tests and simulations
//! - [`SqliteLeaseStore`]: a shared SQLite file that several processes on one
//!   host can elect through

mod memory;
mod sqlite;

pub use memory::InMemoryLeaseStore;
pub use sqlite::SqliteLeaseStore;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::config::{LeaseKeeperConfig, StoreBackend};
use crate::error::{Error, Result};

/// Fencing token assigned by the store on every successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The shared lease record stored under the election key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Identity of the current holder
    pub holder_id: String,
    /// Absolute time after which the lease is up for grabs
    pub expires_at: Timestamp,
}

impl LeaseRecord {
    /// Create a new record
    pub fn new(holder_id: impl Into<String>, expires_at: Timestamp) -> Self {
        Self {
            holder_id: holder_id.into(),
            expires_at,
        }
    }

    /// A record is held while it names a holder and has not expired
    pub fn is_held(&self, now: Timestamp) -> bool {
        !self.holder_id.is_empty() && self.expires_at > now
    }

    /// Check whether `candidate` holds a currently valid lease
    pub fn is_held_by(&self, candidate: &str, now: Timestamp) -> bool {
        self.is_held(now) && self.holder_id == candidate
    }

    /// Encode for storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode stored bytes. Undecodable bytes surface as
    /// [`Error::MalformedRecord`] carrying the stored version so the record
    /// can still be replaced with a conditional write.
    pub fn decode(key: &str, version: Version, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedRecord {
            key: key.to_string(),
            version,
            reason: e.to_string(),
        })
    }
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub record: LeaseRecord,
    pub version: Version,
}

/// Change notification for a watched key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The key was written and now holds this record
    Put(VersionedRecord),
    /// The key was written with bytes that do not decode
    Malformed { version: Version, reason: String },
    /// The key was removed (operator action)
    Deleted,
}

/// Stream of change notifications for one key
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Capability interface over a strongly-consistent key/value store
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the record under `key`, or `None` if absent
    async fn read(&self, key: &str) -> Result<Option<VersionedRecord>>;

    /// Create the record only if the key is absent.
    /// Fails with [`Error::VersionConflict`] if it already exists.
    async fn create_if_absent(&self, key: &str, record: &LeaseRecord) -> Result<Version>;

    /// Replace the record only if its current version equals `expected`.
    /// Fails with [`Error::VersionConflict`] otherwise (including when absent).
    async fn update_if_version(
        &self,
        key: &str,
        record: &LeaseRecord,
        expected: Version,
    ) -> Result<Version>;

    /// Subscribe to changes of `key`
    async fn watch(&self, key: &str) -> Result<WatchStream>;
}

/// Open the store selected by the configuration
pub fn open_store(config: &LeaseKeeperConfig) -> Result<Arc<dyn LeaseStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!(
                "Using the in-memory lease store; only candidates in this process can see it"
            );
            Ok(Arc::new(InMemoryLeaseStore::new()))
        }
        StoreBackend::Sqlite => {
            let path = config.store.path.as_ref().ok_or_else(|| {
                Error::Config("store.path is required for the sqlite backend".into())
            })?;
            let store =
                SqliteLeaseStore::open(path, config.busy_timeout(), config.poll_interval())?;
            Ok(Arc::new(store))
        }
    }
}
