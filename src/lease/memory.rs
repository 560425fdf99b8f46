//! In-Memory Lease Store
//!
//! A linearizable store living inside one process. Every operation takes a
//! single lock, so conditional writes are atomic with respect to each other,
//! which is all the election engine needs from a backing store.
//!
//! Versions come from one store-wide revision counter rather than a per-key
//! counter, so a key that is deleted and recreated never reuses a version a
//! stale leader might still hold.
//!
//! Fault injection hooks let tests simulate an unreachable store, a number of
//! failing calls, slow calls, and corrupted records.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use super::{LeaseRecord, LeaseStore, Version, VersionedRecord, WatchEvent, WatchStream};
use crate::error::{Error, Result};

/// Capacity of the change feed; slow watchers skip what they miss
const WATCH_CAPACITY: usize = 256;

struct StoredEntry {
    bytes: Vec<u8>,
    version: Version,
}

#[derive(Default)]
struct Faults {
    unavailable: bool,
    fail_next: u32,
    latency: Option<Duration>,
}

struct Inner {
    entries: HashMap<String, StoredEntry>,
    revision: u64,
    faults: Faults,
}

/// In-process linearizable lease store
pub struct InMemoryLeaseStore {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<(String, WatchEvent)>,
}

impl InMemoryLeaseStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                revision: 0,
                faults: Faults::default(),
            }),
            changes,
        }
    }

    /// Make every call fail with [`Error::StoreUnavailable`] until cleared
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.faults.unavailable = unavailable;
    }

    /// Fail the next `count` read/create/update calls
    pub async fn fail_next(&self, count: u32) {
        self.inner.lock().await.faults.fail_next = count;
    }

    /// Delay every read/create/update call by `latency`
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().await.faults.latency = latency;
    }

    /// Write raw bytes under `key` unconditionally, bypassing the codec.
    /// Models an operator or a mismatched client writing the record.
    pub async fn put_raw(&self, key: &str, bytes: Vec<u8>) -> Version {
        let mut inner = self.inner.lock().await;
        let version = inner.bump();
        inner.entries.insert(
            key.to_string(),
            StoredEntry {
                bytes: bytes.clone(),
                version,
            },
        );
        self.publish(key, event_for(key, version, &bytes));
        version
    }

    /// Remove `key` unconditionally (operator reset)
    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.entries.remove(key).is_some();
        if removed {
            self.publish(key, WatchEvent::Deleted);
        }
        removed
    }

    /// Number of receivers currently attached to the change feed
    pub fn watcher_count(&self) -> usize {
        self.changes.receiver_count()
    }

    async fn inject_faults(&self) -> Result<()> {
        let latency = {
            let mut inner = self.inner.lock().await;
            if inner.faults.unavailable {
                return Err(Error::StoreUnavailable("store marked unavailable".into()));
            }
            if inner.faults.fail_next > 0 {
                inner.faults.fail_next -= 1;
                return Err(Error::StoreUnavailable("injected failure".into()));
            }
            inner.faults.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn publish(&self, key: &str, event: WatchEvent) {
        // No receivers is fine
        let _ = self.changes.send((key.to_string(), event));
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn bump(&mut self) -> Version {
        self.revision += 1;
        Version(self.revision)
    }
}

fn event_for(key: &str, version: Version, bytes: &[u8]) -> WatchEvent {
    match LeaseRecord::decode(key, version, bytes) {
        Ok(record) => WatchEvent::Put(VersionedRecord { record, version }),
        Err(e) => WatchEvent::Malformed {
            version,
            reason: e.to_string(),
        },
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn read(&self, key: &str) -> Result<Option<VersionedRecord>> {
        self.inject_faults().await?;

        let inner = self.inner.lock().await;
        match inner.entries.get(key) {
            Some(entry) => {
                let record = LeaseRecord::decode(key, entry.version, &entry.bytes)?;
                Ok(Some(VersionedRecord {
                    record,
                    version: entry.version,
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_if_absent(&self, key: &str, record: &LeaseRecord) -> Result<Version> {
        self.inject_faults().await?;
        let bytes = record.encode()?;

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.entries.get(key) {
            return Err(Error::VersionConflict {
                key: key.to_string(),
                expected: None,
                actual: Some(existing.version),
            });
        }

        let version = inner.bump();
        inner
            .entries
            .insert(key.to_string(), StoredEntry { bytes, version });
        self.publish(
            key,
            WatchEvent::Put(VersionedRecord {
                record: record.clone(),
                version,
            }),
        );
        Ok(version)
    }

    async fn update_if_version(
        &self,
        key: &str,
        record: &LeaseRecord,
        expected: Version,
    ) -> Result<Version> {
        self.inject_faults().await?;
        let bytes = record.encode()?;

        let mut inner = self.inner.lock().await;
        let actual = inner.entries.get(key).map(|e| e.version);
        if actual != Some(expected) {
            return Err(Error::VersionConflict {
                key: key.to_string(),
                expected: Some(expected),
                actual,
            });
        }

        let version = inner.bump();
        inner
            .entries
            .insert(key.to_string(), StoredEntry { bytes, version });
        self.publish(
            key,
            WatchEvent::Put(VersionedRecord {
                record: record.clone(),
                version,
            }),
        );
        Ok(version)
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let key = key.to_string();
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(move |item| {
            let event = match item {
                Ok((changed, event)) if changed == key => Some(event),
                // Other keys, or events lost to lag
                _ => None,
            };
            futures::future::ready(event)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_conflict() {
        let store = InMemoryLeaseStore::new();
        let record = LeaseRecord::new("a", 100);

        let v1 = store.create_if_absent("lock", &record).await.unwrap();
        let err = store
            .create_if_absent("lock", &LeaseRecord::new("b", 100))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let read = store.read("lock").await.unwrap().unwrap();
        assert_eq!(read.version, v1);
        assert_eq!(read.record.holder_id, "a");
    }

    #[tokio::test]
    async fn test_update_requires_matching_version() {
        let store = InMemoryLeaseStore::new();
        let v1 = store
            .create_if_absent("lock", &LeaseRecord::new("a", 100))
            .await
            .unwrap();

        let v2 = store
            .update_if_version("lock", &LeaseRecord::new("a", 200), v1)
            .await
            .unwrap();
        assert!(v2 > v1);

        // Stale version loses
        let err = store
            .update_if_version("lock", &LeaseRecord::new("b", 300), v1)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Absent key is a conflict too
        let err = store
            .update_if_version("other", &LeaseRecord::new("b", 300), v1)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_recreated_key_never_reuses_versions() {
        let store = InMemoryLeaseStore::new();
        let v1 = store
            .create_if_absent("lock", &LeaseRecord::new("a", 100))
            .await
            .unwrap();
        assert!(store.delete("lock").await);

        let v2 = store
            .create_if_absent("lock", &LeaseRecord::new("b", 100))
            .await
            .unwrap();
        assert_ne!(v1, v2);
        assert!(store
            .update_if_version("lock", &LeaseRecord::new("a", 200), v1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = InMemoryLeaseStore::new();

        store.fail_next(2).await;
        assert!(store.read("lock").await.unwrap_err().is_transient());
        assert!(store.read("lock").await.unwrap_err().is_transient());
        assert!(store.read("lock").await.unwrap().is_none());

        store.set_unavailable(true).await;
        assert!(store
            .create_if_absent("lock", &LeaseRecord::new("a", 1))
            .await
            .unwrap_err()
            .is_transient());
        store.set_unavailable(false).await;
        assert!(store
            .create_if_absent("lock", &LeaseRecord::new("a", 1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_malformed_record_carries_version() {
        let store = InMemoryLeaseStore::new();
        let version = store.put_raw("lock", b"garbage".to_vec()).await;

        match store.read("lock").await.unwrap_err() {
            Error::MalformedRecord { version: v, .. } => assert_eq!(v, version),
            other => panic!("unexpected error: {other}"),
        }

        // Still replaceable through a conditional write
        store
            .update_if_version("lock", &LeaseRecord::new("a", 10), version)
            .await
            .unwrap();
        assert!(store.read("lock").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watch_filters_by_key() {
        let store = InMemoryLeaseStore::new();
        let mut events = store.watch("lock").await.unwrap();

        store
            .create_if_absent("other", &LeaseRecord::new("x", 1))
            .await
            .unwrap();
        let version = store
            .create_if_absent("lock", &LeaseRecord::new("a", 1))
            .await
            .unwrap();
        store.delete("lock").await;

        match events.next().await.unwrap() {
            WatchEvent::Put(vr) => {
                assert_eq!(vr.version, version);
                assert_eq!(vr.record.holder_id, "a");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(events.next().await.unwrap(), WatchEvent::Deleted);
    }
}
