//! SQLite Lease Store
//!
//! Lease records kept in a SQLite file shared by every candidate on a host.
//! SQLite serializes writers on the file lock, and each conditional write runs
//! in an IMMEDIATE transaction, so compare-and-swap is atomic across
//! processes. Versions come from a single revision counter in the same file.
//!
//! SQLite has no change feed, so `watch` polls the record version.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{LeaseRecord, LeaseStore, Version, VersionedRecord, WatchEvent, WatchStream};
use crate::error::{Error, Result};

/// Buffered change events per watcher
const WATCH_BUFFER: usize = 64;

/// Lease store backed by a shared SQLite file
pub struct SqliteLeaseStore {
    /// Database connection
    conn: Arc<Mutex<Connection>>,
    /// Database file
    path: PathBuf,
    /// How often watchers poll for changes
    poll_interval: Duration,
}

impl SqliteLeaseStore {
    /// Create or open the lease database at `path`
    pub fn open(path: &Path, busy_timeout: Duration, poll_interval: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        // Initialize schema
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                key TEXT PRIMARY KEY,
                record BLOB NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS revision (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                value INTEGER NOT NULL
            );
            "#,
        )?;

        tracing::debug!("Opened lease database at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            poll_interval,
        })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write raw bytes under `key` unconditionally (operator repair)
    pub async fn put_raw(&self, key: &str, bytes: Vec<u8>) -> Result<Version> {
        let key = key.to_string();
        run_blocking(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version = next_revision(&tx)?;
            tx.execute(
                r#"
                INSERT INTO leases (key, record, version) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    record = ?2,
                    version = ?3,
                    updated_at = CURRENT_TIMESTAMP
                "#,
                params![key, bytes, version.0 as i64],
            )?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    /// Remove `key` unconditionally (operator reset)
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        run_blocking(&self.conn, move |conn| {
            let removed = conn.execute("DELETE FROM leases WHERE key = ?1", params![key])?;
            Ok(removed > 0)
        })
        .await
    }
}

/// Run a closure against the connection on the blocking pool
async fn run_blocking<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = conn
            .lock()
            .map_err(|_| Error::StoreUnavailable("lease database lock poisoned".into()))?;
        f(&mut guard)
    })
    .await
    .map_err(|e| Error::StoreUnavailable(format!("lease database task failed: {}", e)))?
}

fn read_entry(conn: &Connection, key: &str) -> Result<Option<(Vec<u8>, Version)>> {
    let row = conn
        .query_row(
            "SELECT record, version FROM leases WHERE key = ?1",
            params![key],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(bytes, version)| (bytes, Version(version as u64))))
}

fn current_version(conn: &Connection, key: &str) -> Result<Option<Version>> {
    let version = conn
        .query_row(
            "SELECT version FROM leases WHERE key = ?1",
            params![key],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(version.map(|v| Version(v as u64)))
}

fn next_revision(conn: &Connection) -> Result<Version> {
    conn.execute(
        r#"
        INSERT INTO revision (id, value) VALUES (0, 1)
        ON CONFLICT(id) DO UPDATE SET value = value + 1
        "#,
        [],
    )?;
    let value: i64 = conn.query_row("SELECT value FROM revision WHERE id = 0", [], |row| {
        row.get(0)
    })?;
    Ok(Version(value as u64))
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn read(&self, key: &str) -> Result<Option<VersionedRecord>> {
        let key = key.to_string();
        run_blocking(&self.conn, move |conn| match read_entry(conn, &key)? {
            Some((bytes, version)) => {
                let record = LeaseRecord::decode(&key, version, &bytes)?;
                Ok(Some(VersionedRecord { record, version }))
            }
            None => Ok(None),
        })
        .await
    }

    async fn create_if_absent(&self, key: &str, record: &LeaseRecord) -> Result<Version> {
        let key = key.to_string();
        let bytes = record.encode()?;
        run_blocking(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(actual) = current_version(&tx, &key)? {
                return Err(Error::VersionConflict {
                    key,
                    expected: None,
                    actual: Some(actual),
                });
            }

            let version = next_revision(&tx)?;
            tx.execute(
                "INSERT INTO leases (key, record, version) VALUES (?1, ?2, ?3)",
                params![key, bytes, version.0 as i64],
            )?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    async fn update_if_version(
        &self,
        key: &str,
        record: &LeaseRecord,
        expected: Version,
    ) -> Result<Version> {
        let key = key.to_string();
        let bytes = record.encode()?;
        run_blocking(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let actual = current_version(&tx, &key)?;
            if actual != Some(expected) {
                return Err(Error::VersionConflict {
                    key,
                    expected: Some(expected),
                    actual,
                });
            }

            let version = next_revision(&tx)?;
            tx.execute(
                r#"
                UPDATE leases SET record = ?2, version = ?3, updated_at = CURRENT_TIMESTAMP
                WHERE key = ?1 AND version = ?4
                "#,
                params![key, bytes, version.0 as i64, expected.0 as i64],
            )?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let key = key.to_string();
        let conn = Arc::clone(&self.conn);
        let poll_interval = self.poll_interval;

        let mut last_seen = {
            let key = key.clone();
            run_blocking(&conn, move |c| current_version(c, &key)).await?
        };

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let polled = {
                    let key = key.clone();
                    run_blocking(&conn, move |c| read_entry(c, &key)).await
                };

                let entry = match polled {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::debug!("Lease watch poll for {} failed: {}", key, e);
                        continue;
                    }
                };

                let version = entry.as_ref().map(|(_, v)| *v);
                if version == last_seen {
                    continue;
                }
                last_seen = version;

                let event = match entry {
                    Some((bytes, version)) => match LeaseRecord::decode(&key, version, &bytes) {
                        Ok(record) => WatchEvent::Put(VersionedRecord { record, version }),
                        Err(e) => WatchEvent::Malformed {
                            version,
                            reason: e.to_string(),
                        },
                    },
                    None => WatchEvent::Deleted,
                };

                if tx.send(event).await.is_err() {
                    break;
                }
            }

            tracing::debug!("Lease watch for {} stopped", key);
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StoreUnavailable(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> SqliteLeaseStore {
        SqliteLeaseStore::open(
            &dir.join("leases.db"),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_conditional_writes() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        assert!(store.read("lock").await.unwrap().is_none());

        let v1 = store
            .create_if_absent("lock", &LeaseRecord::new("a", 100))
            .await
            .unwrap();
        assert!(store
            .create_if_absent("lock", &LeaseRecord::new("b", 100))
            .await
            .unwrap_err()
            .is_conflict());

        let v2 = store
            .update_if_version("lock", &LeaseRecord::new("a", 200), v1)
            .await
            .unwrap();
        assert!(v2 > v1);

        let err = store
            .update_if_version("lock", &LeaseRecord::new("b", 300), v1)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let read = store.read("lock").await.unwrap().unwrap();
        assert_eq!(read.version, v2);
        assert_eq!(read.record, LeaseRecord::new("a", 200));
    }

    #[tokio::test]
    async fn test_sqlite_shared_between_handles() {
        let dir = tempdir().unwrap();
        let first = open(dir.path());
        let second = open(dir.path());

        let v1 = first
            .create_if_absent("lock", &LeaseRecord::new("a", 100))
            .await
            .unwrap();

        // The second handle sees the first handle's write and races on it
        let seen = second.read("lock").await.unwrap().unwrap();
        assert_eq!(seen.version, v1);
        second
            .update_if_version("lock", &LeaseRecord::new("b", 500), v1)
            .await
            .unwrap();

        assert!(first
            .update_if_version("lock", &LeaseRecord::new("a", 200), v1)
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_sqlite_versions_survive_delete() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let v1 = store
            .create_if_absent("lock", &LeaseRecord::new("a", 100))
            .await
            .unwrap();
        assert!(store.delete("lock").await.unwrap());
        let v2 = store
            .create_if_absent("lock", &LeaseRecord::new("b", 100))
            .await
            .unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn test_sqlite_malformed_record() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let version = store.put_raw("lock", b"\x00\x01".to_vec()).await.unwrap();
        match store.read("lock").await.unwrap_err() {
            Error::MalformedRecord { version: v, .. } => assert_eq!(v, version),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_sqlite_watch_polls_changes() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let mut events = store.watch("lock").await.unwrap();

        let version = store
            .create_if_absent("lock", &LeaseRecord::new("a", 100))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        match event {
            WatchEvent::Put(vr) => assert_eq!(vr.version, version),
            other => panic!("unexpected event: {other:?}"),
        }

        store.delete("lock").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, WatchEvent::Deleted);
    }
}
