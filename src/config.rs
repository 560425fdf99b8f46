//! LeaseKeeper Configuration
//!
//! This module provides configuration structures for a lease election
//! candidate and the store it elects through.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main LeaseKeeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseKeeperConfig {
    /// Election configuration
    pub election: ElectionConfig,

    /// Lease store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Key of the lease record shared by all candidates
    pub key: String,

    /// This candidate's identity (generated when empty)
    #[serde(default)]
    pub self_id: String,

    /// How long an acquired or renewed lease stays valid
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Cadence of the renewal scheduler
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,

    /// Bound on every store call
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Bound on waiting for background tasks at shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Maximum random delay before the first tick (0 = none)
    #[serde(default)]
    pub startup_jitter_ms: u64,

    /// Expire our lease on shutdown so a successor need not wait it out
    #[serde(default = "default_true")]
    pub release_on_shutdown: bool,
}

/// Lease store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store (single-process demos and tests)
    Memory,
    /// Shared SQLite file
    Sqlite,
}

/// Lease store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Database file for the sqlite backend
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Watch polling interval for the sqlite backend
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long sqlite waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_lease_duration_ms() -> u64 {
    15_000
}

fn default_renew_interval_ms() -> u64 {
    5_000
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

fn default_shutdown_timeout_ms() -> u64 {
    3_000
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_busy_timeout_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            poll_interval_ms: default_poll_interval_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ElectionConfig {
    /// Create a config with default timings
    pub fn new(key: impl Into<String>, self_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            self_id: self_id.into(),
            lease_duration_ms: default_lease_duration_ms(),
            renew_interval_ms: default_renew_interval_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            startup_jitter_ms: 0,
            release_on_shutdown: true,
        }
    }

    /// Override lease timings
    pub fn with_timings(mut self, lease_duration: Duration, renew_interval: Duration) -> Self {
        self.lease_duration_ms = lease_duration.as_millis() as u64;
        self.renew_interval_ms = renew_interval.as_millis() as u64;
        self
    }

    /// Override the store call timeout
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout_ms = store_timeout.as_millis() as u64;
        self
    }

    /// Validate the election timings.
    ///
    /// `renew_interval < lease_duration` is required for safety: a leader
    /// must get at least one renewal attempt in before its lease lapses.
    pub fn validate(&self) -> crate::Result<()> {
        if self.key.is_empty() {
            return Err(crate::Error::Config("election.key cannot be empty".into()));
        }

        if self.self_id.is_empty() {
            return Err(crate::Error::Config("election.self_id cannot be empty".into()));
        }

        if self.lease_duration_ms == 0 || self.renew_interval_ms == 0 {
            return Err(crate::Error::Config(
                "election.lease_duration_ms and election.renew_interval_ms must be positive".into(),
            ));
        }

        if self.renew_interval_ms >= self.lease_duration_ms {
            return Err(crate::Error::Config(format!(
                "election.renew_interval_ms ({}) must be smaller than election.lease_duration_ms ({})",
                self.renew_interval_ms, self.lease_duration_ms
            )));
        }

        if self.store_timeout_ms == 0 || self.store_timeout_ms >= self.renew_interval_ms {
            return Err(crate::Error::Config(format!(
                "election.store_timeout_ms ({}) must be positive and smaller than election.renew_interval_ms ({})",
                self.store_timeout_ms, self.renew_interval_ms
            )));
        }

        if self.lease_duration_ms < 3 * self.renew_interval_ms {
            tracing::warn!(
                "election.lease_duration_ms ({}) is less than 3x election.renew_interval_ms ({}); \
                 a single failed renewal may let the lease lapse",
                self.lease_duration_ms,
                self.renew_interval_ms
            );
        }

        Ok(())
    }

    /// Lease duration as Duration
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Renewal interval as Duration
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    /// Store call timeout as Duration
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Startup jitter bound as Duration
    pub fn startup_jitter(&self) -> Duration {
        Duration::from_millis(self.startup_jitter_ms)
    }
}

impl LeaseKeeperConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let mut config: LeaseKeeperConfig = toml::from_str(content)?;
        if config.election.self_id.is_empty() {
            config.election.self_id = generate_self_id();
        }
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.election.validate()?;

        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_none() {
            return Err(crate::Error::Config(
                "store.path is required for the sqlite backend".into(),
            ));
        }

        if self.store.poll_interval_ms == 0 {
            return Err(crate::Error::Config("store.poll_interval_ms must be positive".into()));
        }

        Ok(())
    }

    /// Get watch poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.poll_interval_ms)
    }

    /// Get sqlite busy timeout as Duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    /// Sample configuration written by `leasekeeper init`
    pub fn sample(self_id: &str) -> Self {
        Self {
            election: ElectionConfig::new("leasekeeper/leader", self_id),
            store: StoreConfig {
                path: Some(PathBuf::from("/var/lib/leasekeeper/leases.db")),
                ..StoreConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }
}

/// Build a candidate identity from the host name and a random suffix
pub fn generate_self_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "candidate".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[election]
key = "orders/consumer-leader"
self_id = "pod-1"
lease_duration_ms = 15000
renew_interval_ms = 5000

[store]
backend = "sqlite"
path = "/tmp/leases.db"
"#;

        let config = LeaseKeeperConfig::from_str(toml).unwrap();
        assert_eq!(config.election.key, "orders/consumer-leader");
        assert_eq!(config.election.self_id, "pod-1");
        assert_eq!(config.election.lease_duration(), Duration::from_secs(15));
        assert_eq!(config.election.store_timeout(), Duration::from_secs(2));
        assert!(config.election.release_on_shutdown);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_renew_interval_must_be_below_lease_duration() {
        let toml = r#"
[election]
key = "k"
self_id = "a"
lease_duration_ms = 5000
renew_interval_ms = 5000

[store]
backend = "memory"
"#;

        let err = LeaseKeeperConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_store_timeout_must_fit_in_renew_interval() {
        let config = ElectionConfig::new("k", "a")
            .with_timings(Duration::from_secs(15), Duration::from_secs(5))
            .with_store_timeout(Duration::from_secs(5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_self_id_is_generated() {
        let toml = r#"
[election]
key = "k"

[store]
backend = "memory"
"#;

        let config = LeaseKeeperConfig::from_str(toml).unwrap();
        assert!(!config.election.self_id.is_empty());
        assert_ne!(generate_self_id(), generate_self_id());
    }

    #[test]
    fn test_sqlite_requires_path() {
        let toml = r#"
[election]
key = "k"
self_id = "a"
"#;

        assert!(LeaseKeeperConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_sample_round_trips_through_toml() {
        let sample = LeaseKeeperConfig::sample("node-1");
        let rendered = sample.to_toml().unwrap();
        let parsed = LeaseKeeperConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.election.self_id, "node-1");
        assert_eq!(parsed.store.path, sample.store.path);
    }
}
