//! LeaseKeeper Error Types

use thiserror::Error;

use crate::lease::Version;

/// Result type alias for LeaseKeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// LeaseKeeper error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    // Store errors
    #[error("Version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<Version>,
        actual: Option<Version>,
    },

    #[error("Store call timed out after {0:?}")]
    StoreTimeout(std::time::Duration),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed lease record under {key} at version {version}: {reason}")]
    MalformedRecord {
        key: String,
        version: Version,
        reason: String,
    },

    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Candidate is already running")]
    AlreadyRunning,
}

impl Error {
    /// Check if this error is a transient store failure that should be
    /// retried on the next tick without touching leadership belief
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StoreTimeout(_) | Error::StoreUnavailable(_) | Error::Io(_)
        )
    }

    /// Check if this error means another writer won a conditional write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }
}
