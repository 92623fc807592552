//! Error types for Steward Core
//!
//! Three failure classes reach callers: wide-source fetch failures, malformed
//! observations and persistence failures. None of them may leave the
//! in-memory `AccountSnapshot` half-merged. We use `thiserror` for the
//! Display/Error plumbing.

use thiserror::Error;

/// Result type alias for Steward operations
pub type Result<T> = std::result::Result<T, StewardError>;

/// Main error type for Steward operations
#[derive(Error, Debug)]
pub enum StewardError {
    /// Wide-source I/O failure
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Observation rejected before merging
    #[error("Malformed observation: {0}")]
    MalformedObservation(String),

    /// Snapshot store read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Cold start with no cache and a failed first fetch
    #[error("No data yet: {0}")]
    NoDataYet(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the Raw Observation Source when fetching the wide view
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source returned unparseable data: {0}")]
    Decode(String),

    #[error("fetch abandoned in favour of a forced refresh")]
    Abandoned,
}

impl From<rusqlite::Error> for StewardError {
    fn from(e: rusqlite::Error) -> Self {
        StewardError::Persistence(e.to_string())
    }
}

impl From<anyhow::Error> for StewardError {
    fn from(e: anyhow::Error) -> Self {
        StewardError::Persistence(format!("{:#}", e))
    }
}

impl From<toml::de::Error> for StewardError {
    fn from(e: toml::de::Error) -> Self {
        StewardError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for StewardError {
    fn from(e: toml::ser::Error) -> Self {
        StewardError::Config(e.to_string())
    }
}

impl StewardError {
    /// Whether the error came from the snapshot store
    pub fn is_persistence(&self) -> bool {
        matches!(self, StewardError::Persistence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_wraps() {
        let err: StewardError = FetchError::Unavailable("timeout".into()).into();
        assert!(err.to_string().contains("timeout"));
        assert!(!err.is_persistence());
    }

    #[test]
    fn test_anyhow_maps_to_persistence() {
        let err: StewardError = anyhow::anyhow!("disk full").context("INSERT entity_history").into();
        assert!(err.is_persistence());
        assert!(err.to_string().contains("disk full"));
    }
}
