//! Raw observation source seam
//!
//! The core never talks to the game directly. A source produces structured
//! wide observations; how it gets them (HTTP, a headless page, a fixture) is
//! its own business, as are retries and backoff.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::FetchError;
use crate::observation::FullAccountObservation;

/// Producer of wide account observations
#[async_trait]
pub trait AccountSource: Send + Sync {
    /// Fetch every entity at once. Slow; only called when the scheduler allows it.
    async fn fetch_full_account(&self) -> Result<FullAccountObservation, FetchError>;
}

/// Reads a serialized `FullAccountObservation` from a JSON file on each fetch.
///
/// Lets an external scraper drop its output on disk and the engine pick it up.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AccountSource for JsonFileSource {
    async fn fetch_full_account(&self) -> Result<FullAccountObservation, FetchError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FetchError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        let observation: FullAccountObservation = serde_json::from_str(&raw)
            .map_err(|e| FetchError::Decode(format!("{}: {}", self.path.display(), e)))?;
        debug!(
            path = %self.path.display(),
            entities = observation.entities.len(),
            "read wide observation from file"
        );
        Ok(observation)
    }
}
