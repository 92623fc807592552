//! Engine configuration

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::aggregate::{Aggregator, QueueProxy, TroopUpkeep};
use crate::alerts::AlertThresholds;
use crate::error::{Result, StewardError};
use crate::scheduler::SchedulerPolicy;
use crate::snapshot::account_id_for_server;
use crate::store::{window_hours, DEFAULT_RETENTION_HOURS, MAX_WINDOW_HOURS};

/// Main engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Game server host, e.g. `ts3.x1.europe.travian.com`
    pub server_identity: String,

    /// Explicit account id; derived from the server identity when unset
    pub account_id: Option<String>,

    pub scheduler: SchedulerSettings,

    pub alerts: AlertSettings,

    pub store: StoreSettings,

    pub estimates: EstimateSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_identity: "localhost".to_string(),
            account_id: None,
            scheduler: SchedulerSettings::default(),
            alerts: AlertSettings::default(),
            store: StoreSettings::default(),
            estimates: EstimateSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_identity(mut self, server: impl Into<String>) -> Self {
        self.server_identity = server.into();
        self
    }

    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.database_path = Some(path.into());
        self
    }

    pub fn with_min_refresh_interval_secs(mut self, secs: u64) -> Self {
        self.scheduler.min_refresh_interval_secs = secs;
        self
    }

    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.scheduler.poll_interval_secs = secs;
        self
    }

    /// Account id in effect
    pub fn account_id(&self) -> String {
        self.account_id
            .clone()
            .unwrap_or_else(|| account_id_for_server(&self.server_identity))
    }

    pub fn scheduler_policy(&self) -> SchedulerPolicy {
        SchedulerPolicy {
            min_interval: secs(self.scheduler.min_refresh_interval_secs),
            failure_threshold: self.scheduler.failure_threshold,
            degraded_retry_interval: secs(self.scheduler.degraded_retry_interval_secs),
        }
    }

    pub fn alert_thresholds(&self) -> AlertThresholds {
        AlertThresholds {
            overflow_horizon_hours: self.alerts.overflow_horizon_hours,
            starvation_horizon_hours: self.alerts.starvation_horizon_hours,
        }
    }

    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(
            Arc::new(TroopUpkeep {
                per_troop: self.estimates.crop_per_troop,
                per_entity_default: self.estimates.crop_per_entity,
            }),
            Arc::new(QueueProxy {
                per_queue_slot: self.estimates.population_per_queue_slot,
            }),
        )
    }

    /// History retention window. Falls back to the default when the
    /// configured value is out of range; `validate` rejects such values.
    pub fn retention(&self) -> Duration {
        i64::try_from(self.store.retention_hours)
            .ok()
            .and_then(|hours| window_hours(hours).ok())
            .unwrap_or_else(|| Duration::hours(DEFAULT_RETENTION_HOURS))
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server_identity.trim().is_empty() {
            return Err(StewardError::Config("server_identity must not be empty".into()));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(StewardError::Config("poll_interval_secs must be positive".into()));
        }
        if self.scheduler.failure_threshold == 0 {
            return Err(StewardError::Config("failure_threshold must be at least 1".into()));
        }
        let retention_ok = i64::try_from(self.store.retention_hours)
            .map_or(false, |hours| window_hours(hours).is_ok());
        if !retention_ok {
            return Err(StewardError::Config(format!(
                "retention_hours must be between 1 and {}",
                MAX_WINDOW_HOURS
            )));
        }
        for (name, hours) in [
            ("overflow_horizon_hours", self.alerts.overflow_horizon_hours),
            ("starvation_horizon_hours", self.alerts.starvation_horizon_hours),
        ] {
            if !hours.is_finite() || hours <= 0.0 {
                return Err(StewardError::Config(format!("{} must be a positive number", name)));
            }
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn secs(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Refresh timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Period of the background refresh loop
    pub poll_interval_secs: u64,

    /// Minimum gap between successful wide fetches
    pub min_refresh_interval_secs: u64,

    /// Consecutive failures before serving from cache only
    pub failure_threshold: u32,

    /// Wait before retrying a failing source
    pub degraded_retry_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            min_refresh_interval_secs: 60,
            failure_threshold: 3,
            degraded_retry_interval_secs: 600, // 10 minutes
        }
    }
}

/// Alert horizons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub overflow_horizon_hours: f64,
    pub starvation_horizon_hours: f64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        let thresholds = AlertThresholds::default();
        Self {
            overflow_horizon_hours: thresholds.overflow_horizon_hours,
            starvation_horizon_hours: thresholds.starvation_horizon_hours,
        }
    }
}

/// Snapshot persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite file; no persistence when unset
    pub database_path: Option<PathBuf>,

    /// Entity history retention in hours
    pub retention_hours: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            retention_hours: DEFAULT_RETENTION_HOURS as u64,
        }
    }
}

/// Parameters of the consumption and population proxies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateSettings {
    /// Crop per hour per known troop
    pub crop_per_troop: f64,

    /// Crop per hour for a village whose troops are unknown
    pub crop_per_entity: f64,

    pub population_per_queue_slot: u64,
}

impl Default for EstimateSettings {
    fn default() -> Self {
        let upkeep = TroopUpkeep::default();
        Self {
            crop_per_troop: upkeep.per_troop,
            crop_per_entity: upkeep.per_entity_default,
            population_per_queue_slot: QueueProxy::default().per_queue_slot,
        }
    }
}
