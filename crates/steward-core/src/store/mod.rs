//! Snapshot persistence
//!
//! The store keeps the latest `AccountSnapshot` per account, an append-only
//! per-entity history with one record for every pass that changed the
//! entity, and a ledger of game events such as incoming attacks. Writes are
//! driven by the engine's persistence task, never by the reconciliation path
//! itself.

mod memory;
mod sqlite;

pub use memory::MemorySnapshotStore;
pub use sqlite::SqliteSnapshotStore;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, StewardError};
use crate::snapshot::{AccountSnapshot, EntitySnapshot};
use crate::types::{EntityId, Timestamp};

/// Default history retention: one week
pub const DEFAULT_RETENTION_HOURS: i64 = 24 * 7;

/// Longest retention or query window accepted: ten years
pub const MAX_WINDOW_HOURS: i64 = 24 * 365 * 10;

/// Hour count as a retention or query window, rejecting values outside
/// `1..=MAX_WINDOW_HOURS`
pub fn window_hours(hours: i64) -> Result<Duration> {
    if !(1..=MAX_WINDOW_HOURS).contains(&hours) {
        return Err(StewardError::Config(format!(
            "window of {} hours is outside 1..={}",
            hours, MAX_WINDOW_HOURS
        )));
    }
    Duration::try_hours(hours)
        .ok_or_else(|| StewardError::Config(format!("window of {} hours overflows", hours)))
}

/// Record counts for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub accounts: u64,
    pub history_records: u64,
    pub tracked_entities: u64,
    #[serde(default)]
    pub game_events: u64,
}

/// Kinds of entry in the game-event ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEventKind {
    /// A hostile movement toward one of the account's villages was first seen
    Attack,
}

impl GameEventKind {
    pub fn name(self) -> &'static str {
        match self {
            GameEventKind::Attack => "attack",
        }
    }
}

impl fmt::Display for GameEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    pub id: Uuid,
    pub account_id: String,
    pub kind: GameEventKind,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    pub recorded_at: Timestamp,
    /// Kind-specific details
    #[serde(default)]
    pub data: serde_json::Value,
}

impl GameEvent {
    pub fn new(account_id: impl Into<String>, kind: GameEventKind, recorded_at: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            kind,
            entity_id: None,
            recorded_at,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Everything stored for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountExport {
    pub account_id: String,
    pub exported_at: Timestamp,
    pub latest: Option<AccountSnapshot>,
    /// Every history record, grouped by entity, oldest first within each
    pub history: Vec<EntitySnapshot>,
    /// Oldest first
    pub events: Vec<GameEvent>,
}

/// Persistence backend for reconciled snapshots
pub trait SnapshotStore: Send + Sync {
    /// Replace the latest snapshot for its account and append one history
    /// record for each entity in `changed`. Ids not present in the snapshot
    /// are ignored.
    fn put(&self, snapshot: &AccountSnapshot, changed: &[EntityId]) -> Result<()>;

    fn get_latest(&self, account_id: &str) -> Result<Option<AccountSnapshot>>;

    /// Entity history within `window` of now, oldest first
    fn get_entity_history(
        &self,
        account_id: &str,
        entity_id: &EntityId,
        window: Duration,
    ) -> Result<Vec<EntitySnapshot>>;

    fn record_event(&self, event: &GameEvent) -> Result<()>;

    /// Game events recorded within `window` of now, oldest first
    fn get_events(&self, account_id: &str, window: Duration) -> Result<Vec<GameEvent>>;

    /// Latest snapshot, full history and event ledger of one account
    fn export(&self, account_id: &str) -> Result<AccountExport>;

    /// Drop history and events older than `retain`, keeping each entity's
    /// newest history record. Returns the number of records removed.
    fn prune(&self, retain: Duration) -> Result<usize>;

    fn stats(&self) -> Result<StoreStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_hours_bounds() {
        assert_eq!(window_hours(24).unwrap(), Duration::days(1));
        assert_eq!(window_hours(MAX_WINDOW_HOURS).unwrap(), Duration::days(3650));
        for bad in [0, -5, MAX_WINDOW_HOURS + 1, i64::MAX, i64::MIN] {
            assert!(matches!(window_hours(bad), Err(StewardError::Config(_))), "{}", bad);
        }
    }
}
