//! In-process snapshot store, for tests and ephemeral runs

use chrono::Duration;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{AccountExport, GameEvent, SnapshotStore, StoreStats};
use crate::error::Result;
use crate::snapshot::{AccountSnapshot, EntitySnapshot};
use crate::types::{now, EntityId};

type HistoryKey = (String, EntityId);

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    latest: RwLock<HashMap<String, AccountSnapshot>>,
    /// Append-only records per (account, entity), in commit order
    history: RwLock<BTreeMap<HistoryKey, Vec<EntitySnapshot>>>,
    events: RwLock<Vec<GameEvent>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn put(&self, snapshot: &AccountSnapshot, changed: &[EntityId]) -> Result<()> {
        let mut history = self.history.write();
        for entity in changed.iter().filter_map(|id| snapshot.entities.get(id)) {
            history
                .entry((snapshot.account_id.clone(), entity.id.clone()))
                .or_default()
                .push(entity.clone());
        }
        self.latest
            .write()
            .insert(snapshot.account_id.clone(), snapshot.clone());
        Ok(())
    }

    fn get_latest(&self, account_id: &str) -> Result<Option<AccountSnapshot>> {
        Ok(self.latest.read().get(account_id).cloned())
    }

    fn get_entity_history(
        &self,
        account_id: &str,
        entity_id: &EntityId,
        window: Duration,
    ) -> Result<Vec<EntitySnapshot>> {
        let since = now() - window;
        let key = (account_id.to_string(), entity_id.clone());
        let mut records: Vec<EntitySnapshot> = self
            .history
            .read()
            .get(&key)
            .map(|records| records.iter().filter(|e| e.captured_at >= since).cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|e| e.captured_at);
        Ok(records)
    }

    fn record_event(&self, event: &GameEvent) -> Result<()> {
        self.events.write().push(event.clone());
        Ok(())
    }

    fn get_events(&self, account_id: &str, window: Duration) -> Result<Vec<GameEvent>> {
        let since = now() - window;
        let mut events: Vec<GameEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| e.account_id == account_id && e.recorded_at >= since)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.recorded_at);
        Ok(events)
    }

    fn export(&self, account_id: &str) -> Result<AccountExport> {
        let history = self
            .history
            .read()
            .iter()
            .filter(|((account, _), _)| account == account_id)
            .flat_map(|(_, records)| {
                let mut records = records.clone();
                records.sort_by_key(|e| e.captured_at);
                records
            })
            .collect();
        let mut events: Vec<GameEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.recorded_at);

        Ok(AccountExport {
            account_id: account_id.to_string(),
            exported_at: now(),
            latest: self.get_latest(account_id)?,
            history,
            events,
        })
    }

    fn prune(&self, retain: Duration) -> Result<usize> {
        let cutoff = now() - retain;
        let mut removed = 0;
        for records in self.history.write().values_mut() {
            let Some(newest) = records.len().checked_sub(1) else {
                continue;
            };
            let before = records.len();
            let mut index = 0;
            records.retain(|e| {
                let keep = e.captured_at >= cutoff || index == newest;
                index += 1;
                keep
            });
            removed += before - records.len();
        }

        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.recorded_at >= cutoff);
        removed += before - events.len();
        Ok(removed)
    }

    fn stats(&self) -> Result<StoreStats> {
        let history = self.history.read();
        Ok(StoreStats {
            accounts: self.latest.read().len() as u64,
            history_records: history.values().map(|r| r.len() as u64).sum(),
            tracked_entities: history.values().filter(|r| !r.is_empty()).count() as u64,
            game_events: self.events.read().len() as u64,
        })
    }
}
