//! SqliteSnapshotStore: SQLite WAL persistence for account snapshots
//!
//! - WAL mode: readers never block the persistence task
//! - Latest snapshot per account, verified against a Blake3 hash on load
//! - Append-only entity history, one row per pass that changed the entity,
//!   ordered by an autoincrement sequence
//! - Game-event ledger pruned on the same retention window as history

use anyhow::{Context, Result};
use chrono::Duration;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

use super::{AccountExport, GameEvent, SnapshotStore, StoreStats};
use crate::error;
use crate::snapshot::{AccountSnapshot, EntitySnapshot};
use crate::types::{now, EntityId};

/// SQLite-backed snapshot store
#[derive(Debug)]
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open (or create) the database in WAL mode.
    ///
    /// ```no_run
    /// use steward_core::store::SqliteSnapshotStore;
    /// let store = SqliteSnapshotStore::open(".steward/steward.db").unwrap();
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory '{}'", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening SQLite '{}'", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("configuring SQLite WAL pragmas")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Idempotent DDL
    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS account_latest (
                account_id     TEXT PRIMARY KEY,
                integrity_hash TEXT NOT NULL,
                payload_json   TEXT NOT NULL,
                saved_at_ms    INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entity_history (
                seq            INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id     TEXT NOT NULL,
                entity_id      TEXT NOT NULL,
                captured_at_ms INTEGER NOT NULL,
                recorded_at_ms INTEGER NOT NULL,
                payload_json   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_entity
                ON entity_history(account_id, entity_id, captured_at_ms);

            CREATE INDEX IF NOT EXISTS idx_history_captured_at
                ON entity_history(captured_at_ms);

            CREATE TABLE IF NOT EXISTS game_events (
                id             TEXT PRIMARY KEY,
                account_id     TEXT NOT NULL,
                kind           TEXT NOT NULL,
                entity_id      TEXT,
                recorded_at_ms INTEGER NOT NULL,
                payload_json   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_account_time
                ON game_events(account_id, recorded_at_ms);
            ",
            )
            .context("migrating SQLite schema")?;
        Ok(())
    }

    fn put_inner(&self, snapshot: &AccountSnapshot, changed: &[EntityId]) -> Result<()> {
        let payload_json =
            serde_json::to_string(snapshot).context("serializing account snapshot")?;
        let integrity_hash = blake3::hash(payload_json.as_bytes()).to_hex().to_string();
        let saved_at_ms = now().timestamp_millis();

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("beginning snapshot transaction")?;
        tx.execute(
            "INSERT INTO account_latest (account_id, integrity_hash, payload_json, saved_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account_id) DO UPDATE SET
                integrity_hash = excluded.integrity_hash,
                payload_json = excluded.payload_json,
                saved_at_ms = excluded.saved_at_ms",
            params![snapshot.account_id, integrity_hash, payload_json, saved_at_ms],
        )
        .context("UPSERT account_latest")?;

        let mut appended = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO entity_history
                        (account_id, entity_id, captured_at_ms, recorded_at_ms, payload_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .context("preparing entity_history insert")?;
            for entity in changed.iter().filter_map(|id| snapshot.entities.get(id)) {
                let entity_json =
                    serde_json::to_string(entity).context("serializing entity snapshot")?;
                stmt.execute(params![
                    snapshot.account_id,
                    entity.id.as_str(),
                    entity.captured_at.timestamp_millis(),
                    saved_at_ms,
                    entity_json
                ])
                .with_context(|| format!("INSERT entity_history for '{}'", entity.id))?;
                appended += 1;
            }
        }

        tx.commit().context("committing snapshot transaction")?;
        debug!(
            account = %snapshot.account_id,
            entities = snapshot.entities.len(),
            appended,
            "snapshot persisted"
        );
        Ok(())
    }

    fn get_latest_inner(&self, account_id: &str) -> Result<Option<AccountSnapshot>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT payload_json, integrity_hash FROM account_latest WHERE account_id = ?1",
                params![account_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("query account_latest")?;

        let Some((payload_json, stored_hash)) = row else {
            return Ok(None);
        };

        let actual_hash = blake3::hash(payload_json.as_bytes()).to_hex().to_string();
        if actual_hash != stored_hash {
            anyhow::bail!(
                "snapshot integrity check failed for '{}': expected {}, found {}",
                account_id,
                stored_hash,
                actual_hash
            );
        }

        let snapshot = serde_json::from_str(&payload_json)
            .context("deserializing account snapshot from SQLite")?;
        Ok(Some(snapshot))
    }

    fn history_inner(
        &self,
        account_id: &str,
        entity_id: &EntityId,
        window: Duration,
    ) -> Result<Vec<EntitySnapshot>> {
        let since_ms = (now() - window).timestamp_millis();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM entity_history
             WHERE account_id = ?1 AND entity_id = ?2 AND captured_at_ms >= ?3
             ORDER BY captured_at_ms ASC, seq ASC",
        )?;

        let rows = stmt
            .query_map(params![account_id, entity_id.as_str(), since_ms], |row| {
                row.get::<_, String>(0)
            })
            .context("query entity_history")?;
        decode_rows(rows, "entity snapshot")
    }

    fn record_event_inner(&self, event: &GameEvent) -> Result<()> {
        let payload_json = serde_json::to_string(event).context("serializing game event")?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO game_events (id, account_id, kind, entity_id, recorded_at_ms, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id.to_string(),
                    event.account_id,
                    event.kind.name(),
                    event.entity_id.as_ref().map(|id| id.as_str()),
                    event.recorded_at.timestamp_millis(),
                    payload_json
                ],
            )
            .context("INSERT game_events")?;
        debug!(account = %event.account_id, kind = %event.kind, "game event recorded");
        Ok(())
    }

    fn events_inner(&self, account_id: &str, since_ms: i64) -> Result<Vec<GameEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM game_events
             WHERE account_id = ?1 AND recorded_at_ms >= ?2
             ORDER BY recorded_at_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![account_id, since_ms], |row| row.get::<_, String>(0))
            .context("query game_events")?;
        decode_rows(rows, "game event")
    }

    fn export_inner(&self, account_id: &str) -> Result<AccountExport> {
        let latest = self.get_latest_inner(account_id)?;
        let history = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT payload_json FROM entity_history
                 WHERE account_id = ?1
                 ORDER BY entity_id ASC, captured_at_ms ASC, seq ASC",
            )?;
            let rows = stmt
                .query_map(params![account_id], |row| row.get::<_, String>(0))
                .context("query entity_history for export")?;
            decode_rows(rows, "entity snapshot")?
        };
        let events = self.events_inner(account_id, i64::MIN)?;

        Ok(AccountExport {
            account_id: account_id.to_string(),
            exported_at: now(),
            latest,
            history,
            events,
        })
    }

    fn prune_inner(&self, retain: Duration) -> Result<usize> {
        let cutoff_ms = (now() - retain).timestamp_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("beginning prune transaction")?;
        let history = tx
            .execute(
                "DELETE FROM entity_history
                 WHERE captured_at_ms < ?1
                   AND seq < (
                       SELECT MAX(h.seq) FROM entity_history h
                       WHERE h.account_id = entity_history.account_id
                         AND h.entity_id = entity_history.entity_id
                   )",
                params![cutoff_ms],
            )
            .context("DELETE entity_history")?;
        let events = tx
            .execute(
                "DELETE FROM game_events WHERE recorded_at_ms < ?1",
                params![cutoff_ms],
            )
            .context("DELETE game_events")?;
        tx.commit().context("committing prune transaction")?;
        Ok(history + events)
    }

    fn stats_inner(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let accounts: i64 =
            conn.query_row("SELECT COUNT(*) FROM account_latest", [], |row| row.get(0))?;
        let history_records: i64 =
            conn.query_row("SELECT COUNT(*) FROM entity_history", [], |row| row.get(0))?;
        let tracked_entities: i64 = conn.query_row(
            "SELECT COUNT(*) FROM (SELECT DISTINCT account_id, entity_id FROM entity_history)",
            [],
            |row| row.get(0),
        )?;

        let game_events: i64 =
            conn.query_row("SELECT COUNT(*) FROM game_events", [], |row| row.get(0))?;

        Ok(StoreStats {
            accounts: accounts as u64,
            history_records: history_records as u64,
            tracked_entities: tracked_entities as u64,
            game_events: game_events as u64,
        })
    }
}

fn decode_rows<T, I>(rows: I, what: &str) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
    I: Iterator<Item = rusqlite::Result<String>>,
{
    let mut decoded = Vec::new();
    for payload in rows {
        let payload = payload.with_context(|| format!("reading {} row", what))?;
        decoded.push(
            serde_json::from_str(&payload).with_context(|| format!("deserializing {}", what))?,
        );
    }
    Ok(decoded)
}

impl SnapshotStore for SqliteSnapshotStore {
    fn put(&self, snapshot: &AccountSnapshot, changed: &[EntityId]) -> error::Result<()> {
        Ok(self.put_inner(snapshot, changed)?)
    }

    fn get_latest(&self, account_id: &str) -> error::Result<Option<AccountSnapshot>> {
        Ok(self.get_latest_inner(account_id)?)
    }

    fn get_entity_history(
        &self,
        account_id: &str,
        entity_id: &EntityId,
        window: Duration,
    ) -> error::Result<Vec<EntitySnapshot>> {
        Ok(self.history_inner(account_id, entity_id, window)?)
    }

    fn record_event(&self, event: &GameEvent) -> error::Result<()> {
        Ok(self.record_event_inner(event)?)
    }

    fn get_events(&self, account_id: &str, window: Duration) -> error::Result<Vec<GameEvent>> {
        let since_ms = (now() - window).timestamp_millis();
        Ok(self.events_inner(account_id, since_ms)?)
    }

    fn export(&self, account_id: &str) -> error::Result<AccountExport> {
        Ok(self.export_inner(account_id)?)
    }

    fn prune(&self, retain: Duration) -> error::Result<usize> {
        Ok(self.prune_inner(retain)?)
    }

    fn stats(&self) -> error::Result<StoreStats> {
        Ok(self.stats_inner()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    fn temp_store() -> SqliteSnapshotStore {
        SqliteSnapshotStore::in_memory().expect("in-memory SQLite should open")
    }

    #[test]
    fn test_latest_round_trip() {
        conformance::latest_round_trip(&temp_store());
    }

    #[test]
    fn test_history_window() {
        conformance::history_window(&temp_store());
    }

    #[test]
    fn test_unchanged_entities_are_not_recorded() {
        conformance::unchanged_entities_are_not_recorded(&temp_store());
    }

    #[test]
    fn test_every_changing_pass_appends() {
        conformance::every_changing_pass_appends(&temp_store());
    }

    #[test]
    fn test_prune_keeps_newest_per_entity() {
        conformance::prune_keeps_newest_per_entity(&temp_store());
    }

    #[test]
    fn test_events_ledger_and_prune() {
        conformance::events_ledger_and_prune(&temp_store());
    }

    #[test]
    fn test_export_collects_everything() {
        conformance::export_collects_everything(&temp_store());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("steward.db");
        let snap = AccountSnapshot::empty("account_a", "a.example", now());
        {
            let store = SqliteSnapshotStore::open(&path).unwrap();
            store.put(&snap, &[]).unwrap();
        }
        let reopened = SqliteSnapshotStore::open(&path).unwrap();
        assert_eq!(reopened.get_latest("account_a").unwrap(), Some(snap));
    }

    #[test]
    fn test_tampered_payload_fails_integrity() {
        let store = temp_store();
        store
            .put(&AccountSnapshot::empty("account_a", "a.example", now()), &[])
            .unwrap();
        store
            .conn
            .lock()
            .execute(
                "UPDATE account_latest SET payload_json = replace(payload_json, 'a.example', 'b.example')",
                [],
            )
            .unwrap();

        let err = store.get_latest("account_a").unwrap_err();
        assert!(err.is_persistence());
        assert!(err.to_string().contains("integrity"));
    }
}
