//! End-to-end engine behaviour against real stores and sources

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

use steward_core::source::JsonFileSource;
use steward_core::store::{AccountExport, GameEvent, GameEventKind, SqliteSnapshotStore, StoreStats};
use steward_core::types::{IncomingMovement, MovementKind, Production, StorageCapacity};
use steward_core::{
    AccountSnapshot, AccountSource, AlertKind, Engine, EngineConfig, EntityId, EntityObservation,
    EntitySnapshot, FetchError, FullAccountObservation, ObservedEntity, PartialEntityFields,
    PartialUpdate, ResourceVector, Severity, SnapshotStore, StewardError,
};

fn village(id: &str, wood: f64, wood_rate: f64) -> ObservedEntity {
    ObservedEntity {
        id: EntityId::new(id),
        fields: PartialEntityFields {
            name: Some(format!("Village {}", id)),
            resources: Some(ResourceVector::new(wood, 500.0, 500.0, 500.0)),
            production: Some(Production::new(ResourceVector::new(wood_rate, 10.0, 10.0, 10.0))),
            storage: Some(StorageCapacity::new(10_000.0, 10_000.0)),
            ..Default::default()
        },
        is_currently_viewed: false,
    }
}

fn config() -> EngineConfig {
    EngineConfig::new().with_server_identity("ts9.e2e.example")
}

fn write_observation(path: &std::path::Path, obs: &FullAccountObservation) {
    std::fs::write(path, serde_json::to_string_pretty(obs).unwrap()).unwrap();
}

#[tokio::test]
async fn test_json_source_into_sqlite_and_back() {
    let dir = tempfile::tempdir().unwrap();
    let obs_path = dir.path().join("account.json");
    let db_path = dir.path().join("steward.db");

    let obs = FullAccountObservation::new(Utc::now())
        .with_entity(village("1", 9_750.0, 100.0))
        .with_entity(village("2", 1_000.0, 100.0));
    write_observation(&obs_path, &obs);

    let store: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::open(&db_path).unwrap());
    let engine = Engine::open(config(), Arc::new(JsonFileSource::new(&obs_path)), Some(store.clone()))
        .await
        .unwrap();

    let snapshot = engine.refresh_now(false).await.unwrap();
    assert_eq!(snapshot.totals.entity_count, 2);
    assert_eq!(snapshot.totals.resources.wood, 10_750.0);
    let overflow = &snapshot.alerts[0];
    assert_eq!(overflow.kind, AlertKind::Overflow);
    assert_eq!(overflow.entity_id, EntityId::new("1"));
    assert_eq!(overflow.severity, Severity::Medium);

    engine.flush_persistence().await;
    let history = store
        .get_entity_history(engine.account_id(), &EntityId::new("1"), Duration::hours(1))
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].name, "Village 1");
    assert_eq!(
        store.stats().unwrap(),
        StoreStats { accounts: 1, history_records: 2, tracked_entities: 2, game_events: 0 }
    );
    drop(engine);

    // A second engine on the same database starts warm even if the source is gone
    std::fs::remove_file(&obs_path).unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::open(&db_path).unwrap());
    let engine = Engine::open(config(), Arc::new(JsonFileSource::new(&obs_path)), Some(store))
        .await
        .unwrap();
    let warm = engine.refresh_now(true).await.unwrap();
    assert_eq!(warm.entities.len(), 2);
}

#[tokio::test]
async fn test_cold_start_with_missing_file_is_no_data_yet() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(), Arc::new(JsonFileSource::new(dir.path().join("x.json"))), None)
        .await
        .unwrap();
    assert!(matches!(
        engine.refresh_now(false).await,
        Err(StewardError::NoDataYet(_))
    ));
}

/// Blocks forever on the first fetch, answers every later one
struct StallFirst {
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    started: Notify,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountSource for StallFirst {
    async fn fetch_full_account(&self) -> Result<FullAccountObservation, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(self.in_flight.clone());
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        self.started.notify_one();
        if n == 0 {
            pending::<()>().await;
        }
        Ok(FullAccountObservation::new(Utc::now()).with_entity(village("7", 10.0, 1.0)))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_refresh_abandons_in_flight_fetch() {
    let source = Arc::new(StallFirst {
        calls: AtomicUsize::new(0),
        in_flight: Arc::new(AtomicUsize::new(0)),
        max_in_flight: Arc::new(AtomicUsize::new(0)),
        started: Notify::new(),
    });
    let engine = Engine::open(config(), source.clone(), None).await.unwrap();

    let background = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.refresh_now(false).await })
    };
    source.started.notified().await;

    let forced = engine.refresh_now(true).await.unwrap();
    assert_eq!(forced.entities.len(), 1);

    // The stalled pass returns instead of hanging; its result was discarded
    let _ = background.await.unwrap();
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(source.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_forced_refresh_supersedes_pass_waiting_on_gate() {
    let source = Arc::new(StallFirst {
        calls: AtomicUsize::new(0),
        in_flight: Arc::new(AtomicUsize::new(0)),
        max_in_flight: Arc::new(AtomicUsize::new(0)),
        started: Notify::new(),
    });
    let engine = Engine::open(config(), source.clone(), None).await.unwrap();

    let stalled = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.refresh_now(false).await })
    };
    source.started.notified().await;

    let queued = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.refresh_now(false).await })
    };
    // Let the queued pass reach the fetch gate behind the stalled one
    tokio::task::yield_now().await;

    let forced = engine.refresh_now(true).await.unwrap();
    assert_eq!(forced.entities.len(), 1);

    assert!(matches!(stalled.await.unwrap(), Err(StewardError::NoDataYet(_))));
    assert!(matches!(queued.await.unwrap(), Err(StewardError::NoDataYet(_))));
    // The queued pass gave way without fetching
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(source.in_flight.load(Ordering::SeqCst), 0);
}

struct BrokenStore;

impl SnapshotStore for BrokenStore {
    fn put(&self, _: &AccountSnapshot, _: &[EntityId]) -> steward_core::Result<()> {
        Err(StewardError::Persistence("disk full".into()))
    }

    fn get_latest(&self, _: &str) -> steward_core::Result<Option<AccountSnapshot>> {
        Err(StewardError::Persistence("unreadable".into()))
    }

    fn get_entity_history(
        &self,
        _: &str,
        _: &EntityId,
        _: Duration,
    ) -> steward_core::Result<Vec<EntitySnapshot>> {
        Ok(Vec::new())
    }

    fn record_event(&self, _: &GameEvent) -> steward_core::Result<()> {
        Err(StewardError::Persistence("disk full".into()))
    }

    fn get_events(&self, _: &str, _: Duration) -> steward_core::Result<Vec<GameEvent>> {
        Ok(Vec::new())
    }

    fn export(&self, _: &str) -> steward_core::Result<AccountExport> {
        Err(StewardError::Persistence("unreadable".into()))
    }

    fn prune(&self, _: Duration) -> steward_core::Result<usize> {
        Ok(0)
    }

    fn stats(&self) -> steward_core::Result<StoreStats> {
        Ok(StoreStats::default())
    }
}

struct Fixed(FullAccountObservation);

#[async_trait]
impl AccountSource for Fixed {
    async fn fetch_full_account(&self) -> Result<FullAccountObservation, FetchError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_persistence_failure_does_not_roll_back() {
    let obs = FullAccountObservation::new(Utc::now()).with_entity(village("1", 100.0, 10.0));
    let engine = Engine::open(config(), Arc::new(Fixed(obs)), Some(Arc::new(BrokenStore)))
        .await
        .unwrap();

    let snapshot = engine.refresh_now(false).await.unwrap();
    engine.flush_persistence().await;
    assert_eq!(engine.snapshot(), Some(snapshot));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_passive_updates_all_land() {
    let obs = FullAccountObservation::new(Utc::now() - Duration::minutes(1));
    let engine = Engine::open(config(), Arc::new(Fixed(obs)), None).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let fields = PartialEntityFields {
                resources: Some(ResourceVector::new(i as f64, 0.0, 0.0, 0.0)),
                ..Default::default()
            };
            engine.submit_passive(PartialUpdate::new(format!("v{}", i), fields, Utc::now()))
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let snapshot = engine.snapshot().unwrap();
    assert_eq!(snapshot.entities.len(), 16);
    assert_eq!(snapshot.totals.resources.wood, (0..16).sum::<i32>() as f64);
}

#[tokio::test]
async fn test_run_loop_until_shutdown() {
    let obs = FullAccountObservation::new(Utc::now()).with_entity(village("1", 100.0, 10.0));
    let engine = Engine::open(config().with_poll_interval_secs(1), Arc::new(Fixed(obs)), None)
        .await
        .unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    engine.subscribe(move |snapshot| {
        let _ = seen_tx.send(snapshot.entities.len());
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    // First tick fires immediately
    assert_eq!(seen_rx.recv().await, Some(1));
    shutdown_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_incoming_attack_from_narrow_observation() {
    let obs = FullAccountObservation::new(Utc::now()).with_entity(village("1", 100.0, 10.0));
    let engine = Engine::open(config(), Arc::new(Fixed(obs)), None).await.unwrap();
    engine.refresh_now(false).await.unwrap();

    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.subscribe(move |snapshot| sink.lock().push(snapshot.alerts.len()));

    let fields = PartialEntityFields {
        movements: Some(vec![IncomingMovement {
            kind: MovementKind::Raid,
            arrives_at: Utc::now() + Duration::minutes(20),
            from: Some("Natars".into()),
        }]),
        ..Default::default()
    };
    let snapshot = engine
        .submit_current(EntityObservation::new("1", fields, Utc::now()))
        .unwrap();

    let attack = &snapshot.alerts[0];
    assert_eq!(attack.kind, AlertKind::IncomingAttack);
    assert_eq!(attack.severity, Severity::Critical);
    assert_eq!(*seen.lock(), vec![snapshot.alerts.len()]);
}

#[tokio::test]
async fn test_attack_ledger_and_export_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> =
        Arc::new(SqliteSnapshotStore::open(dir.path().join("steward.db")).unwrap());
    let obs = FullAccountObservation::new(Utc::now()).with_entity(village("1", 100.0, 10.0));
    let engine = Engine::open(config(), Arc::new(Fixed(obs)), Some(store.clone()))
        .await
        .unwrap();
    engine.refresh_now(false).await.unwrap();

    let raid = IncomingMovement {
        kind: MovementKind::Raid,
        arrives_at: Utc::now() + Duration::minutes(20),
        from: Some("Natars".into()),
    };
    let movements = |list: Vec<IncomingMovement>| PartialEntityFields {
        movements: Some(list),
        ..Default::default()
    };
    engine
        .submit_current(EntityObservation::new("1", movements(vec![raid.clone()]), Utc::now()))
        .unwrap();
    // Same raid seen again: no second ledger entry
    engine
        .submit_current(EntityObservation::new("1", movements(vec![raid.clone()]), Utc::now()))
        .unwrap();
    engine.flush_persistence().await;

    let events = store.get_events(engine.account_id(), Duration::hours(1)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, GameEventKind::Attack);
    assert_eq!(events[0].entity_id, Some(EntityId::new("1")));
    assert_eq!(events[0].data["movement"], "raid");
    assert_eq!(events[0].data["from"], "Natars");

    let export = store.export(engine.account_id()).unwrap();
    let latest = export.latest.as_ref().unwrap();
    assert_eq!(latest.entities[&EntityId::new("1")].incoming, vec![raid]);
    assert_eq!(latest.alerts[0].kind, AlertKind::IncomingAttack);
    assert_eq!(export.events, events);
    // One record per pass that wrote village 1: the wide fetch and both narrow passes
    assert_eq!(export.history.len(), 3);
}
