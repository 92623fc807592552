//! Engine: drives observation → reconcile → aggregate → alert → persist
//!
//! Three kinds of trigger feed the engine: the periodic loop, narrow and
//! passive observations pushed by collaborators, and explicit user refreshes.
//! All of them converge on one commit path guarded by a mutex, so two merges
//! never interleave. The wide fetch is the only thing that awaits; it runs
//! behind its own async gate so at most one is ever in flight.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use uuid::Uuid;

use crate::aggregate::Aggregator;
use crate::alerts::AlertEngine;
use crate::config::EngineConfig;
use crate::error::{Result, StewardError};
use crate::observation::{EntityObservation, FullAccountObservation, PartialUpdate};
use crate::reconcile::Reconciler;
use crate::scheduler::{FetchOutcome, RefreshScheduler};
use crate::snapshot::AccountSnapshot;
use crate::source::AccountSource;
use crate::store::{GameEvent, GameEventKind, SnapshotStore};
use crate::types::{now, EntityId, Timestamp};

/// Handle returned by [`Engine::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription:{}", self.0)
    }
}

type Subscriber = Arc<dyn Fn(Arc<AccountSnapshot>) + Send + Sync>;

enum PersistJob {
    Put {
        snapshot: Arc<AccountSnapshot>,
        changed: Vec<EntityId>,
    },
    Event(GameEvent),
    Prune(Duration),
    Flush(oneshot::Sender<()>),
}

/// Observations waiting for the next pass
#[derive(Default)]
struct Pending {
    current: Option<EntityObservation>,
    passive: Vec<PartialUpdate>,
}

struct Shared {
    config: EngineConfig,
    account_id: String,
    source: Arc<dyn AccountSource>,
    reconciler: Reconciler,
    aggregator: Aggregator,
    alert_engine: AlertEngine,
    /// Committed snapshot; holding this lock is holding the commit path
    state: Mutex<Option<Arc<AccountSnapshot>>>,
    pending: Mutex<Pending>,
    /// Fetch gate; owning the scheduler means owning the one fetch slot
    scheduler: tokio::sync::Mutex<RefreshScheduler>,
    abandon: Notify,
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    persist_tx: Option<mpsc::UnboundedSender<PersistJob>>,
}

/// Reconciliation engine for one account
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Shared>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("account_id", &self.inner.account_id)
            .field("persistent", &self.inner.persist_tx.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine and warm it from the store's latest snapshot, if any.
    ///
    /// Must be called inside a Tokio runtime: the persistence writer is
    /// spawned here.
    pub async fn open(
        config: EngineConfig,
        source: Arc<dyn AccountSource>,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let account_id = config.account_id();

        let mut warm = None;
        let mut persist_tx = None;
        if let Some(store) = store {
            warm = load_latest(store.clone(), account_id.clone()).await;
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(persist_loop(store, rx));
            persist_tx = Some(tx);
        }

        if let Some(snapshot) = &warm {
            tracing::info!(
                account = %account_id,
                entities = snapshot.entities.len(),
                captured_at = %snapshot.captured_at,
                "warm start from stored snapshot"
            );
        }

        Ok(Self {
            inner: Arc::new(Shared {
                account_id,
                source,
                reconciler: Reconciler::new(),
                aggregator: config.aggregator(),
                alert_engine: AlertEngine::new(config.alert_thresholds()),
                state: Mutex::new(warm.map(Arc::new)),
                pending: Mutex::new(Pending::default()),
                scheduler: tokio::sync::Mutex::new(RefreshScheduler::new(config.scheduler_policy())),
                abandon: Notify::new(),
                subscribers: RwLock::new(HashMap::new()),
                persist_tx,
                config,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    /// Latest committed snapshot. Never blocks on a fetch.
    pub fn snapshot(&self) -> Option<Arc<AccountSnapshot>> {
        self.inner.state.lock().clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Arc<AccountSnapshot>) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.inner.subscribers.write().insert(id, Arc::new(callback));
        tracing::debug!(%id, "subscriber registered");
        id
    }

    /// Returns false when the id was unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.write().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Pull-based refresh for explicit user action.
    ///
    /// A forced refresh abandons any fetch already in flight and fetches
    /// regardless of the freshness gate.
    pub async fn refresh_now(&self, force: bool) -> Result<Arc<AccountSnapshot>> {
        self.full_pass(force).await
    }

    /// Queue a narrow observation of the viewed entity and run a light pass
    pub fn submit_current(&self, observation: EntityObservation) -> Result<Arc<AccountSnapshot>> {
        if !observation.id.is_valid() {
            return Err(StewardError::MalformedObservation(
                "current-entity observation without an id".into(),
            ));
        }
        {
            let mut pending = self.inner.pending.lock();
            let keep_existing = pending
                .current
                .as_ref()
                .map_or(false, |queued| queued.captured_at > observation.captured_at);
            if !keep_existing {
                pending.current = Some(observation);
            }
        }
        self.commit(None, false)
    }

    /// Queue a passive update and run a light pass
    pub fn submit_passive(&self, update: PartialUpdate) -> Result<Arc<AccountSnapshot>> {
        if !update.id.is_valid() {
            return Err(StewardError::MalformedObservation(
                "passive update without an id".into(),
            ));
        }
        self.inner.pending.lock().passive.push(update);
        self.commit(None, false)
    }

    /// Ask the persistence writer to prune history older than the retention window
    pub fn prune_history(&self) {
        self.persist(PersistJob::Prune(self.inner.config.retention()));
    }

    /// Wait until every snapshot committed so far has reached the store
    pub async fn flush_persistence(&self) {
        let (tx, rx) = oneshot::channel();
        if let Some(persist_tx) = &self.inner.persist_tx {
            if persist_tx.send(PersistJob::Flush(tx)).is_ok() {
                let _ = rx.await;
            }
        }
    }

    /// Periodic refresh loop. Returns once `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll = std::time::Duration::from_secs(self.inner.config.scheduler.poll_interval_secs);
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pruner = tokio::time::interval(std::time::Duration::from_secs(3600));

        tracing::info!(
            account = %self.inner.account_id,
            poll_secs = poll.as_secs(),
            "refresh loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.full_pass(false).await {
                        Ok(snapshot) => tracing::debug!(
                            entities = snapshot.entities.len(),
                            alerts = snapshot.alerts.len(),
                            "refresh pass complete"
                        ),
                        Err(StewardError::NoDataYet(reason)) => {
                            tracing::warn!(%reason, "no account data yet")
                        }
                        Err(e) => tracing::error!("refresh pass failed: {}", e),
                    }
                }
                _ = pruner.tick() => self.prune_history(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.flush_persistence().await;
        tracing::info!(account = %self.inner.account_id, "refresh loop stopped");
        Ok(())
    }

    async fn full_pass(&self, forced: bool) -> Result<Arc<AccountSnapshot>> {
        if forced {
            self.inner.abandon.notify_waiters();
        }

        let outcome = {
            // Registered before queueing on the gate so a forced refresh
            // issued while this pass waits is not missed
            let abandoned = self.inner.abandon.notified();
            tokio::pin!(abandoned);
            abandoned.as_mut().enable();
            let mut scheduler = self.inner.scheduler.lock().await;
            scheduler
                .fetch_or_fallback(self.inner.source.as_ref(), now(), forced, abandoned)
                .await
        };

        if let FetchOutcome::Abandoned { .. } = outcome {
            // The forced refresh that took over commits its own result
            return match self.snapshot() {
                Some(snapshot) => Ok(snapshot),
                None => Err(StewardError::NoDataYet("fetch abandoned before any data".into())),
            };
        }

        match self.commit(outcome.observation(), outcome.is_fresh()) {
            Err(StewardError::NoDataYet(_)) => Err(StewardError::NoDataYet(match outcome.failure() {
                Some(e) => format!("first fetch failed: {}", e),
                None => "wide source unavailable and nothing cached".into(),
            })),
            other => other,
        }
    }

    /// Single serialized reconciliation pass
    fn commit(
        &self,
        full: Option<&FullAccountObservation>,
        fresh: bool,
    ) -> Result<Arc<AccountSnapshot>> {
        let inner = &self.inner;
        let snapshot = {
            let committed_at = now();
            let mut state = inner.state.lock();
            let Pending { current, passive } = std::mem::take(&mut *inner.pending.lock());

            let base = match state.as_deref() {
                Some(previous) => previous.clone(),
                None => AccountSnapshot::empty(
                    inner.account_id.clone(),
                    inner.config.server_identity.clone(),
                    DateTime::<Utc>::default(),
                ),
            };

            let (mut next, report) =
                inner
                    .reconciler
                    .merge_with_report(&base, full, current.as_ref(), &passive);

            if state.is_none() && next.is_empty() && !fresh {
                return Err(StewardError::NoDataYet("no observation has arrived".into()));
            }

            next.totals = inner.aggregator.aggregate(&next.entities);
            next.alerts = inner.alert_engine.detect(&next.entities, committed_at);

            let unchanged = state.as_deref().map_or(false, |previous| {
                !report.changed() && previous.totals == next.totals && previous.alerts == next.alerts
            });
            if unchanged {
                if let Some(previous) = state.as_ref() {
                    return Ok(previous.clone());
                }
            }

            let attacks = new_attacks(state.as_deref(), &next, committed_at);
            let next = Arc::new(next);
            *state = Some(next.clone());
            // Sent under the lock so the writer sees commits in order
            self.persist(PersistJob::Put {
                snapshot: next.clone(),
                changed: report.changed_entities.into_iter().collect(),
            });
            for event in attacks {
                tracing::info!(entity = ?event.entity_id, "incoming attack recorded");
                self.persist(PersistJob::Event(event));
            }
            next
        };

        tracing::debug!(
            entities = snapshot.entities.len(),
            alerts = snapshot.alerts.len(),
            "snapshot committed"
        );

        let subscribers: Vec<Subscriber> = inner.subscribers.read().values().cloned().collect();
        for subscriber in subscribers {
            subscriber(snapshot.clone());
        }
        Ok(snapshot)
    }

    fn persist(&self, job: PersistJob) {
        if let Some(tx) = &self.inner.persist_tx {
            if tx.send(job).is_err() {
                tracing::warn!("persistence writer stopped; snapshot not stored");
            }
        }
    }
}

/// Ledger entries for hostile movements first seen in `next`
fn new_attacks(
    previous: Option<&AccountSnapshot>,
    next: &AccountSnapshot,
    at: Timestamp,
) -> Vec<GameEvent> {
    let mut events = Vec::new();
    for entity in next.entities.values() {
        let known = previous
            .and_then(|p| p.entities.get(&entity.id))
            .map(|e| e.incoming.as_slice())
            .unwrap_or_default();
        for movement in &entity.incoming {
            if !movement.kind.is_hostile() || movement.arrives_at <= at || known.contains(movement) {
                continue;
            }
            events.push(
                GameEvent::new(next.account_id.clone(), GameEventKind::Attack, at)
                    .with_entity(entity.id.clone())
                    .with_data(serde_json::json!({
                        "village": entity.name,
                        "movement": movement.kind.name(),
                        "arrives_at": movement.arrives_at,
                        "from": movement.from,
                    })),
            );
        }
    }
    events
}

async fn load_latest(store: Arc<dyn SnapshotStore>, account_id: String) -> Option<AccountSnapshot> {
    match tokio::task::spawn_blocking(move || store.get_latest(&account_id)).await {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            tracing::warn!("could not load stored snapshot, starting cold: {}", e);
            None
        }
        Err(e) => {
            tracing::error!("snapshot load task failed: {}", e);
            None
        }
    }
}

/// Ordered, fire-and-forget writer. Failures are logged and never retried.
async fn persist_loop(store: Arc<dyn SnapshotStore>, mut rx: mpsc::UnboundedReceiver<PersistJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Put { snapshot, changed } => {
                let store = store.clone();
                let account = snapshot.account_id.clone();
                match tokio::task::spawn_blocking(move || store.put(&snapshot, &changed)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(%account, "snapshot not persisted: {}", e),
                    Err(e) => tracing::error!("persistence task failed: {}", e),
                }
            }
            PersistJob::Event(event) => {
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.record_event(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("game event not persisted: {}", e),
                    Err(e) => tracing::error!("event task failed: {}", e),
                }
            }
            PersistJob::Prune(retain) => {
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.prune(retain)).await {
                    Ok(Ok(removed)) if removed > 0 => {
                        tracing::info!(removed, "pruned entity history")
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("history prune failed: {}", e),
                    Err(e) => tracing::error!("prune task failed: {}", e),
                }
            }
            PersistJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("persistence writer stopped");
}
