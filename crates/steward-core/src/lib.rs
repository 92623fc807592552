//! Steward Core - state reconciliation and predictive alerts for a multi-village account
//!
//! Steward keeps one coherent, account-wide picture of a browser strategy
//! game account out of observations that disagree about freshness and scope.
//!
//! # Architecture
//!
//! Observations flow through five stages:
//!
//! 1. **Scheduler** (`scheduler`): decides whether the slow wide view may be fetched
//! 2. **Reconciler** (`reconcile`): merges wide, narrow and passive observations per field group
//! 3. **Aggregator** (`aggregate`): account totals with pluggable consumption and population models
//! 4. **Alert Engine** (`alerts`): overflow, starvation and incoming-attack predictions
//! 5. **Snapshot Store** (`store`): latest snapshot, append-only per-entity history and a game-event ledger
//!
//! The [`Engine`] ties them together behind one serialized commit path.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use chrono::Utc;
//! use steward_core::{Engine, EngineConfig, EntityObservation, PartialEntityFields, ResourceVector};
//! use steward_core::store::MemorySnapshotStore;
//! use steward_core::source::JsonFileSource;
//!
//! tokio_test::block_on(async {
//!     let config = EngineConfig::new().with_server_identity("ts1.example.com");
//!     let source = Arc::new(JsonFileSource::new("account.json"));
//!     let engine = Engine::open(config, source, Some(Arc::new(MemorySnapshotStore::new())))
//!         .await
//!         .unwrap();
//!
//!     // The viewed village reports its stockpile
//!     let fields = PartialEntityFields {
//!         resources: Some(ResourceVector::new(1200.0, 900.0, 400.0, 2500.0)),
//!         ..Default::default()
//!     };
//!     let snapshot = engine
//!         .submit_current(EntityObservation::new("12345", fields, Utc::now()))
//!         .unwrap();
//!
//!     assert_eq!(snapshot.totals.resources.crop, 2500.0);
//!     assert_eq!(snapshot.current_entity_id.as_ref().map(|id| id.as_str()), Some("12345"));
//! });
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod aggregate;
pub mod alerts;
pub mod config;
pub mod engine;
pub mod error;
pub mod observation;
pub mod reconcile;
pub mod scheduler;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod types;

// Re-export commonly used types for convenience
pub use aggregate::{Aggregator, ConsumptionModel, PopulationModel, Totals};
pub use alerts::{Alert, AlertEngine, AlertKind, AlertThresholds, Severity};
pub use config::EngineConfig;
pub use engine::{Engine, SubscriptionId};
pub use error::{FetchError, Result, StewardError};
pub use observation::{
    EntityObservation, FieldGroup, FullAccountObservation, ObservedEntity, PartialEntityFields,
    PartialUpdate,
};
pub use reconcile::Reconciler;
pub use scheduler::{should_refresh, RefreshScheduler};
pub use snapshot::{AccountSnapshot, EntitySnapshot};
pub use source::AccountSource;
pub use store::SnapshotStore;
pub use types::{EntityId, Origin, ResourceKind, ResourceVector, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use chrono::{Duration, Utc};
    use types::StorageCapacity;

    #[test]
    fn test_pipeline_without_engine() {
        // Reconcile, aggregate and detect by hand, the way a pass does
        let t0 = Utc::now();
        let wide = FullAccountObservation::new(t0).with_entity(ObservedEntity {
            id: EntityId::new("1"),
            fields: PartialEntityFields {
                resources: Some(ResourceVector::new(9_000.0, 0.0, 0.0, 0.0)),
                production: Some(types::Production::new(ResourceVector::new(600.0, 0.0, 0.0, 0.0))),
                storage: Some(StorageCapacity::new(10_000.0, 10_000.0)),
                ..Default::default()
            },
            is_currently_viewed: true,
        });
        let passive = PartialUpdate::new(
            "1",
            PartialEntityFields {
                resources: Some(ResourceVector::new(9_700.0, 0.0, 0.0, 0.0)),
                ..Default::default()
            },
            t0 + Duration::seconds(30),
        );

        let empty = AccountSnapshot::empty("account_x", "x", t0);
        let mut merged = Reconciler::new().merge(&empty, Some(&wide), None, &[passive]);
        merged.totals = Aggregator::default().aggregate(&merged.entities);
        merged.alerts = AlertEngine::default().detect(&merged.entities, t0);

        assert_eq!(merged.totals.resources.wood, 9_700.0);
        assert_eq!(merged.alerts.len(), 1);
        assert_eq!(merged.alerts[0].kind, AlertKind::Overflow);
        // 300 left at 600/h is half an hour
        assert_eq!(merged.alerts[0].severity, Severity::Critical);
    }
}
