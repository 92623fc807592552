//! Account-wide totals
//!
//! Totals are a pure function of the reconciled entity map. Crop consumption
//! and population are not observable from the wide view, so both come from
//! pluggable models. The default models are coarse placeholders and are
//! labelled as estimates in the output, never as ground truth.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::{EntityId, Production, ResourceVector};
use crate::snapshot::EntitySnapshot;

/// Summed state of every known entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub resources: ResourceVector,
    /// Summed production; `crop_net` is production minus estimated consumption
    pub production: Production,
    pub population: u64,
    /// True when any entity's population came from the proxy model
    pub population_is_estimate: bool,
    pub entity_count: usize,
    /// Crop per hour the consumption model attributes to the account
    pub estimated_consumption: f64,
}

/// Estimates hourly crop consumption for the whole account
pub trait ConsumptionModel: Send + Sync {
    fn consumption(&self, entities: &BTreeMap<EntityId, EntitySnapshot>) -> f64;
}

/// Estimates one entity's population when no collaborator supplied it
pub trait PopulationModel: Send + Sync {
    fn estimate(&self, entity: &EntitySnapshot) -> u64;
}

/// Troop upkeep where troop counts are known, a flat per-village figure otherwise
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TroopUpkeep {
    /// Crop per hour per troop
    pub per_troop: f64,
    /// Crop per hour assumed for a village with unknown troops
    pub per_entity_default: f64,
}

impl Default for TroopUpkeep {
    fn default() -> Self {
        Self {
            per_troop: 1.0,
            per_entity_default: 50.0,
        }
    }
}

impl ConsumptionModel for TroopUpkeep {
    fn consumption(&self, entities: &BTreeMap<EntityId, EntitySnapshot>) -> f64 {
        entities
            .values()
            .map(|e| match e.troops {
                Some(troops) => troops as f64 * self.per_troop,
                None => self.per_entity_default,
            })
            .sum()
    }
}

/// Population proxy: a fixed figure per queued construction (at least one)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueProxy {
    pub per_queue_slot: u64,
}

impl Default for QueueProxy {
    fn default() -> Self {
        Self { per_queue_slot: 100 }
    }
}

impl PopulationModel for QueueProxy {
    fn estimate(&self, entity: &EntitySnapshot) -> u64 {
        self.per_queue_slot * entity.build_queue.len().max(1) as u64
    }
}

/// Sums per-entity state into `Totals`
#[derive(Clone)]
pub struct Aggregator {
    consumption: Arc<dyn ConsumptionModel>,
    population: Arc<dyn PopulationModel>,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator").finish_non_exhaustive()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(Arc::new(TroopUpkeep::default()), Arc::new(QueueProxy::default()))
    }
}

impl Aggregator {
    pub fn new(consumption: Arc<dyn ConsumptionModel>, population: Arc<dyn PopulationModel>) -> Self {
        Self { consumption, population }
    }

    pub fn aggregate(&self, entities: &BTreeMap<EntityId, EntitySnapshot>) -> Totals {
        let mut totals = Totals {
            entity_count: entities.len(),
            ..Totals::default()
        };

        for entity in entities.values() {
            totals.resources += finite_or_zero(entity.resources);
            totals.production.rates += finite_or_zero(entity.production.rates);

            match entity.population {
                Some(pop) => totals.population += u64::from(pop),
                None => {
                    totals.population += self.population.estimate(entity);
                    totals.population_is_estimate = true;
                }
            }
        }

        let consumption = self.consumption.consumption(entities);
        let consumption = if consumption.is_finite() { consumption } else { 0.0 };
        totals.estimated_consumption = consumption;
        totals.production.crop_net = Some(totals.production.rates.crop - consumption);
        totals
    }
}

fn finite_or_zero(v: ResourceVector) -> ResourceVector {
    let f = |x: f64| if x.is_finite() { x } else { 0.0 };
    ResourceVector::new(f(v.wood), f(v.clay), f(v.iron), f(v.crop))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuildJob, Origin};
    use chrono::Utc;

    fn entity(id: &str, res: ResourceVector, prod: ResourceVector) -> EntitySnapshot {
        let mut e = EntitySnapshot::new(EntityId::new(id), Origin::FullAccount, Utc::now());
        e.resources = res;
        e.production = Production::new(prod);
        e
    }

    fn three_villages() -> BTreeMap<EntityId, EntitySnapshot> {
        [
            entity("1", ResourceVector::new(100.0, 200.0, 300.0, 400.0), ResourceVector::new(10.0, 20.0, 30.0, 40.0)),
            entity("2", ResourceVector::new(1.0, 2.0, 3.0, 4.0), ResourceVector::new(5.0, 5.0, 5.0, 5.0)),
            entity("3", ResourceVector::new(1000.0, 0.0, 50.0, 7.0), ResourceVector::new(0.0, 100.0, 0.0, 60.0)),
        ]
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect()
    }

    #[test]
    fn test_totals_are_arithmetic_sums() {
        let totals = Aggregator::default().aggregate(&three_villages());
        assert_eq!(totals.entity_count, 3);
        assert_eq!(totals.resources, ResourceVector::new(1101.0, 202.0, 353.0, 411.0));
        assert_eq!(totals.production.rates, ResourceVector::new(15.0, 125.0, 35.0, 105.0));
        // No troop counts known: 50 crop/h per village
        assert_eq!(totals.estimated_consumption, 150.0);
        assert_eq!(totals.production.crop_net, Some(105.0 - 150.0));
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let entities = three_villages();
        let aggregator = Aggregator::default();
        assert_eq!(aggregator.aggregate(&entities), aggregator.aggregate(&entities));
    }

    #[test]
    fn test_empty_account() {
        let totals = Aggregator::default().aggregate(&BTreeMap::new());
        assert_eq!(totals.entity_count, 0);
        assert_eq!(totals.population, 0);
        assert!(!totals.population_is_estimate);
        assert_eq!(totals.production.crop_net, Some(0.0));
    }

    #[test]
    fn test_population_prefers_supplied_values() {
        let mut entities = three_villages();
        for e in entities.values_mut() {
            e.population = Some(250);
        }
        let totals = Aggregator::default().aggregate(&entities);
        assert_eq!(totals.population, 750);
        assert!(!totals.population_is_estimate);
    }

    #[test]
    fn test_population_proxy_is_flagged() {
        let mut entities = three_villages();
        let first = entities.get_mut(&EntityId::new("1")).unwrap();
        first.build_queue = vec![
            BuildJob { name: "Warehouse".into(), level: 5, remaining_secs: Some(600) },
            BuildJob { name: "Granary".into(), level: 3, remaining_secs: None },
        ];
        let totals = Aggregator::default().aggregate(&entities);
        assert_eq!(totals.population, 200 + 100 + 100);
        assert!(totals.population_is_estimate);
    }

    #[test]
    fn test_troop_upkeep_when_known() {
        let mut entities = three_villages();
        for e in entities.values_mut() {
            e.troops = Some(30);
        }
        let totals = Aggregator::default().aggregate(&entities);
        assert_eq!(totals.estimated_consumption, 90.0);
    }

    #[test]
    fn test_custom_consumption_model() {
        struct Flat;
        impl ConsumptionModel for Flat {
            fn consumption(&self, _: &BTreeMap<EntityId, EntitySnapshot>) -> f64 {
                5.0
            }
        }
        let aggregator = Aggregator::new(Arc::new(Flat), Arc::new(QueueProxy::default()));
        let totals = aggregator.aggregate(&three_villages());
        assert_eq!(totals.production.crop_net, Some(100.0));
    }
}
