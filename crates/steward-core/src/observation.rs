//! Inbound observations
//!
//! Observation sources hand the core already-structured, best-effort field
//! sets. Every field group is optional: `None` means "this source could not
//! determine it", which is different from "zero".

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{
    BuildJob, CulturePoints, EntityId, IncomingMovement, Production, ResourceVector,
    StorageCapacity, Timestamp,
};

/// Independently-merged slices of an entity's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    Name,
    Resources,
    Production,
    Storage,
    BuildQueue,
    Population,
    Troops,
    Movements,
}

impl FieldGroup {
    pub const ALL: [FieldGroup; 8] = [
        FieldGroup::Name,
        FieldGroup::Resources,
        FieldGroup::Production,
        FieldGroup::Storage,
        FieldGroup::BuildQueue,
        FieldGroup::Population,
        FieldGroup::Troops,
        FieldGroup::Movements,
    ];
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldGroup::Name => "name",
            FieldGroup::Resources => "resources",
            FieldGroup::Production => "production",
            FieldGroup::Storage => "storage",
            FieldGroup::BuildQueue => "build_queue",
            FieldGroup::Population => "population",
            FieldGroup::Troops => "troops",
            FieldGroup::Movements => "movements",
        };
        f.write_str(s)
    }
}

/// Best-effort field set for one entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialEntityFields {
    pub name: Option<String>,
    pub resources: Option<ResourceVector>,
    pub production: Option<Production>,
    pub storage: Option<StorageCapacity>,
    pub build_queue: Option<Vec<BuildJob>>,
    /// Population as reported by the game, when a collaborator knows it
    pub population: Option<u32>,
    /// Troops stationed or owned by the village (drives crop upkeep)
    pub troops: Option<u32>,
    pub movements: Option<Vec<IncomingMovement>>,
}

impl PartialEntityFields {
    /// Field groups this observation actually populated
    pub fn populated(&self) -> Vec<FieldGroup> {
        FieldGroup::ALL
            .into_iter()
            .filter(|g| self.has(*g))
            .collect()
    }

    pub fn has(&self, group: FieldGroup) -> bool {
        match group {
            FieldGroup::Name => self.name.is_some(),
            FieldGroup::Resources => self.resources.is_some(),
            FieldGroup::Production => self.production.is_some(),
            FieldGroup::Storage => self.storage.is_some(),
            FieldGroup::BuildQueue => self.build_queue.is_some(),
            FieldGroup::Population => self.population.is_some(),
            FieldGroup::Troops => self.troops.is_some(),
            FieldGroup::Movements => self.movements.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.populated().is_empty()
    }

    /// Drop field groups whose values are out of range.
    ///
    /// Returns the cleaned fields and the groups that were rejected; the
    /// caller still applies everything that survived.
    pub fn sanitized(&self) -> (PartialEntityFields, Vec<FieldGroup>) {
        let mut clean = self.clone();
        let mut rejected = Vec::new();

        if let Some(name) = &clean.name {
            if name.trim().is_empty() {
                clean.name = None;
                rejected.push(FieldGroup::Name);
            }
        }
        if let Some(res) = &clean.resources {
            if !res.is_stockpile() {
                clean.resources = None;
                rejected.push(FieldGroup::Resources);
            }
        }
        if let Some(prod) = &clean.production {
            if !prod.is_finite() {
                clean.production = None;
                rejected.push(FieldGroup::Production);
            }
        }
        if let Some(cap) = &clean.storage {
            if !cap.is_valid() {
                clean.storage = None;
                rejected.push(FieldGroup::Storage);
            }
        }

        (clean, rejected)
    }
}

/// One entity as reported by the wide view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedEntity {
    pub id: EntityId,
    #[serde(default)]
    pub fields: PartialEntityFields,
    #[serde(default)]
    pub is_currently_viewed: bool,
}

/// Wide observation of every entity at once (slow, rate-limited)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullAccountObservation {
    #[serde(default)]
    pub entities: Vec<ObservedEntity>,
    pub captured_at: Timestamp,
    #[serde(default)]
    pub culture_points: Option<CulturePoints>,
}

impl FullAccountObservation {
    pub fn new(captured_at: Timestamp) -> Self {
        Self {
            entities: Vec::new(),
            captured_at,
            culture_points: None,
        }
    }

    pub fn with_entity(mut self, entity: ObservedEntity) -> Self {
        self.entities.push(entity);
        self
    }
}

/// Narrow observation of the entity currently being viewed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityObservation {
    pub id: EntityId,
    #[serde(default)]
    pub fields: PartialEntityFields,
    pub captured_at: Timestamp,
    #[serde(default = "default_viewed")]
    pub is_currently_viewed: bool,
}

fn default_viewed() -> bool {
    true
}

impl EntityObservation {
    pub fn new(id: impl Into<EntityId>, fields: PartialEntityFields, captured_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            fields,
            captured_at,
            is_currently_viewed: true,
        }
    }
}

/// Unsolicited partial update pushed by a passive listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialUpdate {
    pub id: EntityId,
    #[serde(default)]
    pub fields: PartialEntityFields,
    pub captured_at: Timestamp,
}

impl PartialUpdate {
    pub fn new(id: impl Into<EntityId>, fields: PartialEntityFields, captured_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            fields,
            captured_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_populated_groups() {
        let fields = PartialEntityFields {
            resources: Some(ResourceVector::new(1.0, 2.0, 3.0, 4.0)),
            build_queue: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(
            fields.populated(),
            vec![FieldGroup::Resources, FieldGroup::BuildQueue]
        );
        assert!(PartialEntityFields::default().is_empty());
    }

    #[test]
    fn test_sanitize_drops_only_bad_groups() {
        let fields = PartialEntityFields {
            name: Some("Capital".into()),
            resources: Some(ResourceVector::new(-5.0, 2.0, 3.0, 4.0)),
            storage: Some(StorageCapacity::new(f64::INFINITY, 100.0)),
            production: Some(Production::new(ResourceVector::new(10.0, 10.0, 10.0, 10.0))),
            ..Default::default()
        };
        let (clean, rejected) = fields.sanitized();
        assert_eq!(rejected, vec![FieldGroup::Resources, FieldGroup::Storage]);
        assert!(clean.resources.is_none());
        assert!(clean.storage.is_none());
        assert_eq!(clean.name.as_deref(), Some("Capital"));
        assert!(clean.production.is_some());
    }

    #[test]
    fn test_negative_crop_net_is_in_range() {
        let fields = PartialEntityFields {
            production: Some(Production::new(ResourceVector::default()).with_crop_net(-40.0)),
            ..Default::default()
        };
        let (_, rejected) = fields.sanitized();
        assert!(rejected.is_empty());
    }

    #[test]
    fn test_narrow_observation_defaults_to_viewed() {
        let json = serde_json::json!({
            "id": "512",
            "fields": { "resources": { "wood": 10.0, "clay": 0.0, "iron": 0.0, "crop": 5.0 } },
            "captured_at": Utc::now(),
        });
        let obs: EntityObservation = serde_json::from_value(json).unwrap();
        assert!(obs.is_currently_viewed);
        assert_eq!(obs.id.as_str(), "512");
    }
}
