//! Reconciled per-entity and account-wide state
//!
//! An `EntitySnapshot` remembers, for every field group, which origin wrote
//! it last and how fresh that write was. The reconciler uses those stamps to
//! decide whether a new observation may overwrite a group.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::aggregate::Totals;
use crate::alerts::Alert;
use crate::observation::{FieldGroup, PartialEntityFields};
use crate::types::{
    BuildJob, CulturePoints, EntityId, IncomingMovement, Origin, Production, ResourceVector,
    StorageCapacity, Timestamp,
};

/// Provenance of one field group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStamp {
    pub origin: Origin,
    /// Capture time of the observation that wrote the group
    pub at: Timestamp,
    /// Freshest capture time this group has ever been offered
    pub high_water: Timestamp,
}

impl FieldStamp {
    pub fn new(origin: Origin, at: Timestamp) -> Self {
        Self {
            origin,
            at,
            high_water: at,
        }
    }

    /// Whether an observation stamped `incoming` may overwrite a group
    /// currently stamped `self`.
    ///
    /// Narrow and passive observations beat wide ones outright and are
    /// ordered among themselves by their own capture times. The wide source
    /// only overwrites them with data strictly newer than anything the group
    /// has seen, so re-merging the wide observation a narrow write already
    /// beat changes nothing.
    pub fn admits(&self, incoming: FieldStamp) -> bool {
        match (self.origin, incoming.origin) {
            (Origin::FullAccount, Origin::FullAccount) => incoming.at >= self.high_water,
            (_, Origin::FullAccount) => incoming.at > self.high_water,
            (Origin::FullAccount, _) => true,
            (_, _) => incoming.at >= self.at,
        }
    }

    /// Stamp after `incoming` has been written over `self`
    pub fn superseded_by(&self, incoming: FieldStamp) -> FieldStamp {
        FieldStamp {
            origin: incoming.origin,
            at: incoming.at,
            high_water: self.high_water.max(incoming.high_water),
        }
    }
}

/// Reconciled state of one village
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub name: String,
    pub resources: ResourceVector,
    pub production: Production,
    pub storage_capacity: StorageCapacity,
    pub build_queue: Vec<BuildJob>,
    /// Population reported by a collaborator, if any
    pub population: Option<u32>,
    pub troops: Option<u32>,
    pub incoming: Vec<IncomingMovement>,
    pub is_currently_viewed: bool,
    /// Freshest observation time across all field groups
    pub captured_at: Timestamp,
    /// Origin of the most recent write
    pub origin: Origin,
    #[serde(default)]
    pub stamps: BTreeMap<FieldGroup, FieldStamp>,
}

impl EntitySnapshot {
    /// Blank entity, created the first time any observation names it
    pub fn new(id: EntityId, origin: Origin, captured_at: Timestamp) -> Self {
        Self {
            name: id.0.clone(),
            id,
            resources: ResourceVector::default(),
            production: Production::default(),
            storage_capacity: StorageCapacity::default(),
            build_queue: Vec::new(),
            population: None,
            troops: None,
            incoming: Vec::new(),
            is_currently_viewed: false,
            captured_at,
            origin,
            stamps: BTreeMap::new(),
        }
    }

    pub fn stamp(&self, group: FieldGroup) -> Option<FieldStamp> {
        self.stamps.get(&group).copied()
    }

    /// Apply every admissible group from `fields`.
    ///
    /// Returns the groups that were written. `fields` must already be
    /// sanitized.
    pub fn apply(&mut self, fields: &PartialEntityFields, incoming: FieldStamp) -> Vec<FieldGroup> {
        let mut written = Vec::new();
        for group in fields.populated() {
            let existing = self.stamp(group);
            if !existing.map_or(true, |e| e.admits(incoming)) {
                continue;
            }
            let stamp = existing.map_or(incoming, |e| e.superseded_by(incoming));
            // The same wide fetch merged again, e.g. from the scheduler's cache
            if incoming.origin == Origin::FullAccount && existing == Some(stamp) {
                continue;
            }
            self.write_group(group, fields);
            self.stamps.insert(group, stamp);
            written.push(group);
        }

        if !written.is_empty() {
            self.origin = incoming.origin;
            self.captured_at = self.captured_at.max(incoming.at);
        }
        written
    }

    fn write_group(&mut self, group: FieldGroup, fields: &PartialEntityFields) {
        match group {
            FieldGroup::Name => {
                if let Some(name) = &fields.name {
                    self.name = name.clone();
                }
            }
            FieldGroup::Resources => {
                if let Some(res) = fields.resources {
                    self.resources = res;
                }
            }
            FieldGroup::Production => {
                if let Some(prod) = fields.production {
                    self.production = prod;
                }
            }
            FieldGroup::Storage => {
                if let Some(cap) = fields.storage {
                    self.storage_capacity = cap;
                }
            }
            FieldGroup::BuildQueue => {
                if let Some(queue) = &fields.build_queue {
                    self.build_queue = queue.clone();
                }
            }
            FieldGroup::Population => self.population = fields.population,
            FieldGroup::Troops => self.troops = fields.troops,
            FieldGroup::Movements => {
                if let Some(movements) = &fields.movements {
                    self.incoming = movements.clone();
                }
            }
        }
    }
}

/// Reconciled, account-wide view handed to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub server_identity: String,
    pub captured_at: Timestamp,
    pub entities: BTreeMap<EntityId, EntitySnapshot>,
    pub current_entity_id: Option<EntityId>,
    pub totals: Totals,
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub culture_points: Option<CulturePoints>,
}

impl AccountSnapshot {
    /// Snapshot with no entities, used before the first observation lands
    pub fn empty(
        account_id: impl Into<String>,
        server_identity: impl Into<String>,
        captured_at: Timestamp,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            server_identity: server_identity.into(),
            captured_at,
            entities: BTreeMap::new(),
            current_entity_id: None,
            totals: Totals::default(),
            alerts: Vec::new(),
            culture_points: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entity(&self, id: &EntityId) -> Option<&EntitySnapshot> {
        self.entities.get(id)
    }

    pub fn current_entity(&self) -> Option<&EntitySnapshot> {
        self.current_entity_id.as_ref().and_then(|id| self.entities.get(id))
    }

    /// Time elapsed since the freshest observation in this snapshot
    pub fn age(&self, now: Timestamp) -> Duration {
        now - self.captured_at
    }
}

/// Account id derived from the game server's host name
pub fn account_id_for_server(server_identity: &str) -> String {
    format!("account_{}", server_identity.replace('.', "_"))
}
