//! Core types for Steward
//!
//! Building blocks shared by observations, snapshots and alerts:
//! - Entity identifiers
//! - Resource, production and storage vectors
//! - Observation origins
//! - Timestamps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type alias
pub type Timestamp = DateTime<Utc>;

/// Create a timestamp for the current moment
pub fn now() -> Timestamp {
    Utc::now()
}

/// Opaque, stable identifier of one village within an account
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An id that is empty (or whitespace only) can never name a real village
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The four stockpiled resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Wood,
    Clay,
    Iron,
    Crop,
}

impl ResourceKind {
    /// Resources stored in the warehouse
    pub const WAREHOUSE: [ResourceKind; 3] = [ResourceKind::Wood, ResourceKind::Clay, ResourceKind::Iron];

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Wood => "wood",
            ResourceKind::Clay => "clay",
            ResourceKind::Iron => "iron",
            ResourceKind::Crop => "crop",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Amounts of wood, clay, iron and crop
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector {
    #[serde(default)]
    pub wood: f64,
    #[serde(default)]
    pub clay: f64,
    #[serde(default)]
    pub iron: f64,
    #[serde(default)]
    pub crop: f64,
}

impl ResourceVector {
    pub fn new(wood: f64, clay: f64, iron: f64, crop: f64) -> Self {
        Self { wood, clay, iron, crop }
    }

    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Wood => self.wood,
            ResourceKind::Clay => self.clay,
            ResourceKind::Iron => self.iron,
            ResourceKind::Crop => self.crop,
        }
    }

    pub fn total(&self) -> f64 {
        self.wood + self.clay + self.iron + self.crop
    }

    /// True when every amount is finite and non-negative
    pub fn is_stockpile(&self) -> bool {
        [self.wood, self.clay, self.iron, self.crop]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }

    pub fn is_finite(&self) -> bool {
        [self.wood, self.clay, self.iron, self.crop]
            .iter()
            .all(|v| v.is_finite())
    }
}

impl std::ops::AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: Self) {
        self.wood += rhs.wood;
        self.clay += rhs.clay;
        self.iron += rhs.iron;
        self.crop += rhs.crop;
    }
}

/// Hourly production, plus crop net of upkeep
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Production {
    #[serde(flatten)]
    pub rates: ResourceVector,
    /// Crop after consumption; may be negative
    #[serde(default)]
    pub crop_net: Option<f64>,
}

impl Production {
    pub fn new(rates: ResourceVector) -> Self {
        Self { rates, crop_net: None }
    }

    pub fn with_crop_net(mut self, crop_net: f64) -> Self {
        self.crop_net = Some(crop_net);
        self
    }

    pub fn is_finite(&self) -> bool {
        self.rates.is_finite() && self.crop_net.map_or(true, f64::is_finite)
    }
}

/// Warehouse and granary capacity; zero means unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageCapacity {
    #[serde(default)]
    pub warehouse: f64,
    #[serde(default)]
    pub granary: f64,
}

impl StorageCapacity {
    pub fn new(warehouse: f64, granary: f64) -> Self {
        Self { warehouse, granary }
    }

    pub fn is_valid(&self) -> bool {
        self.warehouse.is_finite()
            && self.granary.is_finite()
            && self.warehouse >= 0.0
            && self.granary >= 0.0
    }

    /// Capacity that bounds the given resource
    pub fn for_resource(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Crop => self.granary,
            _ => self.warehouse,
        }
    }
}

/// One entry of a village's construction queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub name: String,
    pub level: u32,
    #[serde(default)]
    pub remaining_secs: Option<u64>,
}

/// Where an observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Wide, rate-limited fetch covering every village
    FullAccount,
    /// Narrow observation of the village being viewed
    CurrentEntity,
    /// Unsolicited update piggybacking on host traffic
    Passive,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Origin::FullAccount => "full_account",
            Origin::CurrentEntity => "current_entity",
            Origin::Passive => "passive",
        };
        f.write_str(s)
    }
}

/// Troop movement classes reported by the game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementKind {
    Attack,
    Raid,
    Reinforcement,
}

impl MovementKind {
    pub fn is_hostile(self) -> bool {
        matches!(self, MovementKind::Attack | MovementKind::Raid)
    }

    pub fn name(self) -> &'static str {
        match self {
            MovementKind::Attack => "attack",
            MovementKind::Raid => "raid",
            MovementKind::Reinforcement => "reinforcement",
        }
    }
}

/// A troop movement heading for one of the account's villages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMovement {
    pub kind: MovementKind,
    pub arrives_at: Timestamp,
    #[serde(default)]
    pub from: Option<String>,
}

/// Account-wide culture point standing
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CulturePoints {
    pub current: f64,
    /// Points per day
    pub production: f64,
    /// Points required for the next village slot
    pub next_slot: f64,
}

impl CulturePoints {
    /// Hours until the next village slot unlocks, if production is positive
    pub fn hours_to_next_slot(&self) -> Option<f64> {
        if self.production <= 0.0 {
            return None;
        }
        let missing = (self.next_slot - self.current).max(0.0);
        Some(missing / self.production * 24.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_validity() {
        assert!(EntityId::new("1234").is_valid());
        assert!(!EntityId::new("").is_valid());
        assert!(!EntityId::new("   ").is_valid());
    }

    #[test]
    fn test_resource_vector_checks() {
        assert!(ResourceVector::new(1.0, 0.0, 3.0, 4.0).is_stockpile());
        assert!(!ResourceVector::new(-1.0, 0.0, 3.0, 4.0).is_stockpile());
        assert!(!ResourceVector::new(f64::NAN, 0.0, 3.0, 4.0).is_stockpile());
        assert_eq!(ResourceVector::new(1.0, 2.0, 3.0, 4.0).total(), 10.0);
    }

    #[test]
    fn test_capacity_by_resource() {
        let cap = StorageCapacity::new(8000.0, 6000.0);
        assert_eq!(cap.for_resource(ResourceKind::Iron), 8000.0);
        assert_eq!(cap.for_resource(ResourceKind::Crop), 6000.0);
    }

    #[test]
    fn test_production_serde_flattens_rates() {
        let p = Production::new(ResourceVector::new(10.0, 20.0, 30.0, 40.0)).with_crop_net(-5.0);
        let json = serde_json::to_value(p).unwrap();
        assert_eq!(json["wood"], 10.0);
        assert_eq!(json["crop_net"], -5.0);
        let back: Production = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_culture_points_eta() {
        let cp = CulturePoints { current: 1000.0, production: 500.0, next_slot: 2000.0 };
        assert_eq!(cp.hours_to_next_slot(), Some(48.0));
        let idle = CulturePoints { production: 0.0, ..cp };
        assert_eq!(idle.hours_to_next_slot(), None);
    }
}
