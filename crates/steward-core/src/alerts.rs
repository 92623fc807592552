//! Predictive alert engine
//!
//! Linear time-to-event extrapolation over the reconciled snapshot:
//! - Overflow: hours until a stockpile reaches its warehouse/granary capacity
//! - Starvation: hours until crop runs out under negative net production
//! - Incoming attack: seconds until a hostile movement lands
//!
//! Alerts are ranked by severity, then by ETA.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::snapshot::EntitySnapshot;
use crate::types::{EntityId, ResourceKind, Timestamp};

const SECS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Overflow,
    Starvation,
    IncomingAttack,
}

/// Alert severity; lower rank sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        };
        f.write_str(s)
    }
}

/// A time-bounded warning about one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub entity_id: EntityId,
    pub message: String,
    pub eta_seconds: f64,
    /// Resource concerned, for overflow and starvation alerts
    #[serde(default)]
    pub resource: Option<ResourceKind>,
}

impl Alert {
    pub fn eta_hours(&self) -> f64 {
        self.eta_seconds / SECS_PER_HOUR
    }
}

/// Ordering used for the alert list: severity rank, then earliest ETA
pub fn alert_order(a: &Alert, b: &Alert) -> Ordering {
    a.severity
        .rank()
        .cmp(&b.severity.rank())
        .then_with(|| a.eta_seconds.total_cmp(&b.eta_seconds))
}

/// Tunable horizons
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Overflow alerts fire below this many hours
    pub overflow_horizon_hours: f64,
    /// Starvation alerts fire below this many hours
    pub starvation_horizon_hours: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            overflow_horizon_hours: 3.0,
            starvation_horizon_hours: 6.0,
        }
    }
}

/// Scans entities and emits a ranked alert list
#[derive(Debug, Clone, Default)]
pub struct AlertEngine {
    thresholds: AlertThresholds,
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds
    }

    pub fn detect(&self, entities: &BTreeMap<EntityId, EntitySnapshot>, now: Timestamp) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for entity in entities.values() {
            for kind in ResourceKind::WAREHOUSE {
                alerts.extend(self.overflow(entity, kind));
            }
            alerts.extend(self.overflow(entity, ResourceKind::Crop));
            alerts.extend(self.starvation(entity));
            alerts.extend(incoming_attacks(entity, now));
        }
        alerts.sort_by(alert_order);
        alerts
    }

    fn overflow(&self, entity: &EntitySnapshot, kind: ResourceKind) -> Option<Alert> {
        let production = entity.production.rates.get(kind);
        let capacity = entity.storage_capacity.for_resource(kind);
        // Zero capacity means the source could not determine it
        if !(production > 0.0 && capacity > 0.0 && capacity.is_finite()) {
            return None;
        }

        let remaining = capacity - entity.resources.get(kind);
        let eta_hours = remaining / production;
        if !(0.0..self.thresholds.overflow_horizon_hours).contains(&eta_hours) {
            return None;
        }

        let severity = if eta_hours < 1.0 {
            Severity::Critical
        } else if eta_hours < 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };

        Some(Alert {
            kind: AlertKind::Overflow,
            severity,
            entity_id: entity.id.clone(),
            message: format!(
                "{}: {} will overflow in {}",
                entity.name,
                kind,
                format_hours(eta_hours)
            ),
            eta_seconds: eta_hours * SECS_PER_HOUR,
            resource: Some(kind),
        })
    }

    fn starvation(&self, entity: &EntitySnapshot) -> Option<Alert> {
        let crop_net = entity.production.crop_net.filter(|net| *net < 0.0)?;

        let eta_hours = entity.resources.crop / crop_net.abs();
        if !(0.0..self.thresholds.starvation_horizon_hours).contains(&eta_hours) {
            return None;
        }

        let severity = if eta_hours < 1.0 {
            Severity::Critical
        } else if eta_hours < 3.0 {
            Severity::High
        } else {
            Severity::Medium
        };

        Some(Alert {
            kind: AlertKind::Starvation,
            severity,
            entity_id: entity.id.clone(),
            message: format!("{}: crop will run out in {}", entity.name, format_hours(eta_hours)),
            eta_seconds: eta_hours * SECS_PER_HOUR,
            resource: Some(ResourceKind::Crop),
        })
    }
}

fn incoming_attacks(entity: &EntitySnapshot, now: Timestamp) -> Vec<Alert> {
    entity
        .incoming
        .iter()
        .filter(|m| m.kind.is_hostile() && m.arrives_at > now)
        .map(|m| {
            let eta_seconds = (m.arrives_at - now).num_milliseconds() as f64 / 1000.0;
            let from = m
                .from
                .as_deref()
                .map(|f| format!(" from {}", f))
                .unwrap_or_default();
            Alert {
                kind: AlertKind::IncomingAttack,
                severity: Severity::Critical,
                entity_id: entity.id.clone(),
                message: format!(
                    "{}: incoming {}{} lands in {}",
                    entity.name,
                    m.kind.name(),
                    from,
                    format_hours(eta_seconds / SECS_PER_HOUR)
                ),
                eta_seconds,
                resource: None,
            }
        })
        .collect()
}

/// Compact human duration: `Now!`, `42m`, `3h`, `2d`
pub fn format_hours(hours: f64) -> String {
    if hours < 0.0 {
        "Now!".to_string()
    } else if hours < 1.0 {
        format!("{}m", (hours * 60.0).round())
    } else if hours < 24.0 {
        format!("{}h", hours.round())
    } else {
        format!("{}d", (hours / 24.0).round())
    }
}
