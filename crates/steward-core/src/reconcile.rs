//! Reconciler: merges wide, narrow and passive observations
//!
//! The merge runs in three stages over a copy of the previous entity map:
//! the wide observation first, then the narrow observation of the viewed
//! village, then queued passive updates in arrival order. Whether a field
//! group may be overwritten is decided by [`FieldStamp::admits`], so the
//! order of stages only matters between observations of equal standing.
//!
//! The reconciler never deletes entities and never fails. Totals and alerts
//! on the returned snapshot are carried over untouched; the engine
//! recomputes them.

use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::observation::{
    EntityObservation, FullAccountObservation, PartialEntityFields, PartialUpdate,
};
use crate::snapshot::{AccountSnapshot, EntitySnapshot, FieldStamp};
use crate::types::{EntityId, Origin, Timestamp};

/// What a merge pass did, for logging and tests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Field groups written across all entities
    pub groups_written: usize,
    /// Field groups rejected as out of range
    pub groups_rejected: usize,
    /// Observations dropped for a malformed entity id
    pub dropped_observations: usize,
    /// Entities seen for the first time
    pub created: Vec<EntityId>,
    /// Entities with at least one group written, created ones included
    pub changed_entities: BTreeSet<EntityId>,
    /// Freshest observation time that changed anything
    pub latest_write: Option<Timestamp>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.latest_write.is_some()
    }

    fn note_write(&mut self, at: Timestamp) {
        self.latest_write = Some(self.latest_write.map_or(at, |t| t.max(at)));
    }
}

/// Stateless merge of observations into an account snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    pub fn merge(
        &self,
        previous: &AccountSnapshot,
        full: Option<&FullAccountObservation>,
        current: Option<&EntityObservation>,
        passive: &[PartialUpdate],
    ) -> AccountSnapshot {
        self.merge_with_report(previous, full, current, passive).0
    }

    pub fn merge_with_report(
        &self,
        previous: &AccountSnapshot,
        full: Option<&FullAccountObservation>,
        current: Option<&EntityObservation>,
        passive: &[PartialUpdate],
    ) -> (AccountSnapshot, MergeReport) {
        let mut next = previous.clone();
        let mut report = MergeReport::default();
        let mut wide_viewed: Option<EntityId> = None;
        let mut narrow_viewed: Option<EntityId> = None;

        if let Some(full) = full {
            if full.entities.is_empty() {
                // Absence of data is not evidence of absence of the entities
                warn!(
                    known = next.entities.len(),
                    "wide observation returned no entities; keeping known set"
                );
            }
            let stamp = FieldStamp::new(Origin::FullAccount, full.captured_at);
            for observed in &full.entities {
                if !accept_id(&observed.id, Origin::FullAccount, &mut report) {
                    continue;
                }
                apply(&mut next, &observed.id, &observed.fields, stamp, &mut report);
                if observed.is_currently_viewed {
                    wide_viewed = Some(observed.id.clone());
                }
            }
            if let Some(cp) = full.culture_points {
                if next.culture_points != Some(cp) {
                    next.culture_points = Some(cp);
                    report.note_write(full.captured_at);
                }
            }
        }

        if let Some(obs) = current {
            if accept_id(&obs.id, Origin::CurrentEntity, &mut report) {
                let stamp = FieldStamp::new(Origin::CurrentEntity, obs.captured_at);
                apply(&mut next, &obs.id, &obs.fields, stamp, &mut report);
                if obs.is_currently_viewed {
                    narrow_viewed = Some(obs.id.clone());
                }
            }
        }

        for update in passive {
            if !accept_id(&update.id, Origin::Passive, &mut report) {
                continue;
            }
            let stamp = FieldStamp::new(Origin::Passive, update.captured_at);
            apply(&mut next, &update.id, &update.fields, stamp, &mut report);
        }

        if let Some(viewed) = narrow_viewed.or(wide_viewed) {
            set_current(&mut next, viewed);
        }

        if let Some(at) = report.latest_write {
            next.captured_at = next.captured_at.max(at);
        }

        debug!(
            written = report.groups_written,
            rejected = report.groups_rejected,
            created = report.created.len(),
            "merge pass complete"
        );
        (next, report)
    }
}

fn accept_id(id: &EntityId, origin: Origin, report: &mut MergeReport) -> bool {
    if id.is_valid() {
        return true;
    }
    warn!(%origin, "dropping observation with empty entity id");
    report.dropped_observations += 1;
    false
}

fn apply(
    next: &mut AccountSnapshot,
    id: &EntityId,
    fields: &PartialEntityFields,
    stamp: FieldStamp,
    report: &mut MergeReport,
) {
    let (clean, rejected) = fields.sanitized();
    if !rejected.is_empty() {
        warn!(entity = %id, origin = %stamp.origin, ?rejected, "dropping out-of-range field groups");
        report.groups_rejected += rejected.len();
    }

    let entity = next.entities.entry(id.clone()).or_insert_with(|| {
        report.created.push(id.clone());
        report.changed_entities.insert(id.clone());
        report.note_write(stamp.at);
        EntitySnapshot::new(id.clone(), stamp.origin, stamp.at)
    });

    let written = entity.apply(&clean, stamp);
    if !written.is_empty() {
        report.groups_written += written.len();
        report.changed_entities.insert(id.clone());
        report.note_write(stamp.at);
    }
}

fn set_current(next: &mut AccountSnapshot, viewed: EntityId) {
    for (id, entity) in next.entities.iter_mut() {
        entity.is_currently_viewed = *id == viewed;
    }
    next.current_entity_id = Some(viewed);
}
