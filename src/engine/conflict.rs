use chrono::Datelike;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{free_units, unit_claims, unit_lodgers};
use super::EngineError;

pub(crate) fn validate_stay(stay: &Stay) -> Result<(), EngineError> {
    validate_window(stay)?;
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(crate) fn validate_window(stay: &Stay) -> Result<(), EngineError> {
    if stay.check_in.year() < MIN_VALID_YEAR || stay.check_out.year() > MAX_VALID_YEAR {
        return Err(EngineError::Validation("date out of range"));
    }
    if stay.nights() > MAX_QUERY_NIGHTS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_context(ctx: &RequestContext) -> Result<(), EngineError> {
    if ctx.actor.as_ref().is_some_and(|a| a.len() > MAX_ACTOR_LEN) {
        return Err(EngineError::LimitExceeded("actor reference too long"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: Option<&str>) -> Result<(), EngineError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("room type name too long"));
    }
    Ok(())
}

/// Overlapping claims or lodgers already on `unit`, if any.
pub(crate) fn unit_conflict(
    rs: &RoomTypeState,
    unit: UnitRef,
    stay: &Stay,
    exclude: Option<Ulid>,
) -> Option<Override> {
    let conflicting: Vec<Ulid> = unit_claims(rs, unit.index, stay, exclude)
        .map(|c| c.id)
        .chain(unit_lodgers(rs, unit.index, stay).map(|l| l.reservation_id))
        .collect();
    (!conflicting.is_empty()).then_some(Override::UnitConflict { unit, conflicting })
}

/// Type-level shortfall for `units` over `stay`, if any.
pub(crate) fn capacity_shortfall(
    rs: &RoomTypeState,
    stay: &Stay,
    units: u32,
    exclude: Option<Ulid>,
) -> Option<Override> {
    let free = free_units(rs, stay, exclude);
    (units > free).then_some(Override::CapacityExceeded {
        requested: units,
        free,
    })
}

impl From<Override> for EngineError {
    fn from(o: Override) -> Self {
        match o {
            Override::UnitConflict { unit, conflicting } => {
                EngineError::UnitConflict { unit, conflicting }
            }
            Override::CapacityExceeded { requested, free } => {
                EngineError::CapacityExceeded { requested, free }
            }
        }
    }
}

fn finding_label(o: &Override) -> &'static str {
    match o {
        Override::UnitConflict { .. } => "unit_conflict",
        Override::CapacityExceeded { .. } => "capacity_exceeded",
    }
}

/// Gates conflicts behind the caller's `force` flag.
///
/// Without `force` the first finding rejects the write as a typed, recoverable error.
/// With `force` every finding is collected so the claim can be stamped for audit.
/// The guard never touches other reservations.
pub(crate) struct ConflictGuard {
    force: bool,
    overrides: Vec<Override>,
}

impl ConflictGuard {
    pub(crate) fn new(force: bool) -> Self {
        Self {
            force,
            overrides: Vec::new(),
        }
    }

    pub(crate) fn check(&mut self, finding: Option<Override>) -> Result<(), EngineError> {
        let Some(finding) = finding else {
            return Ok(());
        };
        let label = finding_label(&finding);
        if !self.force {
            debug!(conflict = label, "booking rejected: {finding:?}");
            metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL, "kind" => label)
                .increment(1);
            return Err(finding.into());
        }
        warn!(conflict = label, "conflict overridden by force: {finding:?}");
        metrics::counter!(crate::observability::OVERRIDES_FORCED_TOTAL, "kind" => label)
            .increment(1);
        self.overrides.push(finding);
        Ok(())
    }

    pub(crate) fn into_overrides(self) -> Vec<Override> {
        self.overrides
    }
}
