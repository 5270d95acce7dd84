use ulid::Ulid;

use crate::limits::MAX_UNITS_PER_RESERVATION;
use crate::model::*;

use super::conflict::{capacity_shortfall, unit_conflict, ConflictGuard};
use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Assignment {
    Bound(UnitRef),
    /// Type-level slot; the physical room is chosen at check-in.
    Unassigned,
}

#[derive(Debug)]
pub(crate) struct Placement {
    pub assignment: Assignment,
    pub overrides: Vec<Override>,
}

/// Resolve a booking request against the room type's current claims.
///
/// `exclude` is the reservation being amended, whose own claim must not count
/// against itself. The caller holds the room type's write lock.
pub(crate) fn assign(
    rs: &RoomTypeState,
    stay: &Stay,
    request: &BookingRequest,
    exclude: Option<Ulid>,
) -> Result<Placement, EngineError> {
    let units = request.units_requested;
    if units == 0 {
        return Err(EngineError::Validation("units requested must be positive"));
    }
    if units > MAX_UNITS_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many units in one reservation"));
    }

    let mut guard = ConflictGuard::new(request.force);

    let assignment = match request.explicit_unit_index {
        Some(index) => {
            if units != 1 {
                return Err(EngineError::Validation(
                    "an explicit unit can only be requested for a single unit",
                ));
            }
            let unit = rs.room_type.unit(index).ok_or_else(|| EngineError::NotFound {
                what: "unit",
                id: format!("{}#{index}", rs.room_type.id),
            })?;
            guard.check(unit_conflict(rs, unit, stay, exclude))?;
            guard.check(capacity_shortfall(rs, stay, 1, exclude))?;
            Assignment::Bound(unit)
        }
        None => {
            guard.check(capacity_shortfall(rs, stay, units, exclude))?;
            if units > 1 {
                Assignment::Unassigned
            } else {
                first_free_unit(rs, stay, exclude)
                    .map(Assignment::Bound)
                    .unwrap_or(Assignment::Unassigned)
            }
        }
    };

    Ok(Placement {
        assignment,
        overrides: guard.into_overrides(),
    })
}

/// Lowest-index unit with no bound claim or lodger overlapping `stay`.
/// One pass over the overlapping set, then a gap search over the taken indices.
fn first_free_unit(rs: &RoomTypeState, stay: &Stay, exclude: Option<Ulid>) -> Option<UnitRef> {
    let mut taken: Vec<u32> = rs
        .overlapping(stay)
        .filter(|c| exclude != Some(c.id))
        .filter_map(|c| c.assigned_unit.map(|u| u.index))
        .chain(rs.lodgers_overlapping(stay).filter_map(|l| l.unit_index))
        .collect();
    taken.sort_unstable();
    taken.dedup();

    let mut free = 0;
    for index in taken {
        if index != free {
            break;
        }
        free += 1;
    }
    rs.room_type.unit(free)
}
