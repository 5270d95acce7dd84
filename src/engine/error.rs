use ulid::Ulid;

use crate::model::{ClaimStatus, UnitRef};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input: bad range, non-positive qty/units, bad index combination.
    Validation(&'static str),
    NotFound {
        what: &'static str,
        id: String,
    },
    AlreadyExists(Ulid),
    /// The explicitly requested unit already has overlapping claims.
    UnitConflict {
        unit: UnitRef,
        conflicting: Vec<Ulid>,
    },
    /// Not enough type-level capacity for the request.
    CapacityExceeded {
        requested: u32,
        free: u32,
    },
    /// Shrinking or retiring a room type would orphan claims.
    InventoryInUse {
        room_type_id: Ulid,
        claims: Vec<Ulid>,
    },
    NotEligible {
        physical_room_id: String,
        reason: &'static str,
    },
    AlreadyBound {
        reservation_id: Ulid,
        physical_room_id: String,
    },
    InvalidStatus {
        reservation_id: Ulid,
        status: ClaimStatus,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn room_type_not_found(id: Ulid) -> Self {
        EngineError::NotFound {
            what: "room type",
            id: id.to_string(),
        }
    }

    pub(crate) fn reservation_not_found(id: Ulid) -> Self {
        EngineError::NotFound {
            what: "reservation",
            id: id.to_string(),
        }
    }

    pub(crate) fn room_not_found(id: &str) -> Self {
        EngineError::NotFound {
            what: "physical room",
            id: id.to_string(),
        }
    }

    /// Conflicts the caller may retry with `force = true` after confirmation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::UnitConflict { .. } | EngineError::CapacityExceeded { .. }
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::NotFound { what, id } => write!(f, "{what} not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::UnitConflict { unit, conflicting } => {
                write!(f, "unit {unit} is already claimed by {conflicting:?}")
            }
            EngineError::CapacityExceeded { requested, free } => {
                write!(f, "capacity exceeded: requested {requested} units, {free} free")
            }
            EngineError::InventoryInUse { room_type_id, claims } => write!(
                f,
                "room type {room_type_id} inventory in use by {} claim(s)",
                claims.len()
            ),
            EngineError::NotEligible {
                physical_room_id,
                reason,
            } => write!(f, "room {physical_room_id} not eligible: {reason}"),
            EngineError::AlreadyBound {
                reservation_id,
                physical_room_id,
            } => write!(
                f,
                "reservation {reservation_id} already bound to room {physical_room_id}"
            ),
            EngineError::InvalidStatus {
                reservation_id,
                status,
            } => write!(f, "reservation {reservation_id} is {status}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
