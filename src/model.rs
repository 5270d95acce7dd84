use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Half-open night range `[check_in, check_out)`.
///
/// A guest leaving on day D and another arriving on day D never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl Stay {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Result<Self, EngineError> {
        if check_out <= check_in {
            return Err(EngineError::Validation("check-out must be after check-in"));
        }
        Ok(Self { check_in, check_out })
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    pub fn contains(&self, night: NaiveDate) -> bool {
        self.check_in <= night && night < self.check_out
    }

    /// Intersection with `window`, or `None` when they don't overlap.
    pub fn clamp(&self, window: &Stay) -> Option<Stay> {
        let check_in = self.check_in.max(window.check_in);
        let check_out = self.check_out.min(window.check_out);
        (check_in < check_out).then_some(Stay { check_in, check_out })
    }

    pub fn each_night(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.check_in.iter_days().take_while(|d| *d < self.check_out)
    }
}

impl fmt::Display for Stay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

/// One interchangeable slot of a room type. Derived from `qty`, never stored on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitRef {
    pub room_type_id: Ulid,
    pub index: u32,
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.room_type_id, self.index)
    }
}

impl FromStr for UnitRef {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rt, idx) = s
            .split_once('#')
            .ok_or(EngineError::Validation("unit reference must look like <room type>#<index>"))?;
        let room_type_id =
            Ulid::from_string(rt).map_err(|_| EngineError::Validation("malformed room type id"))?;
        let index = idx
            .parse()
            .map_err(|_| EngineError::Validation("malformed unit index"))?;
        Ok(Self { room_type_id, index })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomType {
    pub id: Ulid,
    pub name: Option<String>,
    /// Total interchangeable units.
    pub qty: u32,
    /// Minor currency units.
    pub price_per_night: u64,
}

impl RoomType {
    pub fn unit(&self, index: u32) -> Option<UnitRef> {
        (index < self.qty).then_some(UnitRef { room_type_id: self.id, index })
    }

    /// `price_per_night × nights × units`; `None` on overflow.
    pub fn quote(&self, stay: &Stay, units: u32) -> Option<u64> {
        let nights = u64::try_from(stay.nights()).ok()?;
        self.price_per_night
            .checked_mul(nights)?
            .checked_mul(u64::from(units))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimStatus {
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl ClaimStatus {
    /// Whether the claim still counts against inventory. Cancelled never comes back.
    pub fn holds_inventory(self) -> bool {
        !matches!(self, ClaimStatus::Cancelled)
    }

    /// Confirmed or in-house.
    pub fn is_live(self) -> bool {
        matches!(self, ClaimStatus::Confirmed | ClaimStatus::CheckedIn)
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimStatus::Confirmed => "confirmed",
            ClaimStatus::CheckedIn => "checked_in",
            ClaimStatus::CheckedOut => "checked_out",
            ClaimStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A conflict that was committed anyway because the caller passed `force`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Override {
    UnitConflict { unit: UnitRef, conflicting: Vec<Ulid> },
    CapacityExceeded { requested: u32, free: u32 },
}

/// A reservation's hold on a specific unit or on type-level capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationClaim {
    pub id: Ulid,
    pub room_type_id: Ulid,
    /// `None` means an unassigned, type-level claim of `units_requested` slots.
    pub assigned_unit: Option<UnitRef>,
    pub units_requested: u32,
    pub stay: Stay,
    pub status: ClaimStatus,
    pub forced: bool,
    pub overrides: Vec<Override>,
    /// Minor currency units.
    pub total_price: u64,
    pub created_by: Option<String>,
}

impl ReservationClaim {
    /// Units this claim takes at any night of its stay.
    pub fn occupied_units(&self) -> u32 {
        if self.assigned_unit.is_some() {
            1
        } else {
            self.units_requested
        }
    }

    pub fn is_bound_to(&self, index: u32) -> bool {
        self.assigned_unit.is_some_and(|u| u.index == index)
    }
}

/// Per-room-type state guarded by the room type's lock.
#[derive(Debug, Clone)]
pub struct RoomTypeState {
    pub room_type: RoomType,
    /// Retired types accept no bookings; their claims stay for history.
    pub retired: bool,
    /// Every claim ever committed on this type, sorted by `stay.check_in`.
    pub claims: Vec<ReservationClaim>,
    /// Guests of other room types currently bound to one of this type's rooms.
    pub lodgers: Vec<Lodger>,
}

/// An in-house guest of another room type occupying one of this type's rooms.
/// Takes one unit of this type for as long as the binding stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lodger {
    pub reservation_id: Ulid,
    /// Unit realised by the room, if mapped.
    pub unit_index: Option<u32>,
    pub stay: Stay,
}

impl RoomTypeState {
    pub fn new(room_type: RoomType) -> Self {
        Self {
            room_type,
            retired: false,
            claims: Vec::new(),
            lodgers: Vec::new(),
        }
    }

    /// Insert claim maintaining sort order by check-in.
    pub fn insert_claim(&mut self, claim: ReservationClaim) {
        let pos = self
            .claims
            .partition_point(|c| c.stay.check_in <= claim.stay.check_in);
        self.claims.insert(pos, claim);
    }

    /// Replace an existing claim (same id), re-sorting if the stay moved.
    pub fn replace_claim(&mut self, claim: ReservationClaim) {
        if let Some(pos) = self.claims.iter().position(|c| c.id == claim.id) {
            self.claims.remove(pos);
        }
        self.insert_claim(claim);
    }

    pub fn claim(&self, id: &Ulid) -> Option<&ReservationClaim> {
        self.claims.iter().find(|c| c.id == *id)
    }

    pub fn claim_mut(&mut self, id: &Ulid) -> Option<&mut ReservationClaim> {
        self.claims.iter_mut().find(|c| c.id == *id)
    }

    /// Non-cancelled claims overlapping `query`.
    /// Claims checking in at or after `query.check_out` are skipped by binary search.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &ReservationClaim> {
        let right_bound = self
            .claims
            .partition_point(|c| c.stay.check_in < query.check_out);
        self.claims[..right_bound]
            .iter()
            .filter(move |c| c.stay.check_out > query.check_in && c.status.holds_inventory())
    }

    /// Lodgers whose stay overlaps `query`.
    pub fn lodgers_overlapping<'a>(&'a self, query: &'a Stay) -> impl Iterator<Item = &'a Lodger> + 'a {
        self.lodgers.iter().filter(move |l| l.stay.overlaps(query))
    }

    /// Replaces any earlier entry for the same reservation.
    pub fn add_lodger(&mut self, lodger: Lodger) {
        self.remove_lodger(&lodger.reservation_id);
        self.lodgers.push(lodger);
    }

    pub fn remove_lodger(&mut self, reservation_id: &Ulid) {
        self.lodgers.retain(|l| l.reservation_id != *reservation_id);
    }

    /// Highest unit index referenced by a non-cancelled claim or a lodger.
    pub fn highest_bound_index(&self) -> Option<u32> {
        self.claims
            .iter()
            .filter(|c| c.status.holds_inventory())
            .filter_map(|c| c.assigned_unit.map(|u| u.index))
            .chain(self.lodgers.iter().filter_map(|l| l.unit_index))
            .max()
    }
}

/// A room in the hotel's physical-room directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalRoom {
    /// Room number as printed on the door.
    pub id: String,
    pub room_type_id: Ulid,
    /// Unit of `room_type_id` this room realises, if mapped.
    pub unit_index: Option<u32>,
}

impl PhysicalRoom {
    pub fn realises(&self, unit: &UnitRef) -> bool {
        self.room_type_id == unit.room_type_id && self.unit_index == Some(unit.index)
    }
}

/// The mapping of a reservation to one physical room. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInBinding {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub physical_room_id: String,
    /// Type and unit of the room at bind time. Differs from the reservation's
    /// type when the guest is lodged in another type's room.
    pub room_type_id: Ulid,
    pub unit_index: Option<u32>,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomChangeReason {
    GuestRequest,
    Maintenance,
    Upgrade,
    Downgrade,
    Other(String),
}

impl RoomChangeReason {
    pub fn code(&self) -> &str {
        match self {
            RoomChangeReason::GuestRequest => "guest_request",
            RoomChangeReason::Maintenance => "maintenance",
            RoomChangeReason::Upgrade => "upgrade",
            RoomChangeReason::Downgrade => "downgrade",
            RoomChangeReason::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    RoomChange(RoomChangeReason),
    CheckedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingClosure {
    pub at: DateTime<Utc>,
    pub reason: CloseReason,
}

/// A binding plus, once it has ended, the closure stamped next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub binding: CheckInBinding,
    pub closure: Option<BindingClosure>,
}

impl BindingRecord {
    pub fn is_open(&self) -> bool {
        self.closure.is_none()
    }
}

/// Acting-user reference carried for audit attribution. Never branched on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub actor: Option<String>,
}

impl RequestContext {
    pub fn system() -> Self {
        Self { actor: None }
    }

    pub fn actor(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
        }
    }
}

/// Input to `create_reservation` / `amend_reservation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub room_type_id: Ulid,
    pub explicit_unit_index: Option<u32>,
    pub units_requested: u32,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub force: bool,
}

impl BookingRequest {
    pub fn new(room_type_id: Ulid, check_in: NaiveDate, check_out: NaiveDate) -> Self {
        Self {
            room_type_id,
            explicit_unit_index: None,
            units_requested: 1,
            check_in,
            check_out,
            force: false,
        }
    }

    pub fn units(mut self, units: u32) -> Self {
        self.units_requested = units;
        self
    }

    pub fn unit(mut self, index: u32) -> Self {
        self.explicit_unit_index = Some(index);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomTypeCreated {
        id: Ulid,
        name: Option<String>,
        qty: u32,
        price_per_night: u64,
        actor: Option<String>,
    },
    RoomTypeUpdated {
        id: Ulid,
        name: Option<String>,
        qty: u32,
        price_per_night: u64,
        actor: Option<String>,
    },
    RoomTypeRetired {
        id: Ulid,
        actor: Option<String>,
    },
    ClaimCommitted {
        claim: ReservationClaim,
        actor: Option<String>,
    },
    ClaimAmended {
        claim: ReservationClaim,
        actor: Option<String>,
    },
    ClaimCancelled {
        id: Ulid,
        room_type_id: Ulid,
        actor: Option<String>,
    },
    CheckedIn {
        room_type_id: Ulid,
        binding: CheckInBinding,
        actor: Option<String>,
    },
    RoomChanged {
        room_type_id: Ulid,
        closed_binding_id: Ulid,
        reason: RoomChangeReason,
        binding: CheckInBinding,
        actor: Option<String>,
    },
    CheckedOut {
        id: Ulid,
        room_type_id: Ulid,
        at: DateTime<Utc>,
        /// Final check-out date; earlier than planned on early departure.
        check_out: NaiveDate,
        closed_binding_id: Option<Ulid>,
        actor: Option<String>,
    },
    /// Written by log compaction: a binding exactly as it stood, closure included.
    BindingRestored {
        room_type_id: Ulid,
        record: BindingRecord,
        stay: Stay,
    },
}

impl Event {
    pub fn room_type_id(&self) -> Ulid {
        match self {
            Event::RoomTypeCreated { id, .. }
            | Event::RoomTypeUpdated { id, .. }
            | Event::RoomTypeRetired { id, .. } => *id,
            Event::ClaimCommitted { claim, .. } | Event::ClaimAmended { claim, .. } => {
                claim.room_type_id
            }
            Event::ClaimCancelled { room_type_id, .. }
            | Event::CheckedIn { room_type_id, .. }
            | Event::RoomChanged { room_type_id, .. }
            | Event::CheckedOut { room_type_id, .. }
            | Event::BindingRestored { room_type_id, .. } => *room_type_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub room_type_id: Ulid,
    pub free_units: u32,
    pub total_units: u32,
    pub units_requested: u32,
    pub fits: bool,
    /// Price for the requested units over the stay, if it doesn't overflow.
    pub quote: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NightlyAvailability {
    pub night: NaiveDate,
    pub free_units: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, day).unwrap()
    }

    fn claim(check_in: NaiveDate, check_out: NaiveDate, status: ClaimStatus) -> ReservationClaim {
        ReservationClaim {
            id: Ulid::new(),
            room_type_id: Ulid::new(),
            assigned_unit: None,
            units_requested: 1,
            stay: Stay::new(check_in, check_out).unwrap(),
            status,
            forced: false,
            overrides: Vec::new(),
            total_price: 0,
            created_by: None,
        }
    }

    #[test]
    fn stay_basics() {
        let s = Stay::new(d(1, 10), d(1, 12)).unwrap();
        assert_eq!(s.nights(), 2);
        assert!(s.contains(d(1, 10)));
        assert!(s.contains(d(1, 11)));
        assert!(!s.contains(d(1, 12))); // half-open
        assert_eq!(s.each_night().collect::<Vec<_>>(), vec![d(1, 10), d(1, 11)]);
    }

    #[test]
    fn stay_rejects_empty_and_inverted() {
        assert!(matches!(
            Stay::new(d(1, 10), d(1, 10)),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            Stay::new(d(1, 12), d(1, 10)),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn stay_overlap() {
        let a = Stay::new(d(1, 5), d(1, 8)).unwrap();
        let b = Stay::new(d(1, 6), d(1, 9)).unwrap();
        let c = Stay::new(d(1, 8), d(1, 10)).unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // same-day turnover
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn stay_clamp() {
        let window = Stay::new(d(1, 11), d(1, 13)).unwrap();
        let s = Stay::new(d(1, 10), d(1, 12)).unwrap();
        assert_eq!(s.clamp(&window), Some(Stay::new(d(1, 11), d(1, 12)).unwrap()));
        let before = Stay::new(d(1, 1), d(1, 11)).unwrap();
        assert_eq!(before.clamp(&window), None);
    }

    #[test]
    fn unit_ref_renders_and_parses() {
        let rt = Ulid::new();
        let unit = UnitRef { room_type_id: rt, index: 3 };
        let text = unit.to_string();
        assert_eq!(text, format!("{rt}#3"));
        assert_eq!(text.parse::<UnitRef>().unwrap(), unit);
        assert!("nonsense".parse::<UnitRef>().is_err());
        assert!(format!("{rt}#x").parse::<UnitRef>().is_err());
    }

    #[test]
    fn room_type_units_are_derived() {
        let rt = RoomType {
            id: Ulid::new(),
            name: None,
            qty: 2,
            price_per_night: 100,
        };
        assert!(rt.unit(0).is_some());
        assert!(rt.unit(1).is_some());
        assert!(rt.unit(2).is_none());
        let stay = Stay::new(d(1, 1), d(1, 4)).unwrap();
        assert_eq!(rt.quote(&stay, 2), Some(600));
    }

    #[test]
    fn quote_overflow_is_none() {
        let rt = RoomType {
            id: Ulid::new(),
            name: None,
            qty: 1,
            price_per_night: u64::MAX,
        };
        let stay = Stay::new(d(1, 1), d(1, 3)).unwrap();
        assert_eq!(rt.quote(&stay, 1), None);
    }

    #[test]
    fn claims_stay_sorted_by_check_in() {
        let mut rs = RoomTypeState::new(RoomType {
            id: Ulid::new(),
            name: None,
            qty: 1,
            price_per_night: 0,
        });
        rs.insert_claim(claim(d(1, 20), d(1, 22), ClaimStatus::Confirmed));
        rs.insert_claim(claim(d(1, 5), d(1, 6), ClaimStatus::Confirmed));
        rs.insert_claim(claim(d(1, 10), d(1, 12), ClaimStatus::Confirmed));
        let starts: Vec<_> = rs.claims.iter().map(|c| c.stay.check_in).collect();
        assert_eq!(starts, vec![d(1, 5), d(1, 10), d(1, 20)]);
    }

    #[test]
    fn overlapping_skips_cancelled_and_adjacent() {
        let mut rs = RoomTypeState::new(RoomType {
            id: Ulid::new(),
            name: None,
            qty: 3,
            price_per_night: 0,
        });
        rs.insert_claim(claim(d(1, 1), d(1, 10), ClaimStatus::Confirmed)); // ends at query start
        rs.insert_claim(claim(d(1, 9), d(1, 12), ClaimStatus::Cancelled));
        rs.insert_claim(claim(d(1, 11), d(1, 14), ClaimStatus::CheckedIn));
        rs.insert_claim(claim(d(1, 15), d(1, 16), ClaimStatus::Confirmed)); // starts at query end
        let query = Stay::new(d(1, 10), d(1, 15)).unwrap();
        let hits: Vec<_> = rs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].stay.check_in, d(1, 11));
    }

    #[test]
    fn replace_claim_resorts() {
        let mut rs = RoomTypeState::new(RoomType {
            id: Ulid::new(),
            name: None,
            qty: 1,
            price_per_night: 0,
        });
        let mut first = claim(d(1, 1), d(1, 2), ClaimStatus::Confirmed);
        rs.insert_claim(first.clone());
        rs.insert_claim(claim(d(1, 5), d(1, 6), ClaimStatus::Confirmed));
        first.stay = Stay::new(d(1, 8), d(1, 9)).unwrap();
        rs.replace_claim(first.clone());
        assert_eq!(rs.claims.len(), 2);
        assert_eq!(rs.claims[1].id, first.id);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ClaimCommitted {
            claim: claim(d(3, 1), d(3, 4), ClaimStatus::Confirmed),
            actor: Some("front-desk".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
