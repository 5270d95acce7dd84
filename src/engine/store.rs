use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone)]
struct OpenBinding {
    binding_id: Ulid,
    physical_room_id: String,
    stay: Stay,
}

/// Every check-in binding ever made, plus an index of the ones still open.
/// Guarded by the engine's binding lock; always acquired after a room-type lock.
#[derive(Debug, Default)]
pub struct BindingLedger {
    history: HashMap<Ulid, Vec<BindingRecord>>,
    open: HashMap<Ulid, OpenBinding>,
}

impl BindingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_binding(&self, reservation_id: &Ulid) -> Option<&BindingRecord> {
        let open = self.open.get(reservation_id)?;
        self.history
            .get(reservation_id)?
            .iter()
            .find(|r| r.binding.id == open.binding_id)
    }

    /// All bindings of a reservation, oldest first.
    pub fn history(&self, reservation_id: &Ulid) -> &[BindingRecord] {
        self.history
            .get(reservation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn bind(&mut self, binding: CheckInBinding, stay: Stay) {
        self.restore(
            BindingRecord {
                binding,
                closure: None,
            },
            stay,
        );
    }

    /// Re-insert a record as it was (log compaction / replay).
    pub fn restore(&mut self, record: BindingRecord, stay: Stay) {
        let reservation_id = record.binding.reservation_id;
        if record.is_open() {
            self.open.insert(
                reservation_id,
                OpenBinding {
                    binding_id: record.binding.id,
                    physical_room_id: record.binding.physical_room_id.clone(),
                    stay,
                },
            );
        }
        self.history.entry(reservation_id).or_default().push(record);
    }

    /// Stamp a closure next to the binding. Returns false if it wasn't open.
    pub fn close(&mut self, reservation_id: &Ulid, binding_id: &Ulid, closure: BindingClosure) -> bool {
        let is_current = self
            .open
            .get(reservation_id)
            .is_some_and(|o| o.binding_id == *binding_id);
        if !is_current {
            return false;
        }
        self.open.remove(reservation_id);
        if let Some(record) = self
            .history
            .get_mut(reservation_id)
            .and_then(|records| records.iter_mut().find(|r| r.binding.id == *binding_id))
        {
            record.closure = Some(closure);
        }
        true
    }

    /// Reservation holding an open binding on `physical_room_id` overlapping `stay`.
    pub fn occupant(&self, physical_room_id: &str, stay: &Stay, except: Option<Ulid>) -> Option<Ulid> {
        self.open
            .iter()
            .find(|(reservation_id, o)| {
                Some(**reservation_id) != except
                    && o.physical_room_id == physical_room_id
                    && o.stay.overlaps(stay)
            })
            .map(|(reservation_id, _)| *reservation_id)
    }

    /// Stay recorded for an open binding.
    pub fn open_stay(&self, reservation_id: &Ulid) -> Option<Stay> {
        self.open.get(reservation_id).map(|o| o.stay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn stay(a: u32, b: u32) -> Stay {
        Stay::new(
            NaiveDate::from_ymd_opt(2025, 6, a).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, b).unwrap(),
        )
        .unwrap()
    }

    fn binding(reservation_id: Ulid, room: &str) -> CheckInBinding {
        CheckInBinding {
            id: Ulid::new(),
            reservation_id,
            physical_room_id: room.into(),
            room_type_id: Ulid::new(),
            unit_index: None,
            bound_at: Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap(),
        }
    }

    #[test]
    fn bind_and_lookup() {
        let mut ledger = BindingLedger::new();
        let rid = Ulid::new();
        let b = binding(rid, "101");
        ledger.bind(b.clone(), stay(1, 3));

        assert_eq!(ledger.open_binding(&rid).unwrap().binding, b);
        assert_eq!(ledger.occupant("101", &stay(2, 4), None), Some(rid));
        assert_eq!(ledger.occupant("101", &stay(2, 4), Some(rid)), None);
        assert_eq!(ledger.occupant("101", &stay(3, 4), None), None);
        assert_eq!(ledger.occupant("102", &stay(1, 3), None), None);
    }

    #[test]
    fn close_keeps_history() {
        let mut ledger = BindingLedger::new();
        let rid = Ulid::new();
        let first = binding(rid, "101");
        ledger.bind(first.clone(), stay(1, 3));

        let closure = BindingClosure {
            at: Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
            reason: CloseReason::RoomChange(RoomChangeReason::Maintenance),
        };
        assert!(ledger.close(&rid, &first.id, closure.clone()));
        assert!(ledger.open_binding(&rid).is_none());
        assert_eq!(ledger.open_count(), 0);

        let second = binding(rid, "102");
        ledger.bind(second.clone(), stay(1, 3));

        let history = ledger.history(&rid);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].closure, Some(closure));
        assert!(history[1].is_open());
        assert_eq!(ledger.open_binding(&rid).unwrap().binding.id, second.id);
        assert_eq!(ledger.occupant("101", &stay(1, 3), None), None);
    }

    #[test]
    fn close_unknown_binding_is_noop() {
        let mut ledger = BindingLedger::new();
        let rid = Ulid::new();
        ledger.bind(binding(rid, "101"), stay(1, 3));
        let closure = BindingClosure {
            at: Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
            reason: CloseReason::CheckedOut,
        };
        assert!(!ledger.close(&rid, &Ulid::new(), closure));
        assert!(ledger.open_binding(&rid).is_some());
    }

    #[test]
    fn empty_history() {
        let ledger = BindingLedger::new();
        assert!(ledger.history(&Ulid::new()).is_empty());
    }
}
