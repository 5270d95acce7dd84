use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{free_units, unit_lodgers};
use super::conflict::validate_context;
use super::{BindingLedger, BindingLocks, Engine, EngineError};

/// 0 = the room realising the claim's unit, 1 = same type, 2 = any other type.
fn tier(claim: &ReservationClaim, room: &PhysicalRoom) -> u8 {
    match claim.assigned_unit {
        Some(unit) if room.realises(&unit) => 0,
        _ if room.room_type_id == claim.room_type_id => 1,
        _ => 2,
    }
}

fn tier_label(tier: u8) -> &'static str {
    match tier {
        0 => "assigned",
        1 => "same_type",
        _ => "other_type",
    }
}

/// Checks against the state of the room's own type, `rs`.
///
/// A unit bound to another overlapping live claim, or to another lodger, is reserved.
/// A room of a type other than the reservation's also needs a free unit of that
/// type, since the guest will hold one there for the rest of the stay.
fn room_type_conflict(
    rs: &RoomTypeState,
    claim: &ReservationClaim,
    room: &PhysicalRoom,
) -> Option<&'static str> {
    let lodging = rs.room_type.id != claim.room_type_id;
    if lodging && rs.retired {
        return Some("room type retired");
    }
    if let Some(index) = room.unit_index
        && !claim.assigned_unit.is_some_and(|unit| room.realises(&unit))
    {
        let bound_elsewhere = rs
            .overlapping(&claim.stay)
            .any(|c| c.id != claim.id && c.status.is_live() && c.is_bound_to(index));
        let lodged_elsewhere = unit_lodgers(rs, index, &claim.stay).any(|l| l.reservation_id != claim.id);
        if bound_elsewhere || lodged_elsewhere {
            return Some("reserved for another reservation");
        }
    }
    if lodging && free_units(rs, &claim.stay, Some(claim.id)) == 0 {
        return Some("no free unit of the room's type");
    }
    None
}

fn occupied(ledger: &BindingLedger, claim: &ReservationClaim, room: &PhysicalRoom) -> Option<&'static str> {
    ledger
        .occupant(&room.id, &claim.stay, Some(claim.id))
        .map(|_| "occupied by another guest")
}

fn validate_reason(reason: &RoomChangeReason) -> Result<(), EngineError> {
    if let RoomChangeReason::Other(code) = reason {
        if code.is_empty() {
            return Err(EngineError::Validation("room change reason code is empty"));
        }
        if code.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room change reason code too long"));
        }
    }
    Ok(())
}

fn validate_room_id(physical_room_id: &str) -> Result<(), EngineError> {
    if physical_room_id.len() > MAX_ROOM_ID_LEN {
        return Err(EngineError::LimitExceeded("room id too long"));
    }
    Ok(())
}

fn live_claim(rs: &RoomTypeState, reservation_id: Ulid) -> Result<ReservationClaim, EngineError> {
    rs.claim(&reservation_id)
        .cloned()
        .ok_or_else(|| EngineError::reservation_not_found(reservation_id))
}

impl Engine {
    async fn current_binding(&self, reservation_id: &Ulid) -> Option<CheckInBinding> {
        self.bindings
            .read()
            .await
            .open_binding(reservation_id)
            .map(|r| r.binding.clone())
    }

    /// Lock the reservation's type, the type of the room it is bound to and
    /// `entering`, and return the open binding as seen under those locks.
    async fn lock_binding_change(
        &self,
        reservation_id: Ulid,
        entering: Option<Ulid>,
    ) -> Result<(BindingLocks, Option<CheckInBinding>), EngineError> {
        loop {
            let leaving = self.current_binding(&reservation_id).await.map(|b| b.room_type_id);
            let hosts: Vec<Ulid> = leaving.into_iter().chain(entering).collect();
            let locks = self.lock_for_binding(&reservation_id, &hosts).await?;
            // Only this reservation's own mutations move its binding, and they all
            // hold its room type's write lock, which we now have.
            let current = self.current_binding(&reservation_id).await;
            if current.as_ref().map(|b| b.room_type_id) == leaving {
                return Ok((locks, current));
            }
        }
    }

    /// Directory lookup for a room the engine can account for.
    async fn inventory_room(&self, physical_room_id: &str) -> Result<PhysicalRoom, EngineError> {
        let room = self
            .directory
            .room(physical_room_id)
            .await
            .ok_or_else(|| EngineError::room_not_found(physical_room_id))?;
        if self.get_room_type(&room.room_type_id).is_none() {
            return Err(EngineError::NotEligible {
                physical_room_id: room.id,
                reason: "room type not in inventory",
            });
        }
        Ok(room)
    }

    /// Rooms the guest of `reservation_id` could be put in, best first.
    ///
    /// Ordered by tier, then room id. For an in-house guest the current room is left out.
    /// Each room type is read under its own lock in turn, so the list is advisory;
    /// `check_in` and `change_room` re-check under their locks.
    pub async fn eligible_rooms(&self, reservation_id: Ulid) -> Result<Vec<PhysicalRoom>, EngineError> {
        let claim = {
            let guard = self.reservation_read(&reservation_id).await?;
            live_claim(&guard, reservation_id)?
        };
        if !claim.status.is_live() {
            return Err(EngineError::InvalidStatus {
                reservation_id,
                status: claim.status,
            });
        }

        let mut candidates = self.directory.rooms_of_type(claim.room_type_id).await;
        candidates.extend(
            self.directory
                .all_rooms()
                .await
                .into_iter()
                .filter(|room| room.room_type_id != claim.room_type_id),
        );
        let mut in_service = Vec::with_capacity(candidates.len());
        for room in candidates {
            if !self.directory.occupancy_during(&room.id, &claim.stay).await {
                in_service.push(room);
            }
        }

        let mut type_ids: Vec<Ulid> = in_service.iter().map(|room| room.room_type_id).collect();
        type_ids.sort();
        type_ids.dedup();
        let mut refused: HashSet<String> = HashSet::new();
        for type_id in type_ids {
            let rooms = in_service.iter().filter(|room| room.room_type_id == type_id);
            let Some(state) = self.get_room_type(&type_id) else {
                refused.extend(rooms.map(|room| room.id.clone()));
                continue;
            };
            let rs = state.read().await;
            refused.extend(
                rooms
                    .filter(|room| room_type_conflict(&rs, &claim, room).is_some())
                    .map(|room| room.id.clone()),
            );
        }

        let ledger = self.bindings.read().await;
        let current = ledger
            .open_binding(&reservation_id)
            .map(|r| r.binding.physical_room_id.clone());
        let mut eligible: Vec<(u8, PhysicalRoom)> = in_service
            .into_iter()
            .filter(|room| !refused.contains(&room.id))
            .filter(|room| current.as_deref() != Some(room.id.as_str()))
            .filter(|room| occupied(&ledger, &claim, room).is_none())
            .map(|room| (tier(&claim, &room), room))
            .collect();
        eligible.sort_by(|(ta, a), (tb, b)| ta.cmp(tb).then_with(|| a.id.cmp(&b.id)));
        Ok(eligible.into_iter().map(|(_, room)| room).collect())
    }

    /// Bind a confirmed reservation to a physical room.
    pub async fn check_in(
        &self,
        ctx: &RequestContext,
        reservation_id: Ulid,
        physical_room_id: &str,
        time: DateTime<Utc>,
    ) -> Result<CheckInBinding, EngineError> {
        validate_context(ctx)?;
        validate_room_id(physical_room_id)?;
        let room = self.inventory_room(physical_room_id).await?;
        let (mut locks, current) = self
            .lock_binding_change(reservation_id, Some(room.room_type_id))
            .await?;
        let claim = live_claim(&locks.own, reservation_id)?;

        if let Some(open) = current {
            return Err(EngineError::AlreadyBound {
                reservation_id,
                physical_room_id: open.physical_room_id,
            });
        }
        if claim.status != ClaimStatus::Confirmed {
            return Err(EngineError::InvalidStatus {
                reservation_id,
                status: claim.status,
            });
        }
        if time.date_naive() >= claim.stay.check_out {
            return Err(EngineError::Validation("check-in time is past the stay's check-out"));
        }
        self.ensure_bindable(&locks, &claim, &room).await?;

        let mut ledger = self.bindings.write().await;
        if let Some(reason) = occupied(&ledger, &claim, &room) {
            return Err(EngineError::NotEligible {
                physical_room_id: room.id,
                reason,
            });
        }

        let binding = CheckInBinding {
            id: Ulid::new(),
            reservation_id,
            physical_room_id: room.id.clone(),
            room_type_id: room.room_type_id,
            unit_index: room.unit_index,
            bound_at: time,
        };
        let event = Event::CheckedIn {
            room_type_id: claim.room_type_id,
            binding: binding.clone(),
            actor: ctx.actor.clone(),
        };
        self.persist_and_apply_bound(&mut locks, &mut ledger, &event).await?;

        let tier = tier_label(tier(&claim, &room));
        metrics::counter!(crate::observability::CHECK_INS_TOTAL, "tier" => tier).increment(1);
        info!("reservation {reservation_id} checked in to room {} ({tier})", room.id);
        Ok(binding)
    }

    /// Directory and room-type checks for binding `claim` to `room`, under `locks`.
    async fn ensure_bindable(
        &self,
        locks: &BindingLocks,
        claim: &ReservationClaim,
        room: &PhysicalRoom,
    ) -> Result<(), EngineError> {
        if self.directory.occupancy_during(&room.id, &claim.stay).await {
            return Err(EngineError::NotEligible {
                physical_room_id: room.id.clone(),
                reason: "out of service",
            });
        }
        let reason = locks
            .state_of(room.room_type_id)
            .map_or(Some("room type not in inventory"), |rs| {
                room_type_conflict(rs, claim, room)
            });
        match reason {
            Some(reason) => Err(EngineError::NotEligible {
                physical_room_id: room.id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Move an in-house guest. The old binding is closed with `reason`, a new one is
    /// opened at `at`, and both stay in the reservation's history.
    pub async fn change_room(
        &self,
        ctx: &RequestContext,
        reservation_id: Ulid,
        new_physical_room_id: &str,
        reason: RoomChangeReason,
        at: DateTime<Utc>,
    ) -> Result<CheckInBinding, EngineError> {
        validate_context(ctx)?;
        validate_reason(&reason)?;
        validate_room_id(new_physical_room_id)?;
        let room = self.inventory_room(new_physical_room_id).await?;
        let (mut locks, current) = self
            .lock_binding_change(reservation_id, Some(room.room_type_id))
            .await?;
        let claim = live_claim(&locks.own, reservation_id)?;
        if claim.status != ClaimStatus::CheckedIn {
            return Err(EngineError::InvalidStatus {
                reservation_id,
                status: claim.status,
            });
        }
        let current = current.ok_or(EngineError::Validation("reservation has no open binding"))?;
        if current.physical_room_id == room.id {
            return Err(EngineError::Validation("guest is already in that room"));
        }
        self.ensure_bindable(&locks, &claim, &room).await?;

        let mut ledger = self.bindings.write().await;
        if let Some(why) = occupied(&ledger, &claim, &room) {
            return Err(EngineError::NotEligible {
                physical_room_id: room.id,
                reason: why,
            });
        }

        let binding = CheckInBinding {
            id: Ulid::new(),
            reservation_id,
            physical_room_id: room.id.clone(),
            room_type_id: room.room_type_id,
            unit_index: room.unit_index,
            bound_at: at,
        };
        let event = Event::RoomChanged {
            room_type_id: claim.room_type_id,
            closed_binding_id: current.id,
            reason: reason.clone(),
            binding: binding.clone(),
            actor: ctx.actor.clone(),
        };
        self.persist_and_apply_bound(&mut locks, &mut ledger, &event).await?;

        metrics::counter!(crate::observability::ROOM_CHANGES_TOTAL, "reason" => reason.code().to_string())
            .increment(1);
        info!(
            "reservation {reservation_id} moved from room {} to {} ({})",
            current.physical_room_id,
            room.id,
            reason.code()
        );
        Ok(binding)
    }

    /// CheckedIn → CheckedOut. Leaving before the planned date gives the unused
    /// nights back to inventory.
    pub async fn check_out(
        &self,
        ctx: &RequestContext,
        reservation_id: Ulid,
        time: DateTime<Utc>,
    ) -> Result<ReservationClaim, EngineError> {
        validate_context(ctx)?;
        let (mut locks, current) = self.lock_binding_change(reservation_id, None).await?;
        let claim = live_claim(&locks.own, reservation_id)?;
        if claim.status != ClaimStatus::CheckedIn {
            return Err(EngineError::InvalidStatus {
                reservation_id,
                status: claim.status,
            });
        }

        // At least the first night is always kept.
        let first_departure = claim.stay.check_in.succ_opt().unwrap_or(claim.stay.check_out);
        let check_out = time
            .date_naive()
            .max(first_departure)
            .min(claim.stay.check_out);

        let mut ledger = self.bindings.write().await;
        let event = Event::CheckedOut {
            id: reservation_id,
            room_type_id: claim.room_type_id,
            at: time,
            check_out,
            closed_binding_id: current.map(|b| b.id),
            actor: ctx.actor.clone(),
        };
        self.persist_and_apply_bound(&mut locks, &mut ledger, &event).await?;

        if check_out < claim.stay.check_out {
            info!(
                "reservation {reservation_id} checked out early on {check_out} (planned {})",
                claim.stay.check_out
            );
        } else {
            info!("reservation {reservation_id} checked out");
        }
        live_claim(&locks.own, reservation_id)
    }

    /// The reservation's open binding, if the guest is in-house.
    pub async fn binding(&self, reservation_id: Ulid) -> Result<Option<CheckInBinding>, EngineError> {
        if self.room_type_of_reservation(&reservation_id).is_none() {
            return Err(EngineError::reservation_not_found(reservation_id));
        }
        let ledger = self.bindings.read().await;
        Ok(ledger.open_binding(&reservation_id).map(|r| r.binding.clone()))
    }

    /// Every binding the reservation has had, oldest first, closures included.
    pub async fn binding_history(&self, reservation_id: Ulid) -> Result<Vec<BindingRecord>, EngineError> {
        if self.room_type_of_reservation(&reservation_id).is_none() {
            return Err(EngineError::reservation_not_found(reservation_id));
        }
        let ledger = self.bindings.read().await;
        Ok(ledger.history(&reservation_id).to_vec())
    }

    /// Number of guests currently bound to a room.
    pub async fn in_house_count(&self) -> usize {
        self.bindings.read().await.open_count()
    }
}
