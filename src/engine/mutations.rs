use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::assign::{assign, Assignment, Placement};
use super::conflict::{validate_context, validate_stay};
use super::{Engine, EngineError, WalCommand};

fn build_claim(
    rs: &RoomTypeState,
    id: Ulid,
    stay: Stay,
    request: &BookingRequest,
    placement: Placement,
    created_by: Option<String>,
) -> Result<ReservationClaim, EngineError> {
    let total_price = rs
        .room_type
        .quote(&stay, request.units_requested)
        .ok_or(EngineError::LimitExceeded("reservation price overflows"))?;
    let assigned_unit = match placement.assignment {
        Assignment::Bound(unit) => Some(unit),
        Assignment::Unassigned => None,
    };
    Ok(ReservationClaim {
        id,
        room_type_id: rs.room_type.id,
        assigned_unit,
        units_requested: request.units_requested,
        stay,
        status: ClaimStatus::Confirmed,
        forced: !placement.overrides.is_empty(),
        overrides: placement.overrides,
        total_price,
        created_by,
    })
}

fn record_commit(claim: &ReservationClaim, verb: &'static str) {
    let forced = if claim.forced { "true" } else { "false" };
    metrics::counter!(crate::observability::RESERVATIONS_COMMITTED_TOTAL, "forced" => forced)
        .increment(1);
    match claim.assigned_unit {
        Some(unit) => info!(
            "reservation {} {verb} on unit {unit} for {} (forced: {})",
            claim.id, claim.stay, claim.forced
        ),
        None => info!(
            "reservation {} {verb} as {} unassigned unit(s) of {} for {} (forced: {})",
            claim.id, claim.units_requested, claim.room_type_id, claim.stay, claim.forced
        ),
    }
}

impl Engine {
    /// Book a room type.
    ///
    /// Capacity and unit conflicts are re-validated inside the room type's write lock,
    /// immediately before the log append, so an earlier `check_availability` is only
    /// advisory. Conflicts surface as `UnitConflict` / `CapacityExceeded` unless
    /// `request.force` is set, in which case the claim is stamped `forced`.
    pub async fn create_reservation(
        &self,
        ctx: &RequestContext,
        request: BookingRequest,
    ) -> Result<ReservationClaim, EngineError> {
        validate_context(ctx)?;
        let stay = Stay::new(request.check_in, request.check_out)?;
        validate_stay(&stay)?;

        let mut guard = self.room_type_write(&request.room_type_id).await?;
        if guard.claims.len() >= MAX_CLAIMS_PER_ROOM_TYPE {
            return Err(EngineError::LimitExceeded("too many claims on room type"));
        }

        let placement = assign(&guard, &stay, &request, None)?;
        let claim = build_claim(&guard, Ulid::new(), stay, &request, placement, ctx.actor.clone())?;

        let event = Event::ClaimCommitted {
            claim: claim.clone(),
            actor: ctx.actor.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        record_commit(&claim, "committed");
        Ok(claim)
    }

    /// Change dates, units or unit of a confirmed reservation. Its own prior claim is
    /// excluded from the capacity and unit checks.
    pub async fn amend_reservation(
        &self,
        ctx: &RequestContext,
        reservation_id: Ulid,
        request: BookingRequest,
    ) -> Result<ReservationClaim, EngineError> {
        validate_context(ctx)?;
        let stay = Stay::new(request.check_in, request.check_out)?;
        validate_stay(&stay)?;

        let mut guard = self.reservation_write(&reservation_id).await?;
        if guard.retired {
            return Err(EngineError::room_type_not_found(guard.room_type.id));
        }
        if request.room_type_id != guard.room_type.id {
            return Err(EngineError::Validation(
                "an amendment cannot move a reservation to another room type",
            ));
        }
        let current = guard
            .claim(&reservation_id)
            .ok_or_else(|| EngineError::reservation_not_found(reservation_id))?;
        if current.status != ClaimStatus::Confirmed {
            return Err(EngineError::InvalidStatus {
                reservation_id,
                status: current.status,
            });
        }
        let created_by = current.created_by.clone();

        let placement = assign(&guard, &stay, &request, Some(reservation_id))?;
        let claim = build_claim(&guard, reservation_id, stay, &request, placement, created_by)?;

        let event = Event::ClaimAmended {
            claim: claim.clone(),
            actor: ctx.actor.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        record_commit(&claim, "amended");
        Ok(claim)
    }

    /// Confirmed → Cancelled. The claim stays in history and never counts again.
    pub async fn cancel_reservation(
        &self,
        ctx: &RequestContext,
        reservation_id: Ulid,
    ) -> Result<ReservationClaim, EngineError> {
        validate_context(ctx)?;
        let mut guard = self.reservation_write(&reservation_id).await?;
        let claim = guard
            .claim(&reservation_id)
            .ok_or_else(|| EngineError::reservation_not_found(reservation_id))?;
        if claim.status != ClaimStatus::Confirmed {
            return Err(EngineError::InvalidStatus {
                reservation_id,
                status: claim.status,
            });
        }

        let event = Event::ClaimCancelled {
            id: reservation_id,
            room_type_id: guard.room_type.id,
            actor: ctx.actor.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {reservation_id} cancelled");
        guard
            .claim(&reservation_id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(reservation_id))
    }

    /// Rewrite the log with the minimal event set that recreates the current state.
    /// Cancelled and checked-out claims and closed bindings are kept.
    ///
    /// Holds every room type's read lock and the binding lock until the new file is
    /// swapped in, so no append can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        let mut room_type_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        room_type_ids.sort();

        let mut guards = Vec::with_capacity(room_type_ids.len());
        for id in &room_type_ids {
            if let Some(rs) = self.get_room_type(id) {
                guards.push(rs.read_owned().await);
            }
        }
        let ledger = self.bindings.read().await;

        let mut events = Vec::new();
        for guard in &guards {
            let rt = &guard.room_type;
            events.push(Event::RoomTypeCreated {
                id: rt.id,
                name: rt.name.clone(),
                qty: rt.qty,
                price_per_night: rt.price_per_night,
                actor: None,
            });
            for claim in &guard.claims {
                events.push(Event::ClaimCommitted {
                    claim: claim.clone(),
                    actor: claim.created_by.clone(),
                });
            }
            if guard.retired {
                events.push(Event::RoomTypeRetired {
                    id: rt.id,
                    actor: None,
                });
            }
        }

        for guard in &guards {
            for claim in &guard.claims {
                for record in ledger.history(&claim.id) {
                    let stay = match record.is_open() {
                        true => ledger.open_stay(&claim.id).unwrap_or(claim.stay),
                        false => claim.stay,
                    };
                    events.push(Event::BindingRestored {
                        room_type_id: guard.room_type.id,
                        record: record.clone(),
                        stay,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("log compacted to {} room types", guards.len());
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
