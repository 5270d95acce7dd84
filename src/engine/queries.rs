use std::time::Instant;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{free_units, nightly_free_units, sold_out_spans};
use super::conflict::validate_window;
use super::{Engine, EngineError};

fn query_window(check_in: NaiveDate, check_out: NaiveDate) -> Result<Stay, EngineError> {
    let window = Stay::new(check_in, check_out)?;
    validate_window(&window)?;
    Ok(window)
}

fn validate_units(units: u32) -> Result<(), EngineError> {
    if units == 0 {
        return Err(EngineError::Validation("units requested must be positive"));
    }
    if units > MAX_UNITS_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many units requested"));
    }
    Ok(())
}

fn availability_of(rs: &RoomTypeState, window: &Stay, units: u32) -> Availability {
    let free = free_units(rs, window, None);
    Availability {
        room_type_id: rs.room_type.id,
        free_units: free,
        total_units: rs.room_type.qty,
        units_requested: units,
        fits: units <= free,
        quote: rs.room_type.quote(window, units),
    }
}

impl Engine {
    /// Free units of a room type over `[check_in, check_out)`: `qty` minus the peak
    /// number of claims held on any single night.
    ///
    /// Advisory only. The booking path re-checks under the write lock.
    pub async fn check_availability(
        &self,
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        units_requested: u32,
    ) -> Result<Availability, EngineError> {
        let started = Instant::now();
        let window = query_window(check_in, check_out)?;
        validate_units(units_requested)?;
        let guard = self.room_type_read(&room_type_id).await?;
        let availability = availability_of(&guard, &window, units_requested);
        metrics::histogram!(crate::observability::AVAILABILITY_QUERY_DURATION_SECONDS, "query" => "single")
            .record(started.elapsed().as_secs_f64());
        Ok(availability)
    }

    /// Free units as if `exclude` had never been booked. Used to preview amendments.
    pub async fn free_units_excluding(
        &self,
        room_type_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        exclude: Ulid,
    ) -> Result<u32, EngineError> {
        let window = query_window(check_in, check_out)?;
        let guard = self.room_type_read(&room_type_id).await?;
        Ok(free_units(&guard, &window, Some(exclude)))
    }

    /// One entry per night of `[from, to)`.
    pub async fn nightly_availability(
        &self,
        room_type_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NightlyAvailability>, EngineError> {
        let window = query_window(from, to)?;
        let guard = self.room_type_read(&room_type_id).await?;
        Ok(nightly_free_units(&guard, &window))
    }

    /// Maximal runs of nights in `[from, to)` with no free unit.
    pub async fn sold_out(
        &self,
        room_type_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Stay>, EngineError> {
        let window = query_window(from, to)?;
        let guard = self.room_type_read(&room_type_id).await?;
        Ok(sold_out_spans(&guard, &window))
    }

    /// Every active room type that can take `units_requested` over the stay, cheapest first.
    ///
    /// Locks are taken one room type at a time, so the result is not a single snapshot.
    pub async fn search_availability(
        &self,
        check_in: NaiveDate,
        check_out: NaiveDate,
        units_requested: u32,
    ) -> Result<Vec<Availability>, EngineError> {
        let started = Instant::now();
        let window = query_window(check_in, check_out)?;
        validate_units(units_requested)?;

        let room_types: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut results = Vec::new();
        for rs in room_types {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            let availability = availability_of(&guard, &window, units_requested);
            if availability.fits {
                results.push(availability);
            }
        }
        results.sort_by(|a, b| {
            a.quote
                .unwrap_or(u64::MAX)
                .cmp(&b.quote.unwrap_or(u64::MAX))
                .then_with(|| a.room_type_id.cmp(&b.room_type_id))
        });

        metrics::histogram!(crate::observability::AVAILABILITY_QUERY_DURATION_SECONDS, "query" => "search")
            .record(started.elapsed().as_secs_f64());
        Ok(results)
    }

    pub async fn get_reservation(&self, reservation_id: Ulid) -> Result<ReservationClaim, EngineError> {
        let guard = self.reservation_read(&reservation_id).await?;
        guard
            .claim(&reservation_id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(reservation_id))
    }

    /// Claims of a room type that still hold inventory, sorted by check-in.
    pub async fn active_claims(&self, room_type_id: Ulid) -> Result<Vec<ReservationClaim>, EngineError> {
        let guard = self.room_type_read(&room_type_id).await?;
        Ok(guard
            .claims
            .iter()
            .filter(|c| c.status.holds_inventory())
            .cloned()
            .collect())
    }

    /// Every claim ever made on a room type, cancelled ones included. Works on retired types.
    pub async fn reservations_of_type(&self, room_type_id: Ulid) -> Result<Vec<ReservationClaim>, EngineError> {
        let rs = self
            .get_room_type(&room_type_id)
            .ok_or_else(|| EngineError::room_type_not_found(room_type_id))?;
        let guard = rs.read().await;
        Ok(guard.claims.clone())
    }

    pub async fn room_type(&self, room_type_id: Ulid) -> Result<RoomType, EngineError> {
        let guard = self.room_type_read(&room_type_id).await?;
        Ok(guard.room_type.clone())
    }

    /// Active room types, ordered by id.
    pub async fn list_room_types(&self) -> Vec<RoomType> {
        let room_types: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(room_types.len());
        for rs in room_types {
            let guard = rs.read().await;
            if !guard.retired {
                out.push(guard.room_type.clone());
            }
        }
        out.sort_by_key(|rt| rt.id);
        out
    }
}
