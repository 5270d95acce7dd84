use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::busiest_night;
use super::conflict::{validate_context, validate_name};
use super::{Engine, EngineError};

/// Reservations holding a unit of `rs` on `night`.
fn holders_on(rs: &RoomTypeState, night: NaiveDate) -> Vec<Ulid> {
    let Some(next) = night.succ_opt() else {
        return Vec::new();
    };
    let window = Stay {
        check_in: night,
        check_out: next,
    };
    rs.overlapping(&window)
        .map(|c| c.id)
        .chain(rs.lodgers_overlapping(&window).map(|l| l.reservation_id))
        .collect()
}

fn validate_qty(qty: u32) -> Result<(), EngineError> {
    if qty == 0 {
        return Err(EngineError::Validation("qty must be positive"));
    }
    if qty > MAX_UNITS_PER_ROOM_TYPE {
        return Err(EngineError::LimitExceeded("too many units on room type"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_room_type(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        name: Option<String>,
        qty: u32,
        price_per_night: u64,
    ) -> Result<RoomType, EngineError> {
        validate_context(ctx)?;
        validate_name(name.as_deref())?;
        validate_qty(qty)?;
        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_ROOM_TYPES {
            return Err(EngineError::LimitExceeded("too many room types"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomTypeCreated {
            id,
            name: name.clone(),
            qty,
            price_per_night,
            actor: ctx.actor.clone(),
        };
        self.wal_append(&event).await?;
        let room_type = RoomType {
            id,
            name,
            qty,
            price_per_night,
        };
        self.state
            .insert(id, Arc::new(RwLock::new(RoomTypeState::new(room_type.clone()))));
        self.notify.send(id, &event);
        info!("room type {id} created with {qty} units");
        Ok(room_type)
    }

    /// Rename, reprice or resize a room type.
    ///
    /// Shrinking fails with `InventoryInUse` while any non-cancelled claim or lodger is
    /// bound to an index that would disappear, or while some night holds more units
    /// than the new `qty`. The caller reassigns or cancels first.
    pub async fn update_room_type(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        name: Option<String>,
        qty: u32,
        price_per_night: u64,
    ) -> Result<RoomType, EngineError> {
        validate_context(ctx)?;
        validate_name(name.as_deref())?;
        validate_qty(qty)?;
        let mut guard = self.room_type_write(&id).await?;

        if guard.highest_bound_index().is_some_and(|highest| highest >= qty) {
            let orphaned: Vec<Ulid> = guard
                .claims
                .iter()
                .filter(|c| c.status.holds_inventory())
                .filter(|c| c.assigned_unit.is_some_and(|u| u.index >= qty))
                .map(|c| c.id)
                .chain(
                    guard
                        .lodgers
                        .iter()
                        .filter(|l| l.unit_index.is_some_and(|index| index >= qty))
                        .map(|l| l.reservation_id),
                )
                .collect();
            if !orphaned.is_empty() {
                return Err(EngineError::InventoryInUse {
                    room_type_id: id,
                    claims: orphaned,
                });
            }
        }
        if let Some((night, load)) = busiest_night(&guard)
            && load > qty
        {
            return Err(EngineError::InventoryInUse {
                room_type_id: id,
                claims: holders_on(&guard, night),
            });
        }

        let event = Event::RoomTypeUpdated {
            id,
            name,
            qty,
            price_per_night,
            actor: ctx.actor.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.room_type.clone())
    }

    /// Stop selling a room type. Its claims are kept for history.
    pub async fn retire_room_type(&self, ctx: &RequestContext, id: Ulid) -> Result<(), EngineError> {
        validate_context(ctx)?;
        let mut guard = self.room_type_write(&id).await?;

        let live: Vec<Ulid> = guard
            .claims
            .iter()
            .filter(|c| c.status.is_live())
            .map(|c| c.id)
            .collect();
        let lodging: Vec<Ulid> = guard.lodgers.iter().map(|l| l.reservation_id).collect();
        if !live.is_empty() || !lodging.is_empty() {
            return Err(EngineError::InventoryInUse {
                room_type_id: id,
                claims: live.into_iter().chain(lodging).collect(),
            });
        }

        let event = Event::RoomTypeRetired {
            id,
            actor: ctx.actor.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.notify.remove(&id);
        info!("room type {id} retired");
        Ok(())
    }

    pub async fn unit_count(&self, room_type_id: Ulid) -> Result<u32, EngineError> {
        let guard = self.room_type_read(&room_type_id).await?;
        Ok(guard.room_type.qty)
    }

    pub async fn unit_ref(&self, room_type_id: Ulid, index: u32) -> Result<UnitRef, EngineError> {
        let guard = self.room_type_read(&room_type_id).await?;
        guard
            .room_type
            .unit(index)
            .ok_or_else(|| EngineError::NotFound {
                what: "unit",
                id: format!("{room_type_id}#{index}"),
            })
    }
}
