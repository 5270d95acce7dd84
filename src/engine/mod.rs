mod assign;
mod availability;
mod checkin;
mod conflict;
mod error;
mod inventory;
mod mutations;
mod queries;
mod store;

pub use availability::{free_units, nightly_free_units, peak_load, sold_out_spans};
pub use error::EngineError;
pub use store::BindingLedger;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::directory::RoomDirectory;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomTypeState = Arc<RwLock<RoomTypeState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush the batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One hotel's inventory engine: room-type claim sets, check-in bindings, and
/// the write-ahead log they are rebuilt from.
pub struct Engine {
    pub state: DashMap<Ulid, SharedRoomTypeState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) directory: Arc<dyn RoomDirectory>,
    /// Reverse lookup: reservation id → room type id.
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// Acquired after a room-type lock, never before.
    pub(super) bindings: RwLock<BindingLedger>,
    /// Serializes room-type creation against log compaction.
    pub(super) catalog: Mutex<()>,
    replayed_events: usize,
}

/// Apply the claim side of an event to a room type (caller holds the lock).
fn apply_to_room_type(rs: &mut RoomTypeState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RoomTypeUpdated {
            name,
            qty,
            price_per_night,
            ..
        } => {
            rs.room_type.name = name.clone();
            rs.room_type.qty = *qty;
            rs.room_type.price_per_night = *price_per_night;
        }
        Event::RoomTypeRetired { .. } => rs.retired = true,
        Event::ClaimCommitted { claim, .. } => {
            rs.insert_claim(claim.clone());
            index.insert(claim.id, claim.room_type_id);
        }
        Event::ClaimAmended { claim, .. } => rs.replace_claim(claim.clone()),
        Event::ClaimCancelled { id, .. } => {
            if let Some(claim) = rs.claim_mut(id) {
                claim.status = ClaimStatus::Cancelled;
            }
        }
        Event::CheckedIn { binding, .. } => {
            if let Some(claim) = rs.claim_mut(&binding.reservation_id) {
                claim.status = ClaimStatus::CheckedIn;
            }
        }
        Event::CheckedOut { id, check_out, .. } => {
            if let Some(claim) = rs.claim_mut(id) {
                claim.status = ClaimStatus::CheckedOut;
                if *check_out > claim.stay.check_in {
                    claim.stay.check_out = *check_out;
                }
            }
        }
        // RoomTypeCreated is handled at the DashMap level; the rest only touch bindings.
        Event::RoomTypeCreated { .. } | Event::RoomChanged { .. } | Event::BindingRestored { .. } => {}
    }
}

/// What a binding event does to the lodgers of other room types. Computed from the
/// ledger before the event is applied to it.
#[derive(Debug, Default)]
pub(super) struct Lodging {
    /// Host type and reservation whose lodger entry ends.
    vacate: Option<(Ulid, Ulid)>,
    /// Host type and the lodger entry that starts.
    occupy: Option<(Ulid, Lodger)>,
}

impl Lodging {
    /// Host room types this event touches.
    fn hosts(&self) -> Vec<Ulid> {
        let mut hosts: Vec<Ulid> = self
            .vacate
            .iter()
            .map(|(host, _)| *host)
            .chain(self.occupy.iter().map(|(host, _)| *host))
            .collect();
        hosts.dedup();
        hosts
    }

    /// Apply the parts of this change that belong to `host`.
    fn apply_to(&self, host: &mut RoomTypeState) {
        if let Some((host_id, reservation_id)) = &self.vacate
            && *host_id == host.room_type.id
        {
            host.remove_lodger(reservation_id);
        }
        if let Some((host_id, lodger)) = &self.occupy
            && *host_id == host.room_type.id
        {
            host.add_lodger(lodger.clone());
        }
    }
}

/// Lodger changes implied by `event` for a reservation of type `rs`.
fn lodging_of(ledger: &BindingLedger, rs: &RoomTypeState, event: &Event) -> Lodging {
    let own = rs.room_type.id;
    let lodger = |binding: &CheckInBinding, stay: Stay| {
        (binding.room_type_id != own).then(|| {
            (
                binding.room_type_id,
                Lodger {
                    reservation_id: binding.reservation_id,
                    unit_index: binding.unit_index,
                    stay,
                },
            )
        })
    };
    let leaving = |reservation_id: &Ulid| {
        ledger
            .open_binding(reservation_id)
            .filter(|r| r.binding.room_type_id != own)
            .map(|r| (r.binding.room_type_id, *reservation_id))
    };

    match event {
        Event::CheckedIn { binding, .. } => Lodging {
            vacate: None,
            occupy: rs
                .claim(&binding.reservation_id)
                .and_then(|c| lodger(binding, c.stay)),
        },
        Event::RoomChanged { binding, .. } => {
            let reservation_id = binding.reservation_id;
            let stay = ledger
                .open_stay(&reservation_id)
                .or_else(|| rs.claim(&reservation_id).map(|c| c.stay));
            Lodging {
                vacate: leaving(&reservation_id),
                occupy: stay.and_then(|stay| lodger(binding, stay)),
            }
        }
        Event::CheckedOut {
            id,
            closed_binding_id: Some(_),
            ..
        } => Lodging {
            vacate: leaving(id),
            occupy: None,
        },
        Event::BindingRestored { record, stay, .. } if record.is_open() => Lodging {
            vacate: None,
            occupy: lodger(&record.binding, *stay),
        },
        _ => Lodging::default(),
    }
}

/// Write locks held across a binding change: the reservation's own room type and
/// every other type whose room it enters or leaves.
pub(super) struct BindingLocks {
    pub(super) own: OwnedRwLockWriteGuard<RoomTypeState>,
    pub(super) hosts: Vec<OwnedRwLockWriteGuard<RoomTypeState>>,
}

impl BindingLocks {
    pub(super) fn state_of(&self, room_type_id: Ulid) -> Option<&RoomTypeState> {
        if self.own.room_type.id == room_type_id {
            return Some(&*self.own);
        }
        self.hosts
            .iter()
            .find(|h| h.room_type.id == room_type_id)
            .map(|h| &**h)
    }
}

/// Apply the binding side of an event. `rs` has already seen the same event.
fn apply_to_bindings(ledger: &mut BindingLedger, rs: &RoomTypeState, event: &Event) {
    match event {
        Event::CheckedIn { binding, .. } => {
            if let Some(claim) = rs.claim(&binding.reservation_id) {
                ledger.bind(binding.clone(), claim.stay);
            }
        }
        Event::RoomChanged {
            closed_binding_id,
            reason,
            binding,
            ..
        } => {
            let reservation_id = binding.reservation_id;
            let stay = ledger
                .open_stay(&reservation_id)
                .or_else(|| rs.claim(&reservation_id).map(|c| c.stay));
            ledger.close(
                &reservation_id,
                closed_binding_id,
                BindingClosure {
                    at: binding.bound_at,
                    reason: CloseReason::RoomChange(reason.clone()),
                },
            );
            if let Some(stay) = stay {
                ledger.bind(binding.clone(), stay);
            }
        }
        Event::CheckedOut {
            id,
            at,
            closed_binding_id: Some(binding_id),
            ..
        } => {
            ledger.close(
                id,
                binding_id,
                BindingClosure {
                    at: *at,
                    reason: CloseReason::CheckedOut,
                },
            );
        }
        Event::BindingRestored { record, stay, .. } => ledger.restore(record.clone(), *stay),
        _ => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        directory: Arc<dyn RoomDirectory>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            directory,
            reservation_index: DashMap::new(),
            bindings: RwLock::new(BindingLedger::new()),
            catalog: Mutex::new(()),
            replayed_events: events.len(),
        };

        // We're the sole owner of every lock here, so get_mut / try_write never contend.
        // Never use blocking_write: this may run inside an async context (lazy hotel creation).
        let ledger = engine.bindings.get_mut();
        for event in &events {
            match event {
                Event::RoomTypeCreated {
                    id,
                    name,
                    qty,
                    price_per_night,
                    ..
                } => {
                    let rs = RoomTypeState::new(RoomType {
                        id: *id,
                        name: name.clone(),
                        qty: *qty,
                        price_per_night: *price_per_night,
                    });
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                other => {
                    let Some(entry) = engine.state.get(&other.room_type_id()) else {
                        continue;
                    };
                    let rs_arc = entry.clone();
                    drop(entry);
                    let Ok(mut guard) = rs_arc.try_write() else {
                        continue;
                    };
                    let lodging = lodging_of(ledger, &guard, other);
                    apply_to_room_type(&mut guard, other, &engine.reservation_index);
                    apply_to_bindings(ledger, &guard, other);
                    for host_id in lodging.hosts() {
                        let Some(host_arc) = engine.state.get(&host_id).map(|e| e.value().clone())
                        else {
                            continue;
                        };
                        if let Ok(mut host) = host_arc.try_write() {
                            lodging.apply_to(&mut host);
                        }
                    }
                }
            }
        }

        tracing::debug!("replayed {} events", engine.replayed_events);
        Ok(engine)
    }

    /// Number of log records replayed when the engine was opened.
    pub fn replayed_events(&self) -> usize {
        self.replayed_events
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room_type(&self, id: &Ulid) -> Option<SharedRoomTypeState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn room_type_of_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply + notify. State is only touched once the append succeeded.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomTypeState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room_type(rs, event, &self.reservation_index);
        self.notify.send(rs.room_type.id, event);
        Ok(())
    }

    /// Same as `persist_and_apply` for events that also touch check-in bindings.
    /// Lodger changes land on the host types held in `locks`; their subscribers
    /// see the event too.
    pub(super) async fn persist_and_apply_bound(
        &self,
        locks: &mut BindingLocks,
        ledger: &mut BindingLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let lodging = lodging_of(ledger, &locks.own, event);
        apply_to_room_type(&mut locks.own, event, &self.reservation_index);
        apply_to_bindings(ledger, &locks.own, event);
        for host in locks.hosts.iter_mut() {
            lodging.apply_to(host);
            self.notify.send(host.room_type.id, event);
        }
        self.notify.send(locks.own.room_type.id, event);
        Ok(())
    }

    /// Write-lock the reservation's room type together with `hosts`, in room type id
    /// order. Every path that holds more than one room-type lock takes them this way.
    pub(super) async fn lock_for_binding(
        &self,
        reservation_id: &Ulid,
        hosts: &[Ulid],
    ) -> Result<BindingLocks, EngineError> {
        let own_id = self
            .room_type_of_reservation(reservation_id)
            .ok_or_else(|| EngineError::reservation_not_found(*reservation_id))?;
        let mut ids: Vec<Ulid> = hosts.to_vec();
        ids.push(own_id);
        ids.sort();
        ids.dedup();

        let mut own = None;
        let mut locked = Vec::with_capacity(ids.len() - 1);
        for id in ids {
            let rs = self
                .get_room_type(&id)
                .ok_or_else(|| EngineError::room_type_not_found(id))?;
            let guard = rs.write_owned().await;
            if id == own_id {
                own = Some(guard);
            } else {
                locked.push(guard);
            }
        }
        let own = own.ok_or_else(|| EngineError::room_type_not_found(own_id))?;
        Ok(BindingLocks { own, hosts: locked })
    }

    /// Room type → write lock. Retired types are treated as gone.
    pub(super) async fn room_type_write(
        &self,
        room_type_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RoomTypeState>, EngineError> {
        let rs = self
            .get_room_type(room_type_id)
            .ok_or_else(|| EngineError::room_type_not_found(*room_type_id))?;
        let guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::room_type_not_found(*room_type_id));
        }
        Ok(guard)
    }

    /// Room type → read lock. Retired types are treated as gone.
    pub(super) async fn room_type_read(
        &self,
        room_type_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<RoomTypeState>, EngineError> {
        let rs = self
            .get_room_type(room_type_id)
            .ok_or_else(|| EngineError::room_type_not_found(*room_type_id))?;
        let guard = rs.read_owned().await;
        if guard.retired {
            return Err(EngineError::room_type_not_found(*room_type_id));
        }
        Ok(guard)
    }

    /// Reservation → owning room type → write lock. Works on retired types so
    /// in-house guests can still check out.
    pub(super) async fn reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RoomTypeState>, EngineError> {
        let room_type_id = self
            .room_type_of_reservation(reservation_id)
            .ok_or_else(|| EngineError::reservation_not_found(*reservation_id))?;
        let rs = self
            .get_room_type(&room_type_id)
            .ok_or_else(|| EngineError::room_type_not_found(room_type_id))?;
        Ok(rs.write_owned().await)
    }

    pub(super) async fn reservation_read(
        &self,
        reservation_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<RoomTypeState>, EngineError> {
        let room_type_id = self
            .room_type_of_reservation(reservation_id)
            .ok_or_else(|| EngineError::reservation_not_found(*reservation_id))?;
        let rs = self
            .get_room_type(&room_type_id)
            .ok_or_else(|| EngineError::room_type_not_found(room_type_id))?;
        Ok(rs.read_owned().await)
    }
}
