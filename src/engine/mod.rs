mod availability;
mod conflict;
mod error;
mod lifecycle;
mod pricing;
mod queries;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use pricing::{quote, rental_days, DAY_MS};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::events::EventSink;
use crate::model::*;
use crate::wal::Wal;

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

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
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
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

/// One agency's booking engine: the vehicle catalog, the reservation ledger
/// inside each vehicle's state, and the WAL that makes it durable.
pub struct Engine {
    pub vehicles: DashMap<Ulid, SharedVehicleState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub sink: Arc<dyn EventSink>,
    /// Reverse lookup: reservation id → vehicle id.
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a VehicleState (no locking — caller holds the
/// lock). Transitions arriving here were validated against the transition
/// table before the event was written, so application is unconditional; that
/// also makes WAL replay deterministic.
fn apply_to_vehicle(vs: &mut VehicleState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            id,
            vehicle_id,
            holder,
            span,
            total_price,
            created_at,
        } => {
            vs.insert_reservation(Reservation {
                id: *id,
                holder: holder.clone(),
                span: *span,
                total_price: *total_price,
                status: ReservationStatus::Pending,
                created_at: *created_at,
            });
            index.insert(*id, *vehicle_id);
        }
        Event::BookingConfirmed { id, .. } => {
            if let Some(r) = vs.reservation_mut(id) {
                r.status = ReservationStatus::Confirmed;
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(r) = vs.reservation_mut(id) {
                r.status = ReservationStatus::Cancelled;
            }
        }
        Event::BookingCompleted { id, .. } => {
            if let Some(r) = vs.reservation_mut(id) {
                r.status = ReservationStatus::Completed;
            }
        }
        // Pure audit record — the reservation stays pending.
        Event::PaymentFailed { .. } => {}
        Event::VehicleUpdated {
            name,
            rate_per_day,
            available,
            ..
        } => {
            vs.name = name.clone();
            vs.rate_per_day = *rate_per_day;
            vs.available = *available;
        }
        // VehicleAdded/Removed are handled at the DashMap level, not here
        Event::VehicleAdded { .. } | Event::VehicleRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, sink: Arc<dyn EventSink>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            vehicles: DashMap::new(),
            wal_tx,
            sink,
            reservation_index: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (lazy agency
        // creation).
        for event in &events {
            match event {
                Event::VehicleAdded {
                    id,
                    name,
                    rate_per_day,
                    available,
                } => {
                    let vs = VehicleState::new(*id, name.clone(), *rate_per_day, *available);
                    engine.vehicles.insert(*id, Arc::new(RwLock::new(vs)));
                }
                Event::VehicleRemoved { id } => {
                    if let Some((_, vs)) = engine.vehicles.remove(id) {
                        let guard = vs.try_read().expect("replay: uncontended read");
                        for r in &guard.reservations {
                            engine.reservation_index.remove(&r.id);
                        }
                    }
                }
                other => {
                    if let Some(vehicle_id) = event_vehicle_id(other)
                        && let Some(entry) = engine.vehicles.get(&vehicle_id) {
                            let vs = entry.value().clone();
                            let mut guard = vs.try_write().expect("replay: uncontended write");
                            apply_to_vehicle(&mut guard, other, &engine.reservation_index);
                        }
                }
            }
        }

        Ok(engine)
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

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    pub fn vehicle_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append + apply + publish in one call. The publish is fire-and-
    /// forget: by the time it runs, the ledger state is already committed.
    pub(super) async fn persist_and_apply(
        &self,
        vehicle_id: Ulid,
        vs: &mut VehicleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_vehicle(vs, event, &self.reservation_index);
        self.sink.publish(vehicle_id, event);
        Ok(())
    }

    /// Lookup reservation → vehicle, get vehicle, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<VehicleState>), EngineError> {
        let vehicle_id = self
            .vehicle_for_reservation(reservation_id)
            .ok_or(EngineError::ReservationNotFound(*reservation_id))?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.write_owned().await;
        Ok((vehicle_id, guard))
    }
}

/// Extract the vehicle_id from an event (for non-catalog events).
fn event_vehicle_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { vehicle_id, .. }
        | Event::BookingConfirmed { vehicle_id, .. }
        | Event::BookingCancelled { vehicle_id, .. }
        | Event::BookingCompleted { vehicle_id, .. }
        | Event::PaymentFailed { vehicle_id, .. } => Some(*vehicle_id),
        Event::VehicleUpdated { id, .. } => Some(*id),
        Event::VehicleAdded { .. } | Event::VehicleRemoved { .. } => None,
    }
}
