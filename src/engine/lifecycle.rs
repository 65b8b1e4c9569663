use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::pricing::quote;
use super::{Engine, EngineError, WalCommand};

fn guard_transition(from: ReservationStatus, to: ReservationStatus) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

impl Engine {
    // ── Vehicle catalog (admin-driven) ───────────────────────

    pub async fn add_vehicle(
        &self,
        id: Ulid,
        name: Option<String>,
        rate_per_day: Decimal,
        available: bool,
    ) -> Result<(), EngineError> {
        if self.vehicles.len() >= MAX_VEHICLES_PER_AGENCY {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("vehicle name too long"));
            }
        if rate_per_day <= Decimal::ZERO {
            return Err(EngineError::InvalidVehicleState("non-positive daily rate"));
        }
        if self.vehicles.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VehicleAdded {
            id,
            name: name.clone(),
            rate_per_day,
            available,
        };
        self.wal_append(&event).await?;
        let vs = VehicleState::new(id, name, rate_per_day, available);
        self.vehicles.insert(id, Arc::new(RwLock::new(vs)));
        self.sink.publish(id, &event);
        Ok(())
    }

    /// Admin edit: rename, reprice, or flip the kill-switch. `None` fields
    /// keep their current value; `name` uses a nested Option so NULL can
    /// clear it. Existing reservations keep the price they were quoted.
    pub async fn update_vehicle(
        &self,
        id: Ulid,
        name: Option<Option<String>>,
        rate_per_day: Option<Decimal>,
        available: Option<bool>,
    ) -> Result<(), EngineError> {
        let vs = self
            .get_vehicle(&id)
            .ok_or(EngineError::VehicleNotFound(id))?;
        let mut guard = vs.write().await;

        let name = match name {
            Some(n) => n,
            None => guard.name.clone(),
        };
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("vehicle name too long"));
            }
        let rate_per_day = rate_per_day.unwrap_or(guard.rate_per_day);
        if rate_per_day <= Decimal::ZERO {
            return Err(EngineError::InvalidVehicleState("non-positive daily rate"));
        }
        let available = available.unwrap_or(guard.available);

        let event = Event::VehicleUpdated {
            id,
            name,
            rate_per_day,
            available,
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Administrative override. Discards the vehicle's ledger with it — not
    /// part of the normal flow, where cancellation is a status.
    pub async fn remove_vehicle(&self, id: Ulid) -> Result<(), EngineError> {
        let vs = self
            .get_vehicle(&id)
            .ok_or(EngineError::VehicleNotFound(id))?;
        let guard = vs.read().await;
        let reservation_ids: Vec<Ulid> = guard.reservations.iter().map(|r| r.id).collect();
        drop(guard);

        let event = Event::VehicleRemoved { id };
        self.wal_append(&event).await?;
        self.vehicles.remove(&id);
        for rid in reservation_ids {
            self.reservation_index.remove(&rid);
        }
        self.sink.publish(id, &event);
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────────

    /// The create-booking critical section. The vehicle write lock is held
    /// from the conflict check through the commit, so two concurrent
    /// overlapping requests on one vehicle cannot both succeed. A failed WAL
    /// write rolls the insert back; nothing partial survives.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        holder: String,
        span: Span,
    ) -> Result<ReservationInfo, EngineError> {
        validate_span(&span)?;
        if holder.is_empty() || holder.len() > MAX_HOLDER_LEN {
            return Err(EngineError::LimitExceeded("bad holder"));
        }
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let mut guard = vs.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many reservations on vehicle"));
        }
        if self.reservation_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !guard.available {
            return Err(EngineError::InvalidVehicleState("vehicle disabled"));
        }

        let total_price = quote(guard.rate_per_day, &span)?;

        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let created_at = now_ms();
        let event = Event::BookingCreated {
            id,
            vehicle_id,
            holder: holder.clone(),
            span,
            total_price,
            created_at,
        };
        // Creates apply to memory before the WAL, unlike transitions: the
        // conflict check runs against memory, so the WAL must never hold a
        // create that memory does not — two creates that never coexisted in
        // memory could otherwise overlap on replay.
        super::apply_to_vehicle(&mut guard, &event, &self.reservation_index);
        if let Err(e) = self.wal_append(&event).await {
            guard.reservations.retain(|r| r.id != id);
            self.reservation_index.remove(&id);
            return Err(e);
        }
        self.sink.publish(vehicle_id, &event);
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);

        Ok(ReservationInfo {
            id,
            vehicle_id,
            holder,
            start: span.start,
            end: span.end,
            total_price,
            status: ReservationStatus::Pending,
            created_at,
        })
    }

    /// Pending → Confirmed, driven by a successful payment. Idempotent:
    /// payment callbacks may be delivered more than once, so a reservation
    /// that is already confirmed is a no-op, not an error.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let (vehicle_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let status = guard
            .reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?
            .status;
        if status == ReservationStatus::Confirmed {
            return Ok(());
        }
        guard_transition(status, ReservationStatus::Confirmed)?;

        let event = Event::BookingConfirmed { id, vehicle_id };
        self.persist_and_apply(vehicle_id, &mut guard, &event).await
    }

    /// Pending or Confirmed → Cancelled. Frees the interval; the ledger row
    /// stays for audit.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let (vehicle_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let status = guard
            .reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?
            .status;
        guard_transition(status, ReservationStatus::Cancelled)?;

        let event = Event::BookingCancelled { id, vehicle_id };
        self.persist_and_apply(vehicle_id, &mut guard, &event).await
    }

    /// Confirmed → Completed. Administrative — the rental came back.
    pub async fn complete_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let (vehicle_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let status = guard
            .reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?
            .status;
        guard_transition(status, ReservationStatus::Completed)?;

        let event = Event::BookingCompleted { id, vehicle_id };
        self.persist_and_apply(vehicle_id, &mut guard, &event).await
    }

    /// Payment failed: the reservation stays pending — a retry flow or a
    /// human decides whether to cancel. Emits the audit event. Late or
    /// duplicate callbacks on a reservation that already moved on are
    /// ignored, same contract as `confirm_reservation`.
    pub async fn mark_payment_failed(&self, id: Ulid) -> Result<(), EngineError> {
        let (vehicle_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let status = guard
            .reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?
            .status;
        if status != ReservationStatus::Pending {
            tracing::debug!("payment-failed callback for {id} in state {status}, ignoring");
            return Ok(());
        }

        let event = Event::PaymentFailed { id, vehicle_id };
        self.persist_and_apply(vehicle_id, &mut guard, &event).await
    }

    /// Pending reservations older than `ttl` — candidates for the expirer.
    pub fn collect_expired_pending(&self, now: Ms, ttl: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.vehicles.iter() {
            let vs = entry.value().clone();
            if let Ok(guard) = vs.try_read() {
                for r in &guard.reservations {
                    if r.status == ReservationStatus::Pending && r.created_at + ttl <= now {
                        expired.push((r.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Terminal reservations stay — cancellation
    /// is history, not garbage.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let vehicle_ids: Vec<Ulid> = self.vehicles.iter().map(|e| *e.key()).collect();
        for id in vehicle_ids {
            let vs = match self.vehicles.get(&id) {
                Some(e) => e.value().clone(),
                None => continue,
            };
            let guard = vs.read().await;

            events.push(Event::VehicleAdded {
                id: guard.id,
                name: guard.name.clone(),
                rate_per_day: guard.rate_per_day,
                available: guard.available,
            });

            for r in &guard.reservations {
                events.push(Event::BookingCreated {
                    id: r.id,
                    vehicle_id: guard.id,
                    holder: r.holder.clone(),
                    span: r.span,
                    total_price: r.total_price,
                    created_at: r.created_at,
                });
                match r.status {
                    ReservationStatus::Pending => {}
                    ReservationStatus::Confirmed => {
                        events.push(Event::BookingConfirmed { id: r.id, vehicle_id: guard.id });
                    }
                    ReservationStatus::Cancelled => {
                        events.push(Event::BookingCancelled { id: r.id, vehicle_id: guard.id });
                    }
                    ReservationStatus::Completed => {
                        events.push(Event::BookingConfirmed { id: r.id, vehicle_id: guard.id });
                        events.push(Event::BookingCompleted { id: r.id, vehicle_id: guard.id });
                    }
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
            .map_err(|e| EngineError::WalError(e.to_string()))
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
