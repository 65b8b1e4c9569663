use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_windows;
use super::conflict::{check_no_conflict, validate_span};
use super::pricing::{quote, rental_days};
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_vehicles(&self) -> Vec<VehicleInfo> {
        // Clone the Arcs out first: a map guard must not be held across the
        // per-vehicle lock acquisition.
        let states: Vec<_> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for vs in states {
            let guard = vs.read().await;
            out.push(VehicleInfo {
                id: guard.id,
                name: guard.name.clone(),
                rate_per_day: guard.rate_per_day,
                available: guard.available,
            });
        }
        out
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Result<ReservationInfo, EngineError> {
        let vehicle_id = self
            .vehicle_for_reservation(id)
            .ok_or(EngineError::ReservationNotFound(*id))?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        let r = guard
            .reservation(id)
            .ok_or(EngineError::ReservationNotFound(*id))?;
        Ok(ReservationInfo::from_reservation(vehicle_id, r))
    }

    /// The busy list: active (pending/confirmed) reservations on a vehicle.
    /// Terminal rows stay in the ledger but don't block anything, so they
    /// aren't reported here.
    pub async fn active_reservations(
        &self,
        vehicle_id: Ulid,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(guard
            .reservations
            .iter()
            .filter(|r| r.status.is_active())
            .map(|r| ReservationInfo::from_reservation(vehicle_id, r))
            .collect())
    }

    /// Scheduling availability only: does any active reservation overlap the
    /// window? The kill-switch is deliberately not consulted — it gates
    /// booking, not the calendar.
    pub async fn is_available(&self, vehicle_id: Ulid, span: Span) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(check_no_conflict(&guard, &span).is_ok())
    }

    /// Free sub-windows of the query window, optionally dropping slivers
    /// shorter than `min_duration_ms`.
    pub async fn free_slots(
        &self,
        vehicle_id: Ulid,
        query_start: Ms,
        query_end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        if query_end <= query_start {
            return Err(EngineError::InvalidInterval("end must be after start"));
        }
        if query_end - query_start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;

        let query = Span::new(query_start, query_end);
        let mut free = free_windows(&guard, &query);
        if let Some(min_dur) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(free)
    }

    /// Price preview without touching the ledger.
    pub async fn quote_for(
        &self,
        vehicle_id: Ulid,
        span: Span,
    ) -> Result<(i64, Decimal), EngineError> {
        validate_span(&span)?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        let total = quote(guard.rate_per_day, &span)?;
        Ok((rental_days(&span), total))
    }
}
