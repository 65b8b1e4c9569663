use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Reservation lifecycle state.
///
/// Pending → Confirmed → Completed, Pending/Confirmed → Cancelled.
/// Cancelled and Completed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    /// The full transition table. Anything not listed here is illegal.
    pub fn can_transition_to(self, to: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }

    /// Active reservations block the vehicle's calendar.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" => Some(ReservationStatus::Cancelled),
            "completed" => Some(ReservationStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a vehicle's reservation ledger. The interval and price are
/// fixed at creation; only `status` moves, and only forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub holder: String,
    pub span: Span,
    pub total_price: Decimal,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct VehicleState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Daily rate, strictly positive.
    pub rate_per_day: Decimal,
    /// Manual kill-switch. A disabled vehicle keeps its ledger but takes no
    /// new reservations.
    pub available: bool,
    /// Full ledger (all statuses), sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl VehicleState {
    pub fn new(id: Ulid, name: Option<String>, rate_per_day: Decimal, available: bool) -> Self {
        Self {
            id,
            name,
            rate_per_day,
            available,
            reservations: Vec::new(),
        }
    }

    /// Insert keeping the ledger sorted by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| &r.id == id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| &r.id == id)
    }

    /// Reservations whose span overlaps the query window, any status.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is both the WAL record format and
/// what the event sink receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleAdded {
        id: Ulid,
        name: Option<String>,
        rate_per_day: Decimal,
        available: bool,
    },
    VehicleUpdated {
        id: Ulid,
        name: Option<String>,
        rate_per_day: Decimal,
        available: bool,
    },
    VehicleRemoved {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        vehicle_id: Ulid,
        holder: String,
        span: Span,
        total_price: Decimal,
        created_at: Ms,
    },
    BookingConfirmed {
        id: Ulid,
        vehicle_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        vehicle_id: Ulid,
    },
    BookingCompleted {
        id: Ulid,
        vehicle_id: Ulid,
    },
    /// Audit record: the payment for a pending reservation failed. The
    /// reservation stays pending; a retry or a human decides what happens.
    PaymentFailed {
        id: Ulid,
        vehicle_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub rate_per_day: Decimal,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub holder: String,
    pub start: Ms,
    pub end: Ms,
    pub total_price: Decimal,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

impl ReservationInfo {
    pub fn from_reservation(vehicle_id: Ulid, r: &Reservation) -> Self {
        Self {
            id: r.id,
            vehicle_id,
            holder: r.holder.clone(),
            start: r.span.start,
            end: r.span.end,
            total_price: r.total_price,
            status: r.status,
            created_at: r.created_at,
        }
    }
}
