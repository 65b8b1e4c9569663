use ulid::Ulid;

use crate::model::ReservationStatus;

/// The booking error taxonomy. Everything here is recoverable at the API
/// boundary and surfaced to clients with a distinct code (see `wire.rs`).
#[derive(Debug)]
pub enum EngineError {
    /// end <= start, out-of-range timestamps, or an oversized span.
    InvalidInterval(&'static str),
    VehicleNotFound(Ulid),
    ReservationNotFound(Ulid),
    /// Disabled vehicle or non-positive daily rate.
    InvalidVehicleState(&'static str),
    /// Overlap with an active reservation. Recoverable — pick another slot.
    Conflict(Ulid),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            EngineError::VehicleNotFound(id) => write!(f, "vehicle not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::InvalidVehicleState(msg) => write!(f, "vehicle not bookable: {msg}"),
            EngineError::Conflict(id) => write!(f, "conflict with reservation: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "illegal status transition: {from} -> {to}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
