use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.end <= span.start {
        return Err(EngineError::InvalidInterval("end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::InvalidInterval("span too wide"));
    }
    Ok(())
}

/// The one overlap check. Both the availability read and the create-booking
/// commit path go through here, so the predicate cannot drift between them.
/// Only active (pending/confirmed) reservations block the calendar.
pub(crate) fn check_no_conflict(vs: &VehicleState, span: &Span) -> Result<(), EngineError> {
    for r in vs.overlapping(span) {
        if r.status.is_active() && r.span.overlaps(span) {
            return Err(EngineError::Conflict(r.id));
        }
    }
    Ok(())
}
