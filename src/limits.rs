//! Hard limits. Everything here is a guard against unbounded input,
//! not a tuning knob.

use crate::model::Ms;

pub const MAX_VEHICLES_PER_AGENCY: usize = 100_000;
pub const MAX_RESERVATIONS_PER_VEHICLE: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_HOLDER_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// One rental may span at most a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Widest window a free-slot / availability query may cover (2 years).
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 24 * 3_600_000;

pub const MAX_AGENCIES: usize = 256;
pub const MAX_AGENCY_NAME_LEN: usize = 256;
