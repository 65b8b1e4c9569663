use rust_decimal::Decimal;

use crate::model::{Ms, Span};

use super::EngineError;

pub const DAY_MS: Ms = 86_400_000;

/// Calendar days spanned, rounded up, with a floor of one day. A 12-hour
/// rental still pays for a full day.
pub fn rental_days(span: &Span) -> i64 {
    let days = (span.duration_ms() + DAY_MS - 1) / DAY_MS;
    days.max(1)
}

/// Total price for renting at `rate_per_day` over `span`. Pure — the caller
/// validates the span; this only rejects unusable rates.
pub fn quote(rate_per_day: Decimal, span: &Span) -> Result<Decimal, EngineError> {
    if rate_per_day <= Decimal::ZERO {
        return Err(EngineError::InvalidVehicleState("non-positive daily rate"));
    }
    Ok(Decimal::from(rental_days(span)) * rate_per_day)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const DAY0: Ms = 1_700_000_000_000;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn half_day_charges_one_day() {
        let span = Span::new(DAY0, DAY0 + 12 * H);
        assert_eq!(rental_days(&span), 1);
        assert_eq!(quote(dec("50"), &span).unwrap(), dec("50"));
    }

    #[test]
    fn two_exact_days() {
        let span = Span::new(DAY0, DAY0 + 2 * DAY_MS);
        assert_eq!(rental_days(&span), 2);
        assert_eq!(quote(dec("50"), &span).unwrap(), dec("100"));
    }

    #[test]
    fn partial_extra_day_rounds_up() {
        let span = Span::new(DAY0, DAY0 + 2 * DAY_MS + 1);
        assert_eq!(rental_days(&span), 3);
        assert_eq!(quote(dec("30"), &span).unwrap(), dec("90"));
    }

    #[test]
    fn fractional_rate_is_exact() {
        let span = Span::new(DAY0, DAY0 + 3 * DAY_MS);
        assert_eq!(quote(dec("19.99"), &span).unwrap(), dec("59.97"));
    }

    #[test]
    fn zero_and_negative_rates_rejected() {
        let span = Span::new(DAY0, DAY0 + DAY_MS);
        assert!(matches!(
            quote(Decimal::ZERO, &span),
            Err(EngineError::InvalidVehicleState(_))
        ));
        assert!(matches!(
            quote(dec("-1"), &span),
            Err(EngineError::InvalidVehicleState(_))
        ));
    }
}
