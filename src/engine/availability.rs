use crate::model::*;

// ── Free-window computation ──────────────────────────────────────
//
// A vehicle is bookable everywhere inside the query window except where an
// active reservation sits. The kill-switch is a separate, non-scheduling
// concern checked at booking time.

/// Free sub-windows of `query`: the window minus the merged spans of active
/// reservations.
pub fn free_windows(vs: &VehicleState, query: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = vs
        .overlapping(query)
        .filter(|r| r.status.is_active())
        .map(|r| Span::new(r.span.start.max(query.start), r.span.end.min(query.end)))
        .collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    subtract_intervals(&[*query], &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn vehicle(reservations: Vec<Reservation>) -> VehicleState {
        let mut vs = VehicleState::new(Ulid::new(), None, Decimal::from(30), true);
        for r in reservations {
            vs.insert_reservation(r);
        }
        vs
    }

    fn resv(start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            holder: "h".into(),
            span: Span::new(start, end),
            total_price: Decimal::from(30),
            status,
            created_at: 0,
        }
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        let result = subtract_intervals(&base, &remove);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(200, 300)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(
            result,
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 300)]);
    }

    // ── free_windows ─────────────────────────────────────

    #[test]
    fn free_windows_empty_ledger() {
        let vs = vehicle(vec![]);
        let query = Span::new(0, 24 * H);
        assert_eq!(free_windows(&vs, &query), vec![query]);
    }

    #[test]
    fn free_windows_around_active_booking() {
        let vs = vehicle(vec![resv(10 * H, 12 * H, ReservationStatus::Confirmed)]);
        let query = Span::new(9 * H, 14 * H);
        assert_eq!(
            free_windows(&vs, &query),
            vec![Span::new(9 * H, 10 * H), Span::new(12 * H, 14 * H)]
        );
    }

    #[test]
    fn cancelled_and_completed_do_not_block() {
        let vs = vehicle(vec![
            resv(10 * H, 12 * H, ReservationStatus::Cancelled),
            resv(13 * H, 15 * H, ReservationStatus::Completed),
        ]);
        let query = Span::new(9 * H, 16 * H);
        assert_eq!(free_windows(&vs, &query), vec![query]);
    }

    #[test]
    fn free_windows_clamps_to_query() {
        // A booking sticking out on both sides blocks the whole window.
        let vs = vehicle(vec![resv(0, 100 * H, ReservationStatus::Pending)]);
        let query = Span::new(10 * H, 20 * H);
        assert!(free_windows(&vs, &query).is_empty());
    }

    #[test]
    fn free_windows_merges_touching_bookings() {
        let vs = vehicle(vec![
            resv(10 * H, 12 * H, ReservationStatus::Pending),
            resv(12 * H, 14 * H, ReservationStatus::Confirmed),
        ]);
        let query = Span::new(9 * H, 15 * H);
        assert_eq!(
            free_windows(&vs, &query),
            vec![Span::new(9 * H, 10 * H), Span::new(14 * H, 15 * H)]
        );
    }
}
