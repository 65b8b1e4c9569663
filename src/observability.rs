use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "rentd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "rentd_query_duration_seconds";

/// Counter: reservations committed to a ledger.
pub const BOOKINGS_CREATED_TOTAL: &str = "rentd_bookings_created_total";

/// Counter: create attempts rejected because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "rentd_booking_conflicts_total";

/// Counter: payment callbacks applied. Labels: outcome.
pub const PAYMENT_OUTCOMES_TOTAL: &str = "rentd_payment_outcomes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rentd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rentd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rentd_connections_rejected_total";

/// Gauge: number of active agencies (loaded engines).
pub const AGENCIES_ACTIVE: &str = "rentd_agencies_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::UpdateVehicle { .. } => "update_vehicle",
        Command::DeleteVehicle { .. } => "delete_vehicle",
        Command::SelectVehicles => "select_vehicles",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservationStatus { .. } => "update_reservation_status",
        Command::SelectReservationsByVehicle { .. } => "select_reservations",
        Command::SelectReservationById { .. } => "select_reservation",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeSlots { .. } => "select_free_slots",
        Command::SelectQuote { .. } => "select_quote",
        Command::InsertPayment { .. } => "insert_payment",
        Command::SelectPaymentByReservation { .. } => "select_payment",
    }
}
