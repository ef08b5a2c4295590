use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "agenda_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "agenda_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "agenda_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "agenda_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "agenda_connections_rejected_total";

/// Gauge: number of loaded businesses (tenants).
pub const TENANTS_ACTIVE: &str = "agenda_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "agenda_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "agenda_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "agenda_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "agenda_wal_compactions_total";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (booked, conflict, rejected).
pub const BOOKINGS_TOTAL: &str = "agenda_bookings_total";

/// Counter: conflicts found by the pre-commit check or the store backstop.
/// Labels: source (check, store).
pub const CONFLICTS_TOTAL: &str = "agenda_conflicts_total";

/// Counter: committed status changes. Labels: to.
pub const STATUS_CHANGES_TOTAL: &str = "agenda_status_changes_total";

/// Counter: side effects that failed after a committed status change. Labels: kind.
pub const SIDE_EFFECT_FAILURES_TOTAL: &str = "agenda_side_effect_failures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertService { .. } => "insert_service",
        Command::InsertClient { .. } => "insert_client",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::UpdateStatus { .. } => "update_status",
        Command::UpdateAppointment(_) => "update_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectSlots(_) => "select_slots",
        Command::SelectAppointmentsOn { .. } => "select_appointments_on",
        Command::SelectClientAppointments { .. } => "select_client_appointments",
        Command::SelectLoyalty { .. } => "select_loyalty",
        Command::SelectTransactions { .. } => "select_transactions",
        Command::SelectServices => "select_services",
    }
}
