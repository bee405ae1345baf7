use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "medslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "medslot_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (booked, conflict, not_found, ...).
pub const BOOKINGS_TOTAL: &str = "medslot_bookings_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "medslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "medslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "medslot_connections_rejected_total";

/// Gauge: number of loaded clinic engines.
pub const TENANTS_ACTIVE: &str = "medslot_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "medslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "medslot_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(io::Error::other)?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertDoctor { .. } => "insert_doctor",
        Command::InsertPatient { .. } => "insert_patient",
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::UpdateSchedule { .. } => "update_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectDoctors => "select_doctors",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::SelectAppointments { .. } => "select_appointments",
    }
}
