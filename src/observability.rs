use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "equiploan_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "equiploan_query_duration_seconds";

// ── Borrowing ───────────────────────────────────────────────────

/// Counter: loans accepted by the borrowing policy.
pub const LOANS_CREATED_TOTAL: &str = "equiploan_loans_created_total";

/// Counter: loan requests refused. Labels: reason.
pub const LOANS_REJECTED_TOTAL: &str = "equiploan_loans_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "equiploan_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "equiploan_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "equiploan_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "equiploan_tenants_active";

/// Counter: sessions refused (unknown or deactivated member).
pub const AUTH_FAILURES_TOTAL: &str = "equiploan_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "equiploan_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "equiploan_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "equiploan_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
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
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::SetUserStatus { .. } => "set_user_status",
        Command::DeleteUser { .. } => "delete_user",
        Command::SelectUsers { .. } => "select_users",
        Command::SelectProfile => "select_profile",
        Command::InsertEquipment { .. } => "insert_equipment",
        Command::SetEquipmentStatus { .. } => "set_equipment_status",
        Command::DeleteEquipment { .. } => "delete_equipment",
        Command::SelectEquipment { .. } => "select_equipment",
        Command::InsertLoan { .. } => "insert_loan",
        Command::DeleteLoan { .. } => "delete_loan",
        Command::SelectLoans { .. } => "select_loans",
    }
}
