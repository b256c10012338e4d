use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "visitd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "visitd_query_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: visit requests accepted as pending.
pub const VISITS_REQUESTED_TOTAL: &str = "visitd_visits_requested_total";

/// Counter: status transitions applied. Labels: status.
pub const VISIT_TRANSITIONS_TOTAL: &str = "visitd_visit_transitions_total";

/// Counter: requests or approvals refused for a clashing slot. Labels: stage.
pub const VISIT_CONFLICTS_TOTAL: &str = "visitd_visit_conflicts_total";

// ── Fair-rent recomputation ─────────────────────────────────────

/// Counter: recompute requests dropped on a full queue.
pub const RECOMPUTE_DROPPED_TOTAL: &str = "visitd_recompute_dropped_total";

/// Histogram: one apartment's recompute, in seconds.
pub const RECOMPUTE_DURATION_SECONDS: &str = "visitd_recompute_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "visitd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "visitd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "visitd_connections_rejected_total";

/// Counter: sessions whose user name is not a valid user id.
pub const AUTH_FAILURES_TOTAL: &str = "visitd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "visitd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "visitd_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None; a
/// failed install is logged and the server runs without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVisit { .. } => "insert_visit",
        Command::UpdateVisitStatus { .. } => "update_visit_status",
        Command::RejectPendingVisits { .. } => "reject_pending_visits",
        Command::SelectVisit { .. } => "select_visit",
        Command::SelectVisitsByRequester { .. } => "select_visits_by_requester",
        Command::SelectVisitsByController { .. } => "select_visits_by_controller",
        Command::SelectApprovedVisitsOnDate { .. } => "select_approved_visits_on_date",
        Command::InsertLocation { .. } => "insert_location",
        Command::InsertApartment { .. } => "insert_apartment",
        Command::UpdateApartment { .. } => "update_apartment",
        Command::InsertListing { .. } => "insert_listing",
        Command::UpdateListing { .. } => "update_listing",
        Command::SelectListings { .. } => "select_listings",
        Command::SelectApartments { .. } => "select_apartments",
        Command::SelectLocations => "select_locations",
        Command::SelectMetrics { .. } => "select_metrics",
    }
}
