use std::net::SocketAddr;

use crate::command::Command;

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: schedule reconciliations. Labels: path.
pub const RECONCILIATIONS_TOTAL: &str = "tutorsched_reconciliations_total";

/// Counter: sessions materialized from recurrence rules.
pub const SESSIONS_GENERATED_TOTAL: &str = "tutorsched_sessions_generated_total";

/// Counter: reconciliations rejected because of conflicting individual sessions.
pub const SCHEDULE_CONFLICTS_TOTAL: &str = "tutorsched_schedule_conflicts_total";

/// Histogram: time spent generating + validating candidates, in seconds.
pub const GENERATION_DURATION_SECONDS: &str = "tutorsched_generation_duration_seconds";

// ── Commands ────────────────────────────────────────────────────

/// Counter: commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "tutorsched_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "tutorsched_command_duration_seconds";

// ── Storage ─────────────────────────────────────────────────────

/// Gauge: courses with an open engine.
pub const COURSES_OPEN: &str = "tutorsched_courses_open";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "tutorsched_journal_flush_duration_seconds";

/// Histogram: transactions per journal flush.
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "tutorsched_journal_flush_batch_size";

/// Counter: journal compactions.
pub const COMPACTIONS_TOTAL: &str = "tutorsched_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::ConfigureCourse { .. } => "configure_course",
        Command::CreateGroup { .. } => "create_group",
        Command::DeleteGroup { .. } => "delete_group",
        Command::SetSchedule { .. } => "set_schedule",
        Command::PreviewSchedule { .. } => "preview_schedule",
        Command::AddFreePeriod { .. } => "add_free_period",
        Command::RemoveFreePeriod { .. } => "remove_free_period",
        Command::CreateSession { .. } => "create_session",
        Command::UpdateSession { .. } => "update_session",
        Command::DeleteSession { .. } => "delete_session",
        Command::CancelSession { .. } => "cancel_session",
        Command::ActivateSession { .. } => "activate_session",
        Command::RecordAttendance { .. } => "record_attendance",
        Command::ListGroups { .. } => "list_groups",
        Command::ListSessions { .. } => "list_sessions",
        Command::ListFreePeriods { .. } => "list_free_periods",
        Command::ImportGroups { .. } => "import_groups",
    }
}
