use std::net::SocketAddr;

use crate::model::Event;

// ── Transition metrics ──────────────────────────────────────────

/// Counter: committed WAL events. Labels: event.
pub const TRANSITIONS_TOTAL: &str = "safarid_transitions_total";

/// Counter: allocation attempts refused over a held or unusable resource.
/// Labels: kind.
pub const ALLOCATION_CONFLICTS_TOTAL: &str = "safarid_allocation_conflicts_total";

/// Counter: processed payment attempts. Labels: outcome.
pub const PAYMENTS_TOTAL: &str = "safarid_payments_total";

/// Counter: bookings moved to EXPIRED.
pub const BOOKINGS_EXPIRED_TOTAL: &str = "safarid_bookings_expired_total";

/// Counter: notifications the notifier refused.
pub const NOTIFY_FAILURES_TOTAL: &str = "safarid_notify_failures_total";

// ── Sweeper ─────────────────────────────────────────────────────

/// Counter: sweeper steps that returned an error. Labels: task.
pub const SWEEP_ERRORS_TOTAL: &str = "safarid_sweep_errors_total";

/// Counter: reminders sent. Labels: kind.
pub const REMINDERS_SENT_TOTAL: &str = "safarid_reminders_sent_total";

/// Gauge: bookings per status at the last report. Labels: status.
pub const BOOKINGS_BY_STATUS: &str = "safarid_bookings_by_status";

/// Gauge: ACTIVE allocations at the last report.
pub const ACTIVE_ALLOCATIONS: &str = "safarid_active_allocations";

/// Gauge: SUCCESS payments at the last report.
pub const SUCCESSFUL_PAYMENTS: &str = "safarid_successful_payments";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "safarid_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "safarid_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "safarid_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the daemon carries on without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map an Event variant to a short label for metrics.
pub fn event_label(event: &Event) -> &'static str {
    match event {
        Event::ResourceRegistered { .. } => "resource_registered",
        Event::JeepStatusChanged { .. } => "jeep_status_changed",
        Event::DefaultDriverSet { .. } => "default_driver_set",
        Event::BookingCreated { .. } => "booking_created",
        Event::BookingEdited { .. } => "booking_edited",
        Event::BookingStatusChanged { .. } => "booking_status_changed",
        Event::BookingWindowsChanged { .. } => "booking_windows_changed",
        Event::BookingCancelled { .. } => "booking_cancelled",
        Event::AllocationCreated { .. } => "allocation_created",
        Event::AllocationUpdated { .. } => "allocation_updated",
        Event::AllocationCancelled { .. } => "allocation_cancelled",
        Event::PaymentRecorded { .. } => "payment_recorded",
        Event::BookingExpired { .. } => "booking_expired",
        Event::BookingSnapshot { .. } => "booking_snapshot",
    }
}
