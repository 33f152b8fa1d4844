//! Metric names. The library only records through the `metrics` facade; the
//! host process decides whether and where to export.

// ── Admission ───────────────────────────────────────────────────

/// Counter: admission attempts. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "slotlock_admissions_total";

/// Histogram: end-to-end admission latency in seconds.
pub const ADMISSION_DURATION_SECONDS: &str = "slotlock_admission_duration_seconds";

// ── Lifecycle ───────────────────────────────────────────────────

/// Counter: successful cancellations.
pub const CANCELLATIONS_TOTAL: &str = "slotlock_cancellations_total";

/// Counter: status transitions applied. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "slotlock_status_transitions_total";

/// Counter: time adjustments. Labels: outcome.
pub const TIME_ADJUSTMENTS_TOTAL: &str = "slotlock_time_adjustments_total";

// ── Schedule sync ───────────────────────────────────────────────

/// Counter: per-(date, type) sync results. Labels: outcome.
pub const SCHEDULE_SYNC_TOTAL: &str = "slotlock_schedule_sync_total";

/// Gauge: dates waiting in the sync queue.
pub const SCHEDULE_SYNC_QUEUE_DEPTH: &str = "slotlock_schedule_sync_queue_depth";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotlock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotlock_wal_flush_batch_size";
