/// Attempts the admission path makes before surfacing `Conflict`.
pub const MAX_ADMISSION_ATTEMPTS: usize = 3;

/// Chargeable time is rounded up to this unit.
pub const CHARGE_UNIT_MINUTES: i64 = 30;

/// An actual-time override longer than this is rejected.
pub const MAX_ADJUSTMENT_SPAN_MINUTES: i64 = 24 * 60;

pub const MAX_REASON_DETAIL_LEN: usize = 500;

/// Hour at which the business day rolls over (06:00 KST).
pub const BUSINESS_DAY_START_HOUR: u8 = 6;

/// Largest display hour a point in time can carry (05:xx of the next civil day).
pub const MAX_DISPLAY_HOUR: u8 = 29;

/// Exclusive slot end at the business-day boundary (06:00 of the next civil day).
pub const MAX_SLOT_END_HOUR: u8 = 30;

/// Pending dates buffered for the schedule synchronizer.
pub const SYNC_QUEUE_CAPACITY: usize = 1024;

/// Group-commit channel depth for the WAL writer.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;

/// Attempts per queued sync of one date before it is dropped with an error log.
pub const MAX_SYNC_ATTEMPTS: u32 = 5;

/// Compare-and-swap attempts a cancellation makes before reporting the conflict.
pub const MAX_CANCEL_ATTEMPTS: usize = 3;
