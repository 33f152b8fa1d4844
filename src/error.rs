use ulid::Ulid;

use crate::kst::BusinessDate;
use crate::model::{CreditOption, DeviceId, DeviceTypeId, ReservationId, ReservationStatus};

/// Failures surfaced by the repository layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Connection loss, WAL failure, timeout inside the store. Retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict { id: Ulid, expected: u64, actual: u64 },
    #[error("conflict with reservation {existing}")]
    Conflict { existing: ReservationId },
    #[error("rental limit reached: {current} of {cap} active")]
    RentalLimit { current: u32, cap: u32 },
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// Lock acquisition missed its deadline; nothing was written.
    #[error("lock acquisition timed out")]
    LockTimeout,
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_)
                | Self::VersionConflict { .. }
                | Self::Conflict { .. }
                | Self::LockTimeout
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("no rate for device type {device_type} with credit option {credit_option}")]
    NoRate {
        device_type: DeviceTypeId,
        credit_option: CreditOption,
    },
    #[error("pricing unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("slot unavailable")]
    Conflict,
    #[error("rental limit exceeded: {current} active + {requested} requested > cap {cap}")]
    RentalLimitExceeded { current: u32, requested: u32, cap: u32 },
    #[error("invalid slot: {0}")]
    InvalidSlot(String),
    #[error("no device of this type can serve the slot")]
    DeviceTypeExhausted,
    #[error("admission timed out")]
    Timeout,
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
    #[error("unknown device type: {0}")]
    UnknownDeviceType(DeviceTypeId),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => AdmissionError::Conflict,
            StoreError::RentalLimit { current, cap } => AdmissionError::RentalLimitExceeded {
                current,
                requested: 1,
                cap,
            },
            StoreError::LockTimeout => AdmissionError::Timeout,
            other => AdmissionError::Store(other),
        }
    }
}

impl AdmissionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict | Self::RentalLimitExceeded { .. } | Self::Timeout => true,
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Short label for metrics.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::RentalLimitExceeded { .. } => "rental_limit",
            Self::InvalidSlot(_) => "invalid_slot",
            Self::DeviceTypeExhausted => "exhausted",
            Self::Timeout => "timeout",
            Self::UnknownDevice(_) | Self::UnknownDeviceType(_) => "unknown_device",
            Self::Pricing(_) => "pricing_error",
            Self::Store(_) => "store_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdjustError {
    #[error("reservation not found: {0}")]
    NotFound(ReservationId),
    #[error("reservation in status {0} cannot be adjusted")]
    InvalidStatus(ReservationStatus),
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),
    #[error("invalid reason: {0}")]
    InvalidReason(String),
    #[error("reservation {0} changed concurrently; reload and retry")]
    VersionConflict(ReservationId),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AdjustError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AdjustError::NotFound(id),
            StoreError::VersionConflict { id, .. } => AdjustError::VersionConflict(id),
            other => AdjustError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("reservation not found: {0}")]
    NotFound(ReservationId),
    #[error("reservation {0} belongs to another user")]
    NotOwner(ReservationId),
    #[error("cannot move reservation from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("reservation {0} changed concurrently; reload and retry")]
    VersionConflict(ReservationId),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => LifecycleError::NotFound(id),
            StoreError::VersionConflict { id, .. } => LifecycleError::VersionConflict(id),
            other => LifecycleError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// More than one auto-generated event for one `(date, type)`. Never guessed at.
    #[error("{count} auto-generated {event_type} events on {date}")]
    Invariant {
        date: BusinessDate,
        event_type: String,
        count: usize,
    },
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}
