//! Repository seams. The core only talks to these traits; `LocalStore` is the
//! WAL-backed implementation shipped with the crate.

mod catalog;
mod local;
mod pricing;
pub mod wal;

pub use catalog::{DeviceInfo, DeviceTypeInfo, StaticCatalog};
pub use local::LocalStore;
pub use pricing::HourlyRateTable;

use async_trait::async_trait;
use tokio::time::Instant;
use ulid::Ulid;

use crate::error::{PricingError, StoreError};
use crate::kst::BusinessDate;
use crate::model::*;
use crate::rental_limit::RentalCap;

#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn find_by_id(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError>;

    async fn find_active_by_device_and_date(
        &self,
        device_id: DeviceId,
        date: BusinessDate,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Active reservations of `user_id` for a device type dated `from` or later.
    async fn find_active_by_user_and_type(
        &self,
        user_id: UserId,
        device_type_id: DeviceTypeId,
        from: BusinessDate,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn find_active_by_date(&self, date: BusinessDate) -> Result<Vec<Reservation>, StoreError>;

    /// Atomically insert `reservation` unless an active reservation on the
    /// same device and date overlaps it, or `cap` is already reached.
    ///
    /// The store assigns `version = 1`. Lock waits are bounded by `deadline`;
    /// on expiry nothing is written and `StoreError::LockTimeout` is returned.
    async fn insert_if_no_conflict(
        &self,
        reservation: Reservation,
        cap: Option<RentalCap>,
        deadline: Instant,
    ) -> Result<Reservation, StoreError>;

    /// Compare-and-swap write. Succeeds only if the stored version equals
    /// `expected_version`; the stored copy comes back with the version bumped.
    async fn update_with_version(
        &self,
        reservation: Reservation,
        expected_version: u64,
    ) -> Result<Reservation, StoreError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn find_auto_events(
        &self,
        date: BusinessDate,
        event_type: &ScheduleEventType,
    ) -> Result<Vec<ScheduleEvent>, StoreError>;

    async fn find_manual_event(
        &self,
        date: BusinessDate,
        event_type: &ScheduleEventType,
    ) -> Result<Option<ScheduleEvent>, StoreError>;

    /// Insert or replace by id. Rejects events that are not auto-generated.
    async fn upsert_auto_event(&self, event: ScheduleEvent) -> Result<(), StoreError>;

    /// Deletes only auto-generated events; a manual id is `NotFound`.
    async fn delete_auto_event(&self, id: Ulid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: TimeAdjustmentRecord) -> Result<(), StoreError>;

    async fn find_by_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Vec<TimeAdjustmentRecord>, StoreError>;
}

/// External price source.
#[async_trait]
pub trait PricingLookup: Send + Sync {
    async fn price_for(
        &self,
        device_type_id: DeviceTypeId,
        credit_option: CreditOption,
        minutes: i64,
    ) -> Result<Won, PricingError>;
}

/// Devices and device types known to the shop.
#[async_trait]
pub trait DeviceCatalog: Send + Sync {
    async fn device(&self, id: DeviceId) -> Result<Option<DeviceInfo>, StoreError>;

    async fn device_type(&self, id: DeviceTypeId) -> Result<Option<DeviceTypeInfo>, StoreError>;

    /// Rentable devices of a type, in a stable order.
    async fn devices_of_type(&self, id: DeviceTypeId) -> Result<Vec<DeviceInfo>, StoreError>;
}
