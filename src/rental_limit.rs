use std::sync::Arc;

use tracing::debug;

use crate::error::AdmissionError;
use crate::kst::{BusinessDate, Clock};
use crate::model::{DeviceTypeId, UserId};
use crate::store::{DeviceCatalog, ReservationStore};

/// Count cap handed to the store's atomic insert. Counts the user's active
/// reservations of the inserted type dated `from` or later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RentalCap {
    pub cap: u32,
    pub from: BusinessDate,
}

impl RentalCap {
    pub fn admits(&self, current: u32, requested: u32) -> bool {
        current.saturating_add(requested) <= self.cap
    }
}

/// Snapshot of one user's standing against a type's cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitUsage {
    pub current: u32,
    pub cap: Option<u32>,
}

impl LimitUsage {
    pub fn admits(&self, requested: u32) -> bool {
        match self.cap {
            Some(cap) => self.current.saturating_add(requested) <= cap,
            None => true,
        }
    }
}

/// Per-user, per-device-type count limit.
///
/// `check_limit` is advisory. The binding check is the `RentalCap` passed to
/// `ReservationStore::insert_if_no_conflict`, evaluated under the user lock.
pub struct RentalLimitGuard {
    reservations: Arc<dyn ReservationStore>,
    catalog: Arc<dyn DeviceCatalog>,
    clock: Arc<dyn Clock>,
}

impl RentalLimitGuard {
    pub fn new(
        reservations: Arc<dyn ReservationStore>,
        catalog: Arc<dyn DeviceCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { reservations, catalog, clock }
    }

    /// The cap to enforce at insert time, or `None` for uncapped types.
    pub async fn cap_for(&self, device_type_id: DeviceTypeId) -> Result<Option<RentalCap>, AdmissionError> {
        let info = self
            .catalog
            .device_type(device_type_id)
            .await
            .map_err(AdmissionError::Store)?
            .ok_or(AdmissionError::UnknownDeviceType(device_type_id))?;
        Ok(info.max_concurrent_rentals.map(|cap| RentalCap {
            cap,
            from: self.clock.today(),
        }))
    }

    pub async fn usage(&self, user_id: UserId, device_type_id: DeviceTypeId) -> Result<LimitUsage, AdmissionError> {
        let cap = self.cap_for(device_type_id).await?;
        let from = cap.map(|c| c.from).unwrap_or_else(|| self.clock.today());
        let active = self
            .reservations
            .find_active_by_user_and_type(user_id, device_type_id, from)
            .await
            .map_err(AdmissionError::Store)?;
        Ok(LimitUsage {
            current: active.len() as u32,
            cap: cap.map(|c| c.cap),
        })
    }

    pub async fn check_limit(
        &self,
        user_id: UserId,
        device_type_id: DeviceTypeId,
        requested_units: u32,
    ) -> Result<bool, AdmissionError> {
        let usage = self.usage(user_id, device_type_id).await?;
        let ok = usage.admits(requested_units);
        if !ok {
            debug!(%user_id, %device_type_id, current = usage.current, cap = ?usage.cap, "rental limit reached");
        }
        Ok(ok)
    }

    /// Like `check_limit` but returns the typed rejection.
    pub async fn ensure_within_limit(
        &self,
        user_id: UserId,
        device_type_id: DeviceTypeId,
        requested_units: u32,
    ) -> Result<(), AdmissionError> {
        let usage = self.usage(user_id, device_type_id).await?;
        match usage.cap {
            Some(cap) if !usage.admits(requested_units) => Err(AdmissionError::RentalLimitExceeded {
                current: usage.current,
                requested: requested_units,
                cap,
            }),
            _ => Ok(()),
        }
    }
}
