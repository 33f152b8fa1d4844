use std::sync::Arc;

use crate::conflict::first_conflict;
use crate::error::StoreError;
use crate::kst::BusinessDate;
use crate::model::{DeviceId, DeviceTypeId, Reservation};
use crate::slot::TimeSlot;
use crate::store::{DeviceCatalog, ReservationStore};

/// Read-only view of which devices are free. Advisory: admission re-checks
/// under the store's locks, so an answer here may be stale by the time it's used.
pub struct SlotAvailabilityIndex {
    reservations: Arc<dyn ReservationStore>,
    catalog: Arc<dyn DeviceCatalog>,
}

impl SlotAvailabilityIndex {
    pub fn new(reservations: Arc<dyn ReservationStore>, catalog: Arc<dyn DeviceCatalog>) -> Self {
        Self { reservations, catalog }
    }

    pub async fn is_available(
        &self,
        device_id: DeviceId,
        date: BusinessDate,
        slot: &TimeSlot,
    ) -> Result<bool, StoreError> {
        let existing = self
            .reservations
            .find_active_by_device_and_date(device_id, date)
            .await?;
        Ok(first_conflict(&existing, device_id, date, slot).is_none())
    }

    /// Rentable devices of the type with no active overlapping reservation,
    /// in catalog order.
    pub async fn find_available_devices(
        &self,
        device_type_id: DeviceTypeId,
        date: BusinessDate,
        slot: &TimeSlot,
    ) -> Result<Vec<DeviceId>, StoreError> {
        let mut free = Vec::new();
        for device in self.catalog.devices_of_type(device_type_id).await? {
            if self.is_available(device.id, date, slot).await? {
                free.push(device.id);
            }
        }
        Ok(free)
    }

    /// Unbooked stretches of `within` on one device, as maximal hour ranges.
    pub async fn free_slots(
        &self,
        device_id: DeviceId,
        date: BusinessDate,
        within: TimeSlot,
    ) -> Result<Vec<TimeSlot>, StoreError> {
        let existing = self
            .reservations
            .find_active_by_device_and_date(device_id, date)
            .await?;
        Ok(subtract_booked(within, &existing))
    }
}

/// `within` minus every active booked slot. Inputs need not be sorted.
pub fn subtract_booked(within: TimeSlot, booked: &[Reservation]) -> Vec<TimeSlot> {
    let mut taken: Vec<TimeSlot> = booked
        .iter()
        .filter(|r| r.is_active() && r.slot.overlaps(&within))
        .map(|r| r.slot)
        .collect();
    taken.sort_by_key(|s| s.start_hour());

    let mut free = Vec::new();
    let mut cursor = within.start_hour();
    for t in taken {
        if t.start_hour() > cursor
            && let Ok(gap) = TimeSlot::new(cursor, t.start_hour().min(within.end_hour()))
        {
            free.push(gap);
        }
        cursor = cursor.max(t.end_hour());
    }
    if cursor < within.end_hour()
        && let Ok(tail) = TimeSlot::new(cursor, within.end_hour())
    {
        free.push(tail);
    }
    free
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kst::now_kst;
    use crate::model::*;
    use crate::store::{DeviceInfo, DeviceTypeInfo, LocalStore, StaticCatalog};
    use std::time::Duration;
    use tokio::time::Instant;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("slotlock_test_availability");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn date() -> BusinessDate {
        BusinessDate::parse("2025-01-25").unwrap()
    }

    fn slot(s: u8, e: u8) -> TimeSlot {
        TimeSlot::new(s, e).unwrap()
    }

    fn booked(device: DeviceId, ty: DeviceTypeId, s: u8, e: u8) -> Reservation {
        let now = now_kst();
        Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            device_id: device,
            device_type_id: ty,
            device_pinned: true,
            date: date(),
            slot: slot(s, e),
            credit_option: CreditOption::Fixed,
            status: ReservationStatus::Approved,
            actual_start: None,
            actual_end: None,
            total_amount: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn subtract_booked_leaves_gaps() {
        let d = Ulid::new();
        let t = Ulid::new();
        let taken = vec![booked(d, t, 14, 16), booked(d, t, 10, 12), booked(d, t, 22, 26)];
        assert_eq!(
            subtract_booked(slot(7, 30), &taken),
            vec![slot(7, 10), slot(12, 14), slot(16, 22), slot(26, 30)]
        );
        assert!(subtract_booked(slot(14, 16), &taken).is_empty());
    }

    #[tokio::test]
    async fn find_available_devices_skips_busy_ones() {
        let store = Arc::new(LocalStore::open(test_wal_path("find.wal")).unwrap());
        let ty = Ulid::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let catalog = Arc::new(
            StaticCatalog::new()
                .with_type(DeviceTypeInfo {
                    id: ty,
                    name: "DDR".into(),
                    max_concurrent_rentals: None,
                    operating_hours: slot(7, 30),
                })
                .with_device(DeviceInfo { id: a, device_type_id: ty, rentable: true })
                .with_device(DeviceInfo { id: b, device_type_id: ty, rentable: true }),
        );
        store
            .insert_if_no_conflict(booked(a, ty, 14, 16), None, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        let index = SlotAvailabilityIndex::new(store, catalog);
        assert!(!index.is_available(a, date(), &slot(15, 17)).await.unwrap());
        assert!(index.is_available(a, date(), &slot(16, 18)).await.unwrap());
        assert_eq!(index.find_available_devices(ty, date(), &slot(15, 17)).await.unwrap(), vec![b]);
        assert_eq!(
            index.free_slots(a, date(), slot(12, 20)).await.unwrap(),
            vec![slot(12, 14), slot(16, 20)]
        );
    }
}
