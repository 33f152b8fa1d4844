//! Public entry point wiring the components together.

use std::io;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::adjust::{AdjustmentRequest, TimeAdjustmentService};
use crate::admission::{AdmissionController, AdmissionRequest};
use crate::config::{Config, SyncMode};
use crate::error::{AdjustError, AdmissionError, LifecycleError, StoreError, SyncError};
use crate::kst::{BusinessDate, Clock, SystemClock};
use crate::limits::MAX_CANCEL_ATTEMPTS;
use crate::maintenance;
use crate::model::*;
use crate::notify::{LifecycleEvent, LifecycleHub, LifecycleKind};
use crate::observability;
use crate::slot::TimeSlot;
use crate::store::{
    AuditStore, DeviceCatalog, LocalStore, PricingLookup, ReservationStore, ScheduleStore,
};
use crate::sync::{ReservationChange, ScheduleSynchronizer, SyncDispatcher, SyncPolicy, SyncQueue, SyncReport};

/// The collaborators the core is built on.
#[derive(Clone)]
pub struct Stores {
    pub reservations: Arc<dyn ReservationStore>,
    pub schedule: Arc<dyn ScheduleStore>,
    pub audit: Arc<dyn AuditStore>,
    pub catalog: Arc<dyn DeviceCatalog>,
    pub pricing: Arc<dyn PricingLookup>,
}

impl Stores {
    /// All three repositories backed by one local store.
    pub fn local(
        store: Arc<LocalStore>,
        catalog: Arc<dyn DeviceCatalog>,
        pricing: Arc<dyn PricingLookup>,
    ) -> Self {
        Self {
            reservations: store.clone(),
            schedule: store.clone(),
            audit: store,
            catalog,
            pricing,
        }
    }
}

pub struct BookingCore {
    reservations: Arc<dyn ReservationStore>,
    admission: AdmissionController,
    adjustments: TimeAdjustmentService,
    synchronizer: Arc<ScheduleSynchronizer>,
    dispatcher: SyncDispatcher,
    hub: LifecycleHub,
}

impl BookingCore {
    /// Build with the system clock. Queued sync mode spawns its worker, so
    /// this must run inside a Tokio runtime.
    pub fn new(stores: Stores, config: &Config) -> Self {
        Self::with_clock(stores, config, Arc::new(SystemClock))
    }

    /// Open the WAL under `config.data_dir`, start its background compactor
    /// and build a core over it.
    pub fn open_local(
        config: &Config,
        catalog: Arc<dyn DeviceCatalog>,
        pricing: Arc<dyn PricingLookup>,
    ) -> io::Result<(Self, Arc<LocalStore>)> {
        let store = Arc::new(LocalStore::open(config.wal_path())?);
        maintenance::spawn_compactor(store.clone(), config);
        let core = Self::new(Stores::local(store.clone(), catalog, pricing), config);
        Ok((core, store))
    }

    pub fn with_clock(stores: Stores, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let synchronizer = Arc::new(ScheduleSynchronizer::new(
            stores.reservations.clone(),
            stores.schedule.clone(),
            SyncPolicy::from_config(config),
            clock.clone(),
        ));
        let dispatcher = match config.sync_mode {
            SyncMode::Inline => SyncDispatcher::Inline(synchronizer.clone()),
            SyncMode::Queued => {
                SyncDispatcher::Queued(SyncQueue::spawn(synchronizer.clone(), config.sync_retry_backoff))
            }
        };
        Self {
            admission: AdmissionController::new(
                stores.reservations.clone(),
                stores.catalog.clone(),
                stores.pricing.clone(),
                clock.clone(),
                config.advance_cutoff(),
                config.admission_timeout,
            ),
            adjustments: TimeAdjustmentService::new(
                stores.reservations.clone(),
                stores.audit.clone(),
                stores.pricing.clone(),
                clock,
            ),
            reservations: stores.reservations,
            synchronizer,
            dispatcher,
            hub: LifecycleHub::new(),
        }
    }

    // ── Booking ─────────────────────────────────────────────

    pub async fn admit(&self, req: AdmissionRequest) -> Result<Reservation, AdmissionError> {
        let reservation = self.admission.admit(req).await?;
        self.hub.publish(LifecycleKind::Created, &reservation);
        self.dispatcher
            .dispatch(ReservationChange::Created, &reservation)
            .await;
        Ok(reservation)
    }

    /// Cancel on behalf of `actor`. Users may only cancel their own bookings.
    /// Concurrent non-status writes are absorbed by a bounded reload-and-retry.
    pub async fn cancel(&self, id: ReservationId, actor: Actor) -> Result<Reservation, LifecycleError> {
        for attempt in 1..=MAX_CANCEL_ATTEMPTS {
            let current = self.load(id).await?;
            if let Actor::User(user_id) = actor
                && user_id != current.user_id
            {
                return Err(LifecycleError::NotOwner(id));
            }
            match self.apply_transition(current, ReservationStatus::Cancelled).await {
                Err(LifecycleError::VersionConflict(_)) if attempt < MAX_CANCEL_ATTEMPTS => {
                    debug!(reservation_id = %id, attempt, "cancel raced another write, reloading");
                }
                result => {
                    if result.is_ok() {
                        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
                    }
                    return result;
                }
            }
        }
        Err(LifecycleError::VersionConflict(id))
    }

    /// Move a reservation along the lifecycle table. `expected_version` is the
    /// version the caller read.
    pub async fn transition(
        &self,
        id: ReservationId,
        expected_version: u64,
        to: ReservationStatus,
    ) -> Result<Reservation, LifecycleError> {
        let current = self.load(id).await?;
        if current.version != expected_version {
            return Err(LifecycleError::VersionConflict(id));
        }
        self.apply_transition(current, to).await
    }

    async fn apply_transition(
        &self,
        current: Reservation,
        to: ReservationStatus,
    ) -> Result<Reservation, LifecycleError> {
        let from = current.status;
        if !from.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }
        let mut next = current.clone();
        next.status = to;
        let updated = self
            .reservations
            .update_with_version(next, current.version)
            .await?;

        metrics::counter!(observability::STATUS_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        info!(reservation_id = %updated.id, %from, %to, "reservation status changed");

        let (kind, change) = match to {
            ReservationStatus::Approved => (LifecycleKind::Approved, ReservationChange::Approved),
            ReservationStatus::Cancelled => (LifecycleKind::Cancelled, ReservationChange::Cancelled),
            _ => (LifecycleKind::StatusChanged, ReservationChange::StatusChanged),
        };
        self.hub.publish(kind, &updated);
        let leaves_active_set = from.is_active() && !to.is_active();
        if to == ReservationStatus::Approved || leaves_active_set {
            self.dispatcher.dispatch(change, &updated).await;
        }
        Ok(updated)
    }

    async fn load(&self, id: ReservationId) -> Result<Reservation, LifecycleError> {
        self.reservations
            .find_by_id(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))
    }

    pub async fn reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        self.reservations.find_by_id(id).await
    }

    // ── Time adjustment ─────────────────────────────────────

    pub async fn adjust_time(&self, req: AdjustmentRequest) -> Result<TimeAdjustmentRecord, AdjustError> {
        let record = self.adjustments.adjust(req).await?;
        if let Some(updated) = self.reservations.find_by_id(record.reservation_id).await? {
            self.hub.publish(LifecycleKind::TimeAdjusted, &updated);
            // an adjustment past the actual end completes a checked-in reservation
            if !updated.is_active() {
                self.dispatcher
                    .dispatch(ReservationChange::StatusChanged, &updated)
                    .await;
            }
        }
        Ok(record)
    }

    pub async fn adjustment_history(
        &self,
        id: ReservationId,
    ) -> Result<Vec<TimeAdjustmentRecord>, AdjustError> {
        self.adjustments.history(id).await
    }

    // ── Availability & limits ───────────────────────────────

    pub async fn is_available(
        &self,
        device_id: DeviceId,
        date: BusinessDate,
        slot: &TimeSlot,
    ) -> Result<bool, StoreError> {
        self.admission.availability().is_available(device_id, date, slot).await
    }

    pub async fn find_available_devices(
        &self,
        device_type_id: DeviceTypeId,
        date: BusinessDate,
        slot: &TimeSlot,
    ) -> Result<Vec<DeviceId>, StoreError> {
        self.admission
            .availability()
            .find_available_devices(device_type_id, date, slot)
            .await
    }

    pub async fn free_slots(
        &self,
        device_id: DeviceId,
        date: BusinessDate,
        within: TimeSlot,
    ) -> Result<Vec<TimeSlot>, StoreError> {
        self.admission.availability().free_slots(device_id, date, within).await
    }

    pub async fn check_limit(
        &self,
        user_id: UserId,
        device_type_id: DeviceTypeId,
        requested_units: u32,
    ) -> Result<bool, AdmissionError> {
        self.admission
            .limits()
            .check_limit(user_id, device_type_id, requested_units)
            .await
    }

    // ── Schedule ────────────────────────────────────────────

    /// Recompute the auto schedule for one date now, bypassing the queue.
    pub async fn sync_date(&self, date: BusinessDate) -> Result<SyncReport, SyncError> {
        self.synchronizer.sync_date(date).await
    }

    /// Wait until queued schedule work has drained.
    pub async fn flush_sync(&self) {
        self.dispatcher.flush().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::DeviceSelector;
    use crate::kst::FixedClock;
    use crate::store::{DeviceInfo, DeviceTypeInfo, HourlyRateTable, StaticCatalog};
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("slotlock_test_booking");
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

    fn setup(name: &str, mode: SyncMode) -> (BookingCore, Arc<LocalStore>, DeviceId) {
        let store = Arc::new(LocalStore::open(test_wal_path(name)).unwrap());
        let (ty, device) = (Ulid::new(), Ulid::new());
        let now = BusinessDate::parse("2025-01-20").unwrap().at_hour(9);
        let core = build(store.clone(), ty, device, mode, now);
        (core, store, device)
    }

    fn build(
        store: Arc<LocalStore>,
        ty: DeviceTypeId,
        device: DeviceId,
        mode: SyncMode,
        now: chrono::NaiveDateTime,
    ) -> BookingCore {
        let catalog = StaticCatalog::new()
            .with_type(DeviceTypeInfo {
                id: ty,
                name: "beatmania IIDX".into(),
                max_concurrent_rentals: None,
                operating_hours: slot(7, 30),
            })
            .with_device(DeviceInfo { id: device, device_type_id: ty, rentable: true });
        let pricing = HourlyRateTable::new().with_rate(ty, CreditOption::Fixed, 8_000);
        let config = Config { sync_mode: mode, ..Config::default() };
        BookingCore::with_clock(
            Stores::local(store, Arc::new(catalog), Arc::new(pricing)),
            &config,
            Arc::new(FixedClock(now)),
        )
    }

    async fn admit(core: &BookingCore, user: UserId, device: DeviceId, s: u8, e: u8) -> Reservation {
        core.admit(AdmissionRequest::new(
            user,
            DeviceSelector::Device(device),
            date(),
            slot(s, e),
            CreditOption::Fixed,
        ))
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn cancel_checks_owner_and_state() {
        let (core, _store, device) = setup("cancel.wal", SyncMode::Inline);
        let owner = Ulid::new();
        let r = admit(&core, owner, device, 14, 16).await;

        assert_eq!(
            core.cancel(r.id, Actor::User(Ulid::new())).await.unwrap_err(),
            LifecycleError::NotOwner(r.id)
        );
        let cancelled = core.cancel(r.id, Actor::User(owner)).await.unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);
        assert_eq!(
            core.cancel(r.id, Actor::Admin(Ulid::new())).await.unwrap_err(),
            LifecycleError::InvalidTransition {
                from: ReservationStatus::Cancelled,
                to: ReservationStatus::Cancelled,
            }
        );
        // slot is free again
        assert!(core.is_available(device, date(), &slot(14, 16)).await.unwrap());
        let missing = Ulid::new();
        assert_eq!(
            core.cancel(missing, Actor::Admin(owner)).await.unwrap_err(),
            LifecycleError::NotFound(missing)
        );
    }

    #[tokio::test]
    async fn transitions_follow_table_and_version() {
        let (core, _store, device) = setup("transition.wal", SyncMode::Inline);
        let r = admit(&core, Ulid::new(), device, 10, 12).await;

        let approved = core.transition(r.id, r.version, ReservationStatus::Approved).await.unwrap();
        assert_eq!(approved.version, r.version + 1);
        assert_eq!(
            core.transition(r.id, r.version, ReservationStatus::CheckedIn).await.unwrap_err(),
            LifecycleError::VersionConflict(r.id)
        );
        assert_eq!(
            core.transition(r.id, approved.version, ReservationStatus::Completed).await.unwrap_err(),
            LifecycleError::InvalidTransition {
                from: ReservationStatus::Approved,
                to: ReservationStatus::Completed,
            }
        );
        let checked_in = core
            .transition(r.id, approved.version, ReservationStatus::CheckedIn)
            .await
            .unwrap();
        core.transition(r.id, checked_in.version, ReservationStatus::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let (core, _store, device) = setup("events.wal", SyncMode::Inline);
        let mut rx = core.subscribe();
        let user = Ulid::new();
        let r = admit(&core, user, device, 14, 16).await;
        core.cancel(r.id, Actor::User(user)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind, LifecycleKind::Created);
        let cancelled = rx.recv().await.unwrap();
        assert_eq!(cancelled.kind, LifecycleKind::Cancelled);
        assert_eq!(cancelled.reservation.id, r.id);
    }

    #[tokio::test]
    async fn queued_sync_converges_after_flush() {
        let (core, store, device) = setup("queued.wal", SyncMode::Queued);
        let user = Ulid::new();
        let r = admit(&core, user, device, 8, 10).await;
        core.flush_sync().await;
        let events = store.find_auto_events(date(), &ScheduleEventType::EarlyOpen).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].hours, slot(8, 12));

        core.cancel(r.id, Actor::User(user)).await.unwrap();
        core.flush_sync().await;
        assert!(store
            .find_auto_events(date(), &ScheduleEventType::EarlyOpen)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn adjusting_after_use_completes_and_resyncs() {
        let (core, store, device) = setup("adjust_complete.wal", SyncMode::Inline);
        let r = admit(&core, Ulid::new(), device, 8, 10).await;
        let r = core.transition(r.id, r.version, ReservationStatus::Approved).await.unwrap();
        let r = core.transition(r.id, r.version, ReservationStatus::CheckedIn).await.unwrap();
        let early = store.find_auto_events(date(), &ScheduleEventType::EarlyOpen).await.unwrap();
        assert_eq!(early.len(), 1);

        // same store, clock after play ended
        let later = build(store.clone(), r.device_type_id, device, SyncMode::Inline, date().at_hour(12));
        later
            .adjust_time(AdjustmentRequest {
                reservation_id: r.id,
                actual_start: date().at_hour(8),
                actual_end: date().at_hour(9) + chrono::Duration::minutes(30),
                reason: "early_finish".into(),
                reason_detail: None,
                adjusted_by: Ulid::new(),
            })
            .await
            .unwrap();

        let stored = store.find_by_id(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Completed);
        assert!(store.find_auto_events(date(), &ScheduleEventType::EarlyOpen).await.unwrap().is_empty());
        assert!(later.is_available(device, date(), &slot(8, 10)).await.unwrap());
    }
}
