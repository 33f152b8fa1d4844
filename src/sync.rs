//! Keeps auto-generated schedule events in step with reservations.
//!
//! Every run is a pure recomputation for one business date from current
//! store state, so repeating it, or retrying after a crash, converges.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::error::{StoreError, SyncError};
use crate::keyed_lock::KeyedLocks;
use crate::kst::{BusinessDate, Clock};
use crate::limits::{MAX_SYNC_ATTEMPTS, SYNC_QUEUE_CAPACITY};
use crate::model::*;
use crate::observability;
use crate::slot::TimeSlot;
use crate::store::{ReservationStore, ScheduleStore};

/// Overnight events always open at 22:00.
const OVERNIGHT_START_HOUR: u8 = 22;
const EARLY_OPEN_TITLE: &str = "조기영업";
const OVERNIGHT_TITLE: &str = "밤샘영업";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationChange {
    Created,
    Approved,
    Cancelled,
    StatusChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    Created,
    Updated,
    Deleted,
    SuppressedByManual,
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::SuppressedByManual => "suppressed",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub early_open_start: u8,
    pub early_open_end: u8,
    pub overnight: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SyncPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            early_open_start: config.early_open_start,
            early_open_end: config.early_open_end,
            overnight: config.overnight_sync,
        }
    }

    fn managed_types(&self) -> Vec<ScheduleEventType> {
        let mut types = vec![ScheduleEventType::EarlyOpen];
        if self.overnight {
            types.push(ScheduleEventType::Overnight);
        }
        types
    }

    /// Hours the auto event of `event_type` should carry, or `None` when no
    /// active reservation qualifies.
    pub fn desired_hours(&self, event_type: &ScheduleEventType, active: &[Reservation]) -> Option<TimeSlot> {
        let active = active.iter().filter(|r| r.is_active());
        match event_type {
            ScheduleEventType::EarlyOpen => {
                let window = self.early_open_start..self.early_open_end;
                let earliest = active
                    .map(|r| r.slot.start_hour())
                    .filter(|h| window.contains(h))
                    .min()?;
                TimeSlot::new(earliest, self.early_open_end).ok()
            }
            ScheduleEventType::Overnight => {
                let latest_end = active
                    .filter(|r| r.slot.start_hour() >= OVERNIGHT_START_HOUR)
                    .map(|r| r.slot.end_hour())
                    .max()?;
                TimeSlot::new(OVERNIGHT_START_HOUR, latest_end).ok()
            }
            ScheduleEventType::Other(_) => None,
        }
    }
}

fn title_for(event_type: &ScheduleEventType) -> String {
    match event_type {
        ScheduleEventType::EarlyOpen => EARLY_OPEN_TITLE.to_string(),
        ScheduleEventType::Overnight => OVERNIGHT_TITLE.to_string(),
        ScheduleEventType::Other(name) => name.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub date: BusinessDate,
    pub outcomes: Vec<(ScheduleEventType, SyncOutcome)>,
}

impl SyncReport {
    pub fn outcome(&self, event_type: &ScheduleEventType) -> Option<SyncOutcome> {
        self.outcomes
            .iter()
            .find(|(t, _)| t == event_type)
            .map(|(_, o)| *o)
    }

    pub fn writes(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_write()).count()
    }
}

pub struct ScheduleSynchronizer {
    reservations: Arc<dyn ReservationStore>,
    schedule: Arc<dyn ScheduleStore>,
    policy: SyncPolicy,
    clock: Arc<dyn Clock>,
    /// One sync per business date at a time.
    date_locks: KeyedLocks<BusinessDate>,
}

impl ScheduleSynchronizer {
    pub fn new(
        reservations: Arc<dyn ReservationStore>,
        schedule: Arc<dyn ScheduleStore>,
        policy: SyncPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reservations,
            schedule,
            policy,
            clock,
            date_locks: KeyedLocks::new(),
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Only the reservation's business date is read from the payload.
    pub async fn on_reservation_changed(
        &self,
        change: ReservationChange,
        reservation: &Reservation,
    ) -> Result<SyncReport, SyncError> {
        debug!(?change, reservation_id = %reservation.id, date = %reservation.date, "schedule sync triggered");
        self.sync_date(reservation.date).await
    }

    pub async fn sync_date(&self, date: BusinessDate) -> Result<SyncReport, SyncError> {
        let _guard = self.date_locks.lock(date).await;

        let active = self.reservations.find_active_by_date(date).await?;
        let mut outcomes = Vec::new();
        for event_type in self.policy.managed_types() {
            let result = self.sync_type(date, &event_type, &active).await;
            let label = match &result {
                Ok(o) => o.label(),
                Err(_) => "error",
            };
            metrics::counter!(observability::SCHEDULE_SYNC_TOTAL, "outcome" => label).increment(1);
            outcomes.push((event_type, result?));
        }
        Ok(SyncReport { date, outcomes })
    }

    async fn sync_type(
        &self,
        date: BusinessDate,
        event_type: &ScheduleEventType,
        active: &[Reservation],
    ) -> Result<SyncOutcome, SyncError> {
        let desired = self.policy.desired_hours(event_type, active);
        let mut autos = self.schedule.find_auto_events(date, event_type).await?;
        if autos.len() > 1 {
            // never guess which one is real
            error!(%date, %event_type, count = autos.len(), "multiple auto-generated schedule events");
            return Err(SyncError::Invariant {
                date,
                event_type: event_type.to_string(),
                count: autos.len(),
            });
        }
        let current = autos.pop();

        let Some(hours) = desired else {
            return match current {
                Some(event) => {
                    self.schedule.delete_auto_event(event.id).await?;
                    info!(%date, %event_type, "auto schedule event removed");
                    Ok(SyncOutcome::Deleted)
                }
                None => Ok(SyncOutcome::Unchanged),
            };
        };

        if let Some(event) = &current
            && event.hours == hours
        {
            return Ok(SyncOutcome::Unchanged);
        }
        if current.is_none() && self.schedule.find_manual_event(date, event_type).await?.is_some() {
            debug!(%date, %event_type, "manual event present, auto event suppressed");
            return Ok(SyncOutcome::SuppressedByManual);
        }

        let outcome = if current.is_some() { SyncOutcome::Updated } else { SyncOutcome::Created };
        let event = match current {
            Some(mut event) => {
                event.hours = hours;
                event.updated_at = self.clock.now();
                event
            }
            None => ScheduleEvent {
                id: Ulid::new(),
                date,
                event_type: event_type.clone(),
                title: title_for(event_type),
                hours,
                is_auto_generated: true,
                source_type: ScheduleSource::ReservationAuto,
                affects_reservation: false,
                updated_at: self.clock.now(),
            },
        };
        self.schedule.upsert_auto_event(event).await?;
        info!(%date, %event_type, %hours, outcome = outcome.label(), "auto schedule event written");
        Ok(outcome)
    }
}

// ── Queue ────────────────────────────────────────────────

enum SyncJob {
    Date(BusinessDate),
    Barrier(oneshot::Sender<()>),
}

/// Bounded queue in front of the synchronizer. Dates that pile up while a
/// batch runs are coalesced, so a burst of changes to one date costs one sync.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<SyncJob>,
    depth: Arc<AtomicUsize>,
}

impl SyncQueue {
    /// Start the worker. Must run inside a Tokio runtime.
    pub fn spawn(sync: Arc<ScheduleSynchronizer>, retry_backoff: Duration) -> Self {
        let (tx, rx) = mpsc::channel(SYNC_QUEUE_CAPACITY);
        let depth = Arc::new(AtomicUsize::new(0));
        tokio::spawn(sync_worker_loop(sync, rx, depth.clone(), retry_backoff));
        Self { tx, depth }
    }

    pub async fn enqueue(&self, date: BusinessDate) -> Result<(), SyncError> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!(observability::SCHEDULE_SYNC_QUEUE_DEPTH).set(depth as f64);
        self.tx.send(SyncJob::Date(date)).await.map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            SyncError::Store(StoreError::Unavailable("sync worker shut down".into()))
        })
    }

    /// Resolves once every date enqueued before the call has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SyncJob::Barrier(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

async fn sync_worker_loop(
    sync: Arc<ScheduleSynchronizer>,
    mut rx: mpsc::Receiver<SyncJob>,
    depth: Arc<AtomicUsize>,
    retry_backoff: Duration,
) {
    while let Some(job) = rx.recv().await {
        let mut dates = BTreeSet::new();
        let mut barriers = Vec::new();
        let mut absorb = |job: SyncJob| match job {
            SyncJob::Date(date) => {
                depth.fetch_sub(1, Ordering::Relaxed);
                dates.insert(date);
            }
            SyncJob::Barrier(tx) => barriers.push(tx),
        };
        absorb(job);
        while let Ok(job) = rx.try_recv() {
            absorb(job);
        }
        metrics::gauge!(observability::SCHEDULE_SYNC_QUEUE_DEPTH).set(depth.load(Ordering::Relaxed) as f64);

        for date in dates {
            sync_with_retry(&sync, date, retry_backoff).await;
        }
        for tx in barriers {
            let _ = tx.send(());
        }
    }
}

async fn sync_with_retry(sync: &ScheduleSynchronizer, date: BusinessDate, backoff: Duration) {
    for attempt in 1..=MAX_SYNC_ATTEMPTS {
        match sync.sync_date(date).await {
            Ok(report) => {
                debug!(%date, writes = report.writes(), "queued sync done");
                return;
            }
            Err(e) if e.is_retryable() && attempt < MAX_SYNC_ATTEMPTS => {
                warn!(%date, attempt, error = %e, "schedule sync failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(e) => {
                error!(%date, attempt, error = %e, "schedule sync abandoned");
                return;
            }
        }
    }
}

/// Routes lifecycle changes to the synchronizer, inline or through the queue.
#[derive(Clone)]
pub enum SyncDispatcher {
    Inline(Arc<ScheduleSynchronizer>),
    Queued(SyncQueue),
}

impl SyncDispatcher {
    /// The reservation change is already committed; a failed sync is logged
    /// and left for the next change to that date or a `resync`.
    pub async fn dispatch(&self, change: ReservationChange, reservation: &Reservation) {
        match self {
            Self::Inline(sync) => {
                if let Err(e) = sync.on_reservation_changed(change, reservation).await {
                    warn!(date = %reservation.date, error = %e, "inline schedule sync failed");
                }
            }
            Self::Queued(queue) => {
                if let Err(e) = queue.enqueue(reservation.date).await {
                    warn!(date = %reservation.date, error = %e, "schedule sync not queued");
                }
            }
        }
    }

    /// Wait for queued work. Inline dispatch has nothing pending.
    pub async fn flush(&self) {
        if let Self::Queued(queue) = self {
            queue.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kst::{now_kst, FixedClock};
    use crate::rental_limit::RentalCap;
    use crate::store::LocalStore;
    use tokio::time::Instant;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("slotlock_test_sync");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn date() -> BusinessDate {
        BusinessDate::parse("2025-01-25").unwrap()
    }

    fn setup(name: &str) -> (Arc<LocalStore>, ScheduleSynchronizer) {
        let store = Arc::new(LocalStore::open(test_wal_path(name)).unwrap());
        let sync = ScheduleSynchronizer::new(
            store.clone(),
            store.clone(),
            SyncPolicy::default(),
            Arc::new(FixedClock(now_kst())),
        );
        (store, sync)
    }

    async fn book(store: &LocalStore, start: u8, end: u8) -> Reservation {
        let now = now_kst();
        let r = Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            device_id: Ulid::new(),
            device_type_id: Ulid::new(),
            device_pinned: true,
            date: date(),
            slot: TimeSlot::new(start, end).unwrap(),
            credit_option: CreditOption::Freeplay,
            status: ReservationStatus::Approved,
            actual_start: None,
            actual_end: None,
            total_amount: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        store
            .insert_if_no_conflict(r, None::<RentalCap>, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap()
    }

    async fn cancel(store: &LocalStore, r: &Reservation) {
        let mut c = r.clone();
        c.status = ReservationStatus::Cancelled;
        store.update_with_version(c, r.version).await.unwrap();
    }

    async fn early_open(store: &LocalStore) -> Vec<ScheduleEvent> {
        store.find_auto_events(date(), &ScheduleEventType::EarlyOpen).await.unwrap()
    }

    #[test]
    fn desired_hours_policy() {
        let policy = SyncPolicy::default();
        let now = now_kst();
        let mk = |s, e| Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            device_id: Ulid::new(),
            device_type_id: Ulid::new(),
            device_pinned: true,
            date: date(),
            slot: TimeSlot::new(s, e).unwrap(),
            credit_option: CreditOption::Fixed,
            status: ReservationStatus::Pending,
            actual_start: None,
            actual_end: None,
            total_amount: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let set = vec![mk(9, 11), mk(12, 14), mk(22, 24), mk(23, 27), mk(7, 8)];
        assert_eq!(
            policy.desired_hours(&ScheduleEventType::EarlyOpen, &set),
            Some(TimeSlot::new(7, 12).unwrap())
        );
        assert_eq!(
            policy.desired_hours(&ScheduleEventType::Overnight, &set),
            Some(TimeSlot::new(22, 27).unwrap())
        );
        // 12 is outside [7, 12)
        assert_eq!(policy.desired_hours(&ScheduleEventType::EarlyOpen, &[mk(12, 14)]), None);
    }

    #[tokio::test]
    async fn earliest_start_wins_and_follows_cancellation() {
        let (store, sync) = setup("earliest.wal");
        let seven = book(&store, 7, 9).await;
        book(&store, 8, 10).await;
        book(&store, 9, 11).await;

        let report = sync.sync_date(date()).await.unwrap();
        assert_eq!(report.outcome(&ScheduleEventType::EarlyOpen), Some(SyncOutcome::Created));
        // per-date lock is dropped once the run finishes
        assert!(sync.date_locks.is_empty());
        let events = early_open(&store).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].hours, TimeSlot::new(7, 12).unwrap());
        assert_eq!(events[0].title, "조기영업");
        assert!(!events[0].affects_reservation);

        cancel(&store, &seven).await;
        let report = sync.on_reservation_changed(ReservationChange::Cancelled, &seven).await.unwrap();
        assert_eq!(report.outcome(&ScheduleEventType::EarlyOpen), Some(SyncOutcome::Updated));
        let updated = early_open(&store).await;
        assert_eq!(updated[0].id, events[0].id);
        assert_eq!(updated[0].hours.start_hour(), 8);
    }

    #[tokio::test]
    async fn second_run_writes_nothing() {
        let (store, sync) = setup("idempotent.wal");
        book(&store, 10, 12).await;
        book(&store, 23, 26).await;

        let first = sync.sync_date(date()).await.unwrap();
        assert_eq!(first.writes(), 2);
        let appends = store.wal_appends_since_compact().await;

        let second = sync.sync_date(date()).await.unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(store.wal_appends_since_compact().await, appends);
    }

    #[tokio::test]
    async fn empty_set_deletes_event() {
        let (store, sync) = setup("delete.wal");
        let only = book(&store, 11, 13).await;
        sync.sync_date(date()).await.unwrap();
        assert_eq!(early_open(&store).await.len(), 1);

        cancel(&store, &only).await;
        let report = sync.sync_date(date()).await.unwrap();
        assert_eq!(report.outcome(&ScheduleEventType::EarlyOpen), Some(SyncOutcome::Deleted));
        assert!(early_open(&store).await.is_empty());

        let again = sync.sync_date(date()).await.unwrap();
        assert_eq!(again.outcome(&ScheduleEventType::EarlyOpen), Some(SyncOutcome::Unchanged));
    }

    #[tokio::test]
    async fn manual_event_suppresses_auto() {
        let (store, sync) = setup("manual.wal");
        store
            .save_manual_event(ScheduleEvent {
                id: Ulid::new(),
                date: date(),
                event_type: ScheduleEventType::EarlyOpen,
                title: "조기영업 (관리자)".into(),
                hours: TimeSlot::new(8, 12).unwrap(),
                is_auto_generated: false,
                source_type: ScheduleSource::Manual,
                affects_reservation: true,
                updated_at: now_kst(),
            })
            .await
            .unwrap();
        book(&store, 7, 9).await;

        let report = sync.sync_date(date()).await.unwrap();
        assert_eq!(
            report.outcome(&ScheduleEventType::EarlyOpen),
            Some(SyncOutcome::SuppressedByManual)
        );
        assert!(early_open(&store).await.is_empty());
        assert_eq!(store.schedule_events(date()).len(), 1);
    }

    #[tokio::test]
    async fn duplicate_auto_events_fail_closed() {
        let (store, sync) = setup("duplicate.wal");
        for h in [7u8, 8] {
            store
                .upsert_auto_event(ScheduleEvent {
                    id: Ulid::new(),
                    date: date(),
                    event_type: ScheduleEventType::EarlyOpen,
                    title: EARLY_OPEN_TITLE.into(),
                    hours: TimeSlot::new(h, 12).unwrap(),
                    is_auto_generated: true,
                    source_type: ScheduleSource::ReservationAuto,
                    affects_reservation: false,
                    updated_at: now_kst(),
                })
                .await
                .unwrap();
        }

        let err = sync.sync_date(date()).await.unwrap_err();
        assert!(matches!(err, SyncError::Invariant { count: 2, .. }));
        assert!(!err.is_retryable());
        assert_eq!(early_open(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn overnight_can_be_disabled() {
        let store = Arc::new(LocalStore::open(test_wal_path("no_overnight.wal")).unwrap());
        let policy = SyncPolicy { overnight: false, ..SyncPolicy::default() };
        let sync = ScheduleSynchronizer::new(store.clone(), store.clone(), policy, Arc::new(FixedClock(now_kst())));
        book(&store, 23, 26).await;

        let report = sync.sync_date(date()).await.unwrap();
        assert_eq!(report.outcome(&ScheduleEventType::Overnight), None);
        assert!(store
            .find_auto_events(date(), &ScheduleEventType::Overnight)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn queue_coalesces_and_flushes() {
        let (store, sync) = setup("queue.wal");
        let queue = SyncQueue::spawn(Arc::new(sync), Duration::from_millis(10));
        book(&store, 9, 10).await;

        for _ in 0..20 {
            queue.enqueue(date()).await.unwrap();
        }
        queue.flush().await;

        assert_eq!(queue.depth(), 0);
        let events = early_open(&store).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].hours, TimeSlot::new(9, 12).unwrap());
    }
}
