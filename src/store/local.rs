use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use ulid::Ulid;

use super::wal::Wal;
use super::{AuditStore, ReservationStore, ScheduleStore};
use crate::conflict::first_conflict;
use crate::error::StoreError;
use crate::keyed_lock::{KeyedGuard, KeyedLocks};
use crate::kst::{now_kst, BusinessDate};
use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::*;
use crate::observability;
use crate::rental_limit::RentalCap;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains whatever else is already
/// queued, then fsyncs once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<Pending> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // flush even after a failed append so stray bytes don't ride into the next batch
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed to control path")));
        }
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: Event) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { event, response: tx })
        .await
        .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
        .map_err(|e| {
            warn!(error = %e, "WAL append failed");
            StoreError::Unavailable(e.to_string())
        })
}

// ── Per-device-day state ─────────────────────────────────

/// Every reservation of one device on one business date, sorted by slot start.
#[derive(Debug, Default)]
pub struct DeviceDay {
    reservations: Vec<Reservation>,
}

impl DeviceDay {
    fn insert(&mut self, r: Reservation) {
        let start = r.slot.start_hour();
        let pos = self
            .reservations
            .partition_point(|x| x.slot.start_hour() <= start);
        self.reservations.insert(pos, r);
    }

    fn replace(&mut self, r: Reservation) {
        self.reservations.retain(|x| x.id != r.id);
        self.insert(r);
    }

    fn get(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_active())
    }
}

type DayKey = (DeviceId, BusinessDate);
type SharedDeviceDay = Arc<RwLock<DeviceDay>>;

/// Lookup paths into the device-day state.
#[derive(Default)]
struct ReservationIndex {
    /// reservation id → owning device-day
    locator: DashMap<ReservationId, DayKey>,
    by_user: DashMap<UserId, Vec<ReservationId>>,
    devices_by_date: DashMap<BusinessDate, Vec<DeviceId>>,
}

impl ReservationIndex {
    fn add(&self, r: &Reservation) {
        self.locator.insert(r.id, (r.device_id, r.date));
        self.by_user.entry(r.user_id).or_default().push(r.id);
        let mut devices = self.devices_by_date.entry(r.date).or_default();
        if !devices.contains(&r.device_id) {
            devices.push(r.device_id);
        }
    }
}

/// WAL-backed store with DashMap indexes.
///
/// Admission is pessimistic: `insert_if_no_conflict` holds the user's lock
/// (when capped) and then the device-day write lock while it re-checks,
/// persists and applies. Every mutation also holds the compaction gate
/// shared, so a snapshot never misses an in-flight write.
///
/// Once an event is handed to the WAL writer, the in-memory apply runs on a
/// spawned task that owns the guards, so dropping the caller cannot leave
/// memory behind the log.
pub struct LocalStore {
    days: DashMap<DayKey, SharedDeviceDay>,
    index: Arc<ReservationIndex>,
    user_locks: KeyedLocks<UserId>,
    schedule: Arc<DashMap<Ulid, ScheduleEvent>>,
    audit: Arc<DashMap<ReservationId, Vec<TimeAdjustmentRecord>>>,
    compaction_gate: Arc<RwLock<()>>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl LocalStore {
    /// Replay `wal_path` and start the writer task. Must run inside a Tokio runtime.
    pub fn open(wal_path: impl Into<PathBuf>) -> io::Result<Self> {
        let wal_path = wal_path.into();
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            days: DashMap::new(),
            index: Arc::new(ReservationIndex::default()),
            user_locks: KeyedLocks::new(),
            schedule: Arc::new(DashMap::new()),
            audit: Arc::new(DashMap::new()),
            compaction_gate: Arc::new(RwLock::new(())),
            wal_tx,
        };

        // Build day state unlocked, then publish it.
        let mut days: HashMap<DayKey, DeviceDay> = HashMap::new();
        let replayed = events.len();
        for event in events {
            match event {
                Event::ReservationInserted(r) => {
                    store.index.add(&r);
                    days.entry((r.device_id, r.date)).or_default().insert(r);
                }
                Event::ReservationUpdated(r) => {
                    days.entry((r.device_id, r.date)).or_default().replace(r);
                }
                Event::ScheduleEventSaved(e) => {
                    store.schedule.insert(e.id, e);
                }
                Event::ScheduleEventDeleted { id, .. } => {
                    store.schedule.remove(&id);
                }
                Event::AdjustmentAppended(rec) => {
                    store.audit.entry(rec.reservation_id).or_default().push(rec);
                }
            }
        }
        for (key, day) in days {
            store.days.insert(key, Arc::new(RwLock::new(day)));
        }
        debug!(path = %wal_path.display(), events = replayed, "local store replayed");
        Ok(store)
    }

    fn day(&self, key: DayKey) -> SharedDeviceDay {
        self.days.entry(key).or_default().value().clone()
    }

    fn existing_day(&self, key: &DayKey) -> Option<SharedDeviceDay> {
        self.days.get(key).map(|e| e.value().clone())
    }

    /// Append `event`, then run `apply` once it is durable. Both steps run on
    /// a spawned task; `apply` owns whatever guards must outlive the append.
    async fn persist_and_apply<T, F>(&self, event: Event, apply: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let wal_tx = self.wal_tx.clone();
        tokio::spawn(async move {
            wal_append(&wal_tx, event).await?;
            Ok::<T, StoreError>(apply())
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("persist task failed: {e}")))?
    }

    async fn count_active_for_user(
        &self,
        user_id: UserId,
        device_type_id: DeviceTypeId,
        from: BusinessDate,
    ) -> u32 {
        let mut count = 0;
        for r in self.user_reservations(user_id).await {
            if r.is_active() && r.device_type_id == device_type_id && r.date >= from {
                count += 1;
            }
        }
        count
    }

    async fn user_reservations(&self, user_id: UserId) -> Vec<Reservation> {
        let ids = self
            .index
            .by_user
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.load(id).await {
                out.push(r);
            }
        }
        out
    }

    async fn load(&self, id: ReservationId) -> Option<Reservation> {
        let key = self.index.locator.get(&id).map(|e| *e.value())?;
        let day = self.existing_day(&key)?;
        let guard = day.read().await;
        guard.get(id).cloned()
    }

    /// Inserts a schedule event owned by an external admin workflow.
    pub async fn save_manual_event(&self, event: ScheduleEvent) -> Result<(), StoreError> {
        if event.is_auto_generated {
            return Err(StoreError::Invariant(
                "auto-generated events are written through upsert_auto_event".into(),
            ));
        }
        let gate = self.compaction_gate.clone().read_owned().await;
        let schedule = self.schedule.clone();
        self.persist_and_apply(Event::ScheduleEventSaved(event.clone()), move || {
            let _gate = gate;
            schedule.insert(event.id, event);
        })
        .await
    }

    pub fn schedule_events(&self, date: BusinessDate) -> Vec<ScheduleEvent> {
        let mut events: Vec<ScheduleEvent> = self
            .schedule
            .iter()
            .filter(|e| e.date == date)
            .map(|e| e.value().clone())
            .collect();
        events.sort_by_key(|e| e.id);
        events
    }

    /// Every stored reservation regardless of status.
    pub async fn all_reservations(&self) -> Vec<Reservation> {
        let days: Vec<SharedDeviceDay> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for day in days {
            out.extend(day.read().await.reservations().iter().cloned());
        }
        out
    }

    /// Business dates that carry reservations or schedule events, ascending.
    pub fn business_dates(&self) -> Vec<BusinessDate> {
        let mut dates: BTreeSet<BusinessDate> =
            self.index.devices_by_date.iter().map(|e| *e.key()).collect();
        dates.extend(self.schedule.iter().map(|e| e.date));
        dates.into_iter().collect()
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    pub async fn compact_wal(&self) -> Result<usize, StoreError> {
        let _gate = self.compaction_gate.write().await;

        let mut events = Vec::new();
        let mut reservations = self.all_reservations().await;
        reservations.sort_by_key(|r| r.id);
        events.extend(reservations.into_iter().map(Event::ReservationInserted));

        let mut schedule: Vec<ScheduleEvent> = self.schedule.iter().map(|e| e.value().clone()).collect();
        schedule.sort_by_key(|e| e.id);
        events.extend(schedule.into_iter().map(Event::ScheduleEventSaved));

        // per-reservation append order is the audit trail's order
        for trail in self.audit.iter() {
            events.extend(trail.value().iter().cloned().map(Event::AdjustmentAppended));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl ReservationStore for LocalStore {
    async fn find_by_id(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        Ok(self.load(id).await)
    }

    async fn find_active_by_device_and_date(
        &self,
        device_id: DeviceId,
        date: BusinessDate,
    ) -> Result<Vec<Reservation>, StoreError> {
        let Some(day) = self.existing_day(&(device_id, date)) else {
            return Ok(Vec::new());
        };
        let guard = day.read().await;
        Ok(guard.active().cloned().collect())
    }

    async fn find_active_by_user_and_type(
        &self,
        user_id: UserId,
        device_type_id: DeviceTypeId,
        from: BusinessDate,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut out: Vec<Reservation> = self
            .user_reservations(user_id)
            .await
            .into_iter()
            .filter(|r| r.is_active() && r.device_type_id == device_type_id && r.date >= from)
            .collect();
        out.sort_by_key(|r| (r.date, r.slot.start_hour()));
        Ok(out)
    }

    async fn find_active_by_date(&self, date: BusinessDate) -> Result<Vec<Reservation>, StoreError> {
        let devices = self
            .index
            .devices_by_date
            .get(&date)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for device_id in devices {
            if let Some(day) = self.existing_day(&(device_id, date)) {
                out.extend(day.read().await.active().cloned());
            }
        }
        out.sort_by_key(|r| (r.slot.start_hour(), r.id));
        Ok(out)
    }

    async fn insert_if_no_conflict(
        &self,
        mut reservation: Reservation,
        cap: Option<RentalCap>,
        deadline: Instant,
    ) -> Result<Reservation, StoreError> {
        let gate = timeout_at(deadline, self.compaction_gate.clone().read_owned())
            .await
            .map_err(|_| StoreError::LockTimeout)?;

        // user lock before device-day lock, always
        let user_guard: Option<KeyedGuard<UserId>> = match cap {
            Some(cap) => {
                let guard = timeout_at(deadline, self.user_locks.lock(reservation.user_id))
                    .await
                    .map_err(|_| StoreError::LockTimeout)?;
                let current = timeout_at(
                    deadline,
                    self.count_active_for_user(reservation.user_id, reservation.device_type_id, cap.from),
                )
                .await
                .map_err(|_| StoreError::LockTimeout)?;
                if !cap.admits(current, 1) {
                    return Err(StoreError::RentalLimit { current, cap: cap.cap });
                }
                Some(guard)
            }
            None => None,
        };

        let key = (reservation.device_id, reservation.date);
        let day = self.day(key);
        let mut guard = timeout_at(deadline, day.write_owned())
            .await
            .map_err(|_| StoreError::LockTimeout)?;

        if let Some(existing) = first_conflict(
            guard.reservations(),
            reservation.device_id,
            reservation.date,
            &reservation.slot,
        ) {
            return Err(StoreError::Conflict { existing: existing.id });
        }
        if self.index.locator.contains_key(&reservation.id) {
            return Err(StoreError::Invariant(format!(
                "reservation {} already exists",
                reservation.id
            )));
        }

        let now = now_kst();
        reservation.version = 1;
        reservation.created_at = now;
        reservation.updated_at = now;

        let index = self.index.clone();
        self.persist_and_apply(Event::ReservationInserted(reservation.clone()), move || {
            let _held = (gate, user_guard);
            guard.insert(reservation.clone());
            index.add(&reservation);
            reservation
        })
        .await
    }

    async fn update_with_version(
        &self,
        reservation: Reservation,
        expected_version: u64,
    ) -> Result<Reservation, StoreError> {
        let gate = self.compaction_gate.clone().read_owned().await;

        let id = reservation.id;
        let key = self
            .index
            .locator
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        if key != (reservation.device_id, reservation.date) {
            return Err(StoreError::Invariant(format!(
                "device and business date of {id} are fixed once admitted"
            )));
        }
        let day = self.existing_day(&key).ok_or(StoreError::NotFound(id))?;
        let mut guard = day.write_owned().await;

        let stored = guard.get(id).ok_or(StoreError::NotFound(id))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: stored.version,
            });
        }
        let created_at = stored.created_at;

        let mut next = reservation;
        if next.is_active()
            && let Some(existing) = guard.reservations().iter().find(|x| next.conflicts_with(x))
        {
            return Err(StoreError::Conflict { existing: existing.id });
        }
        next.version = expected_version + 1;
        next.created_at = created_at;
        next.updated_at = now_kst();

        self.persist_and_apply(Event::ReservationUpdated(next.clone()), move || {
            let _gate = gate;
            guard.replace(next.clone());
            next
        })
        .await
    }
}

#[async_trait]
impl ScheduleStore for LocalStore {
    async fn find_auto_events(
        &self,
        date: BusinessDate,
        event_type: &ScheduleEventType,
    ) -> Result<Vec<ScheduleEvent>, StoreError> {
        let mut events: Vec<ScheduleEvent> = self
            .schedule
            .iter()
            .filter(|e| e.is_auto_generated && e.date == date && &e.event_type == event_type)
            .map(|e| e.value().clone())
            .collect();
        events.sort_by_key(|e| e.id);
        Ok(events)
    }

    async fn find_manual_event(
        &self,
        date: BusinessDate,
        event_type: &ScheduleEventType,
    ) -> Result<Option<ScheduleEvent>, StoreError> {
        Ok(self
            .schedule
            .iter()
            .find(|e| !e.is_auto_generated && e.date == date && &e.event_type == event_type)
            .map(|e| e.value().clone()))
    }

    async fn upsert_auto_event(&self, event: ScheduleEvent) -> Result<(), StoreError> {
        if !event.is_auto_generated {
            return Err(StoreError::Invariant(format!(
                "refusing to write manual event {} as auto-generated",
                event.id
            )));
        }
        if let Some(existing) = self.schedule.get(&event.id)
            && !existing.is_auto_generated
        {
            return Err(StoreError::Invariant(format!(
                "event {} is manually owned",
                event.id
            )));
        }
        let gate = self.compaction_gate.clone().read_owned().await;
        let schedule = self.schedule.clone();
        self.persist_and_apply(Event::ScheduleEventSaved(event.clone()), move || {
            let _gate = gate;
            schedule.insert(event.id, event);
        })
        .await
    }

    async fn delete_auto_event(&self, id: Ulid) -> Result<(), StoreError> {
        let date = match self.schedule.get(&id) {
            Some(e) if e.is_auto_generated => e.date,
            _ => return Err(StoreError::NotFound(id)),
        };
        let gate = self.compaction_gate.clone().read_owned().await;
        let schedule = self.schedule.clone();
        self.persist_and_apply(Event::ScheduleEventDeleted { id, date }, move || {
            let _gate = gate;
            schedule.remove(&id);
        })
        .await
    }
}

#[async_trait]
impl AuditStore for LocalStore {
    async fn append(&self, record: TimeAdjustmentRecord) -> Result<(), StoreError> {
        let gate = self.compaction_gate.clone().read_owned().await;
        let audit = self.audit.clone();
        self.persist_and_apply(Event::AdjustmentAppended(record.clone()), move || {
            let _gate = gate;
            audit.entry(record.reservation_id).or_default().push(record);
        })
        .await
    }

    async fn find_by_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Vec<TimeAdjustmentRecord>, StoreError> {
        Ok(self
            .audit
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}
