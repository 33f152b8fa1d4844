//! Offline checks and housekeeping over a local store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::conflict::overlapping_pairs;
use crate::error::StoreError;
use crate::kst::BusinessDate;
use crate::model::*;
use crate::store::LocalStore;
use crate::sync::ScheduleSynchronizer;

const RESYNC_CONCURRENCY: usize = 4;
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlapViolation {
    pub first: ReservationId,
    pub second: ReservationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateAutoEvent {
    pub date: BusinessDate,
    pub event_type: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub reservations: usize,
    pub dates: usize,
    pub overlaps: Vec<OverlapViolation>,
    pub duplicate_auto_events: Vec<DuplicateAutoEvent>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.overlaps.is_empty() && self.duplicate_auto_events.is_empty()
    }
}

/// Scan every stored reservation and schedule event for invariant breaks.
pub async fn verify(store: &LocalStore) -> VerifyReport {
    let reservations = store.all_reservations().await;
    let overlaps: Vec<OverlapViolation> = overlapping_pairs(&reservations)
        .into_iter()
        .map(|(first, second)| OverlapViolation { first, second })
        .collect();

    let dates = store.business_dates();
    let mut duplicate_auto_events = Vec::new();
    for &date in &dates {
        let mut per_type: HashMap<ScheduleEventType, usize> = HashMap::new();
        for event in store.schedule_events(date).into_iter().filter(|e| e.is_auto_generated) {
            *per_type.entry(event.event_type).or_default() += 1;
        }
        let mut dupes: Vec<DuplicateAutoEvent> = per_type
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(event_type, count)| DuplicateAutoEvent {
                date,
                event_type: event_type.to_string(),
                count,
            })
            .collect();
        dupes.sort_by(|a, b| a.event_type.cmp(&b.event_type));
        duplicate_auto_events.extend(dupes);
    }

    for v in &overlaps {
        error!(first = %v.first, second = %v.second, "overlapping active reservations");
    }
    for d in &duplicate_auto_events {
        error!(date = %d.date, event_type = %d.event_type, count = d.count, "duplicate auto schedule events");
    }

    VerifyReport {
        reservations: reservations.len(),
        dates: dates.len(),
        overlaps,
        duplicate_auto_events,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResyncFailure {
    pub date: BusinessDate,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub dates: usize,
    pub writes: usize,
    pub failures: Vec<ResyncFailure>,
}

/// Recompute the auto schedule for every known business date.
pub async fn resync(store: &LocalStore, sync: &ScheduleSynchronizer) -> ResyncReport {
    let dates = store.business_dates();
    let results: Vec<_> = stream::iter(dates.iter().copied())
        .map(|date| async move { (date, sync.sync_date(date).await) })
        .buffer_unordered(RESYNC_CONCURRENCY)
        .collect()
        .await;

    let mut report = ResyncReport { dates: dates.len(), writes: 0, failures: Vec::new() };
    for (date, result) in results {
        match result {
            Ok(r) => report.writes += r.writes(),
            Err(e) => {
                warn!(%date, error = %e, "resync failed");
                report.failures.push(ResyncFailure { date, error: e.to_string() });
            }
        }
    }
    report.failures.sort_by_key(|f| f.date);
    info!(dates = report.dates, writes = report.writes, failures = report.failures.len(), "resync finished");
    report
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    pub appends_before: u64,
    pub events_written: usize,
}

pub async fn compact(store: &LocalStore) -> Result<CompactReport, StoreError> {
    let appends_before = store.wal_appends_since_compact().await;
    let events_written = store.compact_wal().await?;
    info!(appends_before, events_written, "WAL compacted");
    Ok(CompactReport { appends_before, events_written })
}

/// Start `run_compactor` with the configured threshold.
pub fn spawn_compactor(store: Arc<LocalStore>, config: &Config) -> JoinHandle<()> {
    tokio::spawn(run_compactor(store, config.compact_threshold, COMPACT_CHECK_INTERVAL))
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<LocalStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(events) => info!(appends, events, "compacted WAL"),
            Err(e) => debug!("compaction skipped: {e}"),
        }
    }
}
