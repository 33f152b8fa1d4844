use crate::kst::BusinessDate;
use crate::model::*;
use crate::slot::TimeSlot;

/// First active reservation in `existing` whose slot overlaps `slot`.
///
/// Callers pass the reservations of one device on one business date; the
/// filter re-checks both so a sloppy query can't produce a false "free".
pub fn first_conflict<'a>(
    existing: &'a [Reservation],
    device_id: DeviceId,
    date: BusinessDate,
    slot: &TimeSlot,
) -> Option<&'a Reservation> {
    existing.iter().find(|r| {
        r.is_active() && r.device_id == device_id && r.date == date && r.slot.overlaps(slot)
    })
}

pub fn check_no_conflict(
    existing: &[Reservation],
    device_id: DeviceId,
    date: BusinessDate,
    slot: &TimeSlot,
) -> Result<(), ReservationId> {
    match first_conflict(existing, device_id, date, slot) {
        Some(r) => Err(r.id),
        None => Ok(()),
    }
}

/// Every pair of active reservations on the same device and date that
/// overlap. Empty when the no-overlap invariant holds.
pub fn overlapping_pairs(reservations: &[Reservation]) -> Vec<(ReservationId, ReservationId)> {
    let mut active: Vec<&Reservation> = reservations.iter().filter(|r| r.is_active()).collect();
    active.sort_by_key(|r| (r.device_id, r.date, r.slot.start_hour()));

    let mut pairs = Vec::new();
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            if b.device_id != a.device_id || b.date != a.date {
                break;
            }
            // sorted by start: once b starts at/after a ends, no later b overlaps a
            if b.slot.start_hour() >= a.slot.end_hour() {
                break;
            }
            pairs.push((a.id, b.id));
        }
    }
    pairs
}
