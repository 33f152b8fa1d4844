use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::kst::{BusinessDate, DisplayHour};
use crate::limits::{BUSINESS_DAY_START_HOUR, MAX_DISPLAY_HOUR, MAX_SLOT_END_HOUR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("start hour {0} outside the business day (6..=29)")]
    StartOutOfRange(u8),
    #[error("end hour {0} past the business-day boundary (30)")]
    EndOutOfRange(u8),
    #[error("empty slot: start {start} is not before end {end}")]
    Empty { start: u8, end: u8 },
}

/// Half-open `[start, end)` range of display hours on one business date.
///
/// Overnight slots stay ordered because their end is written ≥ 24
/// (`23–26` is 23:00 → 02:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSlot", into = "RawSlot")]
pub struct TimeSlot {
    start: u8,
    end: u8,
}

#[derive(Serialize, Deserialize)]
struct RawSlot {
    start: u8,
    end: u8,
}

impl TryFrom<RawSlot> for TimeSlot {
    type Error = SlotError;

    fn try_from(raw: RawSlot) -> Result<Self, Self::Error> {
        TimeSlot::new(raw.start, raw.end)
    }
}

impl From<TimeSlot> for RawSlot {
    fn from(s: TimeSlot) -> Self {
        RawSlot { start: s.start, end: s.end }
    }
}

impl TimeSlot {
    /// Build a slot already expressed on the display clock.
    pub fn new(start: u8, end: u8) -> Result<Self, SlotError> {
        if !(BUSINESS_DAY_START_HOUR..=MAX_DISPLAY_HOUR).contains(&start) {
            return Err(SlotError::StartOutOfRange(start));
        }
        if end > MAX_SLOT_END_HOUR {
            return Err(SlotError::EndOutOfRange(end));
        }
        if start >= end {
            return Err(SlotError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DisplayHour {
        DisplayHour::new(self.start).expect("validated on construction")
    }

    pub fn start_hour(&self) -> u8 {
        self.start
    }

    /// Exclusive end; may be 30 (06:00 of the next civil day).
    pub fn end_hour(&self) -> u8 {
        self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        i64::from(self.end - self.start) * 60
    }

    /// Touching boundaries (`a.end == b.start`) are adjacent, not overlapping.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start.max(other.start) < self.end.min(other.end)
    }

    pub fn contains(&self, other: &TimeSlot) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Wall-clock span of this slot on the given business date.
    pub fn span_on(&self, date: BusinessDate) -> Span {
        Span::new(date.at_hour(self.start), date.at_hour(self.end))
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:00-{:02}:00", self.start, self.end)
    }
}

/// A slot pinned to its owning business date. Equality is on the normalized
/// form, so `2025-01-25 24–26` and `2025-01-26 00–02` are the same window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingWindow {
    pub date: BusinessDate,
    pub slot: TimeSlot,
}

impl BookingWindow {
    /// Normalize a request that may use raw early-morning hours.
    ///
    /// - `start < 6` names 00:00–05:59 of `civil_date`, which belongs to the
    ///   previous business date; both ends shift by +24.
    /// - `end <= start` with `end <= 6` is a raw overnight end (`23 → 2`).
    pub fn normalize(civil_date: BusinessDate, start: u8, end: u8) -> Result<Self, SlotError> {
        if start < BUSINESS_DAY_START_HOUR {
            if end < start || end > BUSINESS_DAY_START_HOUR {
                return Err(SlotError::EndOutOfRange(end));
            }
            let slot = TimeSlot::new(start + 24, end + 24)?;
            return Ok(Self { date: civil_date.pred(), slot });
        }
        let end = if end <= start && end <= BUSINESS_DAY_START_HOUR {
            end + 24
        } else {
            end
        };
        Ok(Self { date: civil_date, slot: TimeSlot::new(start, end)? })
    }

    pub fn span(&self) -> Span {
        self.slot.span_on(self.date)
    }
}

/// Half-open wall-clock interval `[start, end)` in KST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Minutes of `self` that fall inside `other`.
    pub fn overlap_minutes(&self, other: &Span) -> i64 {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end { (end - start).num_minutes() } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(s: u8, e: u8) -> TimeSlot {
        TimeSlot::new(s, e).unwrap()
    }

    fn date(s: &str) -> BusinessDate {
        BusinessDate::parse(s).unwrap()
    }

    #[test]
    fn slot_overlap() {
        let a = slot(14, 16);
        assert!(a.overlaps(&slot(15, 17)));
        assert!(a.overlaps(&slot(13, 15)));
        assert!(a.overlaps(&slot(10, 22))); // containment
        assert!(!a.overlaps(&slot(16, 18))); // adjacent, not overlapping
        assert!(!a.overlaps(&slot(12, 14)));
    }

    #[test]
    fn overnight_slots_stay_ordered() {
        let late = slot(22, 26);
        assert_eq!(late.duration_minutes(), 240);
        assert!(late.overlaps(&slot(25, 29)));
        assert!(!late.overlaps(&slot(26, 30)));
    }

    #[test]
    fn invalid_slots_rejected() {
        assert_eq!(TimeSlot::new(16, 14), Err(SlotError::Empty { start: 16, end: 14 }));
        assert_eq!(TimeSlot::new(14, 14), Err(SlotError::Empty { start: 14, end: 14 }));
        assert_eq!(TimeSlot::new(5, 8), Err(SlotError::StartOutOfRange(5)));
        assert_eq!(TimeSlot::new(29, 31), Err(SlotError::EndOutOfRange(31)));
        assert!(TimeSlot::new(29, 30).is_ok());
    }

    #[test]
    fn raw_early_morning_equals_late_night_display() {
        let display = BookingWindow::normalize(date("2025-01-25"), 24, 26).unwrap();
        let raw = BookingWindow::normalize(date("2025-01-26"), 0, 2).unwrap();
        assert_eq!(display, raw);
        assert_eq!(raw.date, date("2025-01-25"));
        assert_eq!(display.span(), raw.span());
    }

    #[test]
    fn raw_overnight_end_wraps() {
        let w = BookingWindow::normalize(date("2025-01-25"), 23, 2).unwrap();
        assert_eq!(w.slot, slot(23, 26));
        assert_eq!(w.date, date("2025-01-25"));
    }

    #[test]
    fn raw_early_morning_cannot_cross_rollover() {
        assert!(BookingWindow::normalize(date("2025-01-26"), 4, 8).is_err());
        assert!(BookingWindow::normalize(date("2025-01-26"), 4, 6).is_ok());
    }

    #[test]
    fn span_on_business_date() {
        let s = slot(23, 26).span_on(date("2025-01-25"));
        assert_eq!(s.start.to_string(), "2025-01-25 23:00:00");
        assert_eq!(s.end.to_string(), "2025-01-26 02:00:00");
        assert_eq!(s.duration_minutes(), 180);
    }

    #[test]
    fn span_overlap_minutes() {
        let booked = slot(14, 16).span_on(date("2025-01-25"));
        let used = slot(15, 18).span_on(date("2025-01-25"));
        assert_eq!(used.overlap_minutes(&booked), 60);
        assert!(used.overlaps(&booked));
    }

    #[test]
    fn slot_deserialization_validates() {
        let ok: TimeSlot = serde_json::from_str(r#"{"start":14,"end":16}"#).unwrap();
        assert_eq!(ok, slot(14, 16));
        assert!(serde_json::from_str::<TimeSlot>(r#"{"start":16,"end":14}"#).is_err());
    }

    #[test]
    fn slot_display() {
        assert_eq!(slot(23, 26).to_string(), "23:00-26:00");
    }
}
