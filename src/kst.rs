//! Late-night-aware KST calendar.
//!
//! The shop's business day runs 06:00 → 06:00 KST. Hours 00:00–05:59 belong to
//! the *previous* business day and are displayed as 24–29, so a reservation
//! from 23:00 to 02:00 reads as `23–26` on a single business date.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::limits::{BUSINESS_DAY_START_HOUR, MAX_DISPLAY_HOUR};

const KST_OFFSET_SECS: i32 = 9 * 3600;

/// The fixed +09:00 offset. Korea observes no DST.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(KST_OFFSET_SECS).expect("+09:00 is a valid offset")
}

/// Current KST wall-clock time.
pub fn now_kst() -> NaiveDateTime {
    to_kst(Utc::now())
}

pub fn to_kst(instant: DateTime<Utc>) -> NaiveDateTime {
    instant.with_timezone(&kst()).naive_local()
}

/// Source of "now". Swapped for a fixed instant in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> BusinessDate {
        to_business_date(self.now())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        now_kst()
    }
}

/// Always reports the same KST instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid business date {0:?}: expected YYYY-MM-DD")]
pub struct ParseDateError(pub String);

/// A KST civil date naming a business day. Never shifted by UTC arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusinessDate(NaiveDate);

impl BusinessDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn parse(s: &str) -> Result<Self, ParseDateError> {
        // chrono accepts unpadded fields; the wire form is strictly zero-padded.
        let b = s.as_bytes();
        let shaped = b.len() == 10
            && b[4] == b'-'
            && b[7] == b'-'
            && b.iter()
                .enumerate()
                .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit());
        if !shaped {
            return Err(ParseDateError(s.to_string()));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self)
            .map_err(|_| ParseDateError(s.to_string()))
    }

    /// The business date that owns the current instant.
    pub fn today() -> Self {
        to_business_date(now_kst())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn succ(&self) -> Self {
        Self(self.0 + Duration::days(1))
    }

    pub fn pred(&self) -> Self {
        Self(self.0 - Duration::days(1))
    }

    /// Wall-clock instant of a display hour on this business date.
    /// Accepts `MAX_SLOT_END_HOUR` (30) as the exclusive end of the day.
    pub fn at_hour(&self, display_hour: u8) -> NaiveDateTime {
        self.0.and_time(NaiveTime::default()) + Duration::hours(i64::from(display_hour))
    }
}

impl fmt::Display for BusinessDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for BusinessDate {
    type Err = ParseDateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BusinessDate {
    type Error = ParseDateError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<BusinessDate> for String {
    fn from(d: BusinessDate) -> Self {
        d.to_string()
    }
}

/// Hour on the 0–29 display clock. 24–29 are 00–05 of the next civil day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DisplayHour(u8);

impl DisplayHour {
    pub fn new(hour: u8) -> Option<Self> {
        (hour <= MAX_DISPLAY_HOUR).then_some(Self(hour))
    }

    /// Map a raw 0–23 clock hour to the display clock. `None` past 23.
    pub fn from_raw(raw_hour: u8) -> Option<Self> {
        match raw_hour {
            0..BUSINESS_DAY_START_HOUR => Some(Self(raw_hour + 24)),
            BUSINESS_DAY_START_HOUR..24 => Some(Self(raw_hour)),
            _ => None,
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Back to the raw 0–23 clock hour.
    pub fn raw(&self) -> u8 {
        self.0 % 24
    }

    pub fn is_late_night(&self) -> bool {
        self.0 >= 24
    }
}

impl fmt::Display for DisplayHour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:00", self.0)
    }
}

pub fn to_display_hour(raw_hour: u8) -> Option<DisplayHour> {
    DisplayHour::from_raw(raw_hour)
}

/// Business date owning a KST wall-clock instant (06:00 rollover).
pub fn to_business_date(at: NaiveDateTime) -> BusinessDate {
    let date = BusinessDate(at.date());
    if (at.hour() as u8) < BUSINESS_DAY_START_HOUR {
        date.pred()
    } else {
        date
    }
}

/// Minutes elapsed since 00:00 of the owning business date, so 01:30 on the
/// following civil day reads as `25 * 60 + 30`.
pub fn business_minutes(at: NaiveDateTime) -> (BusinessDate, i64) {
    let date = to_business_date(at);
    let minutes = (at - date.at_hour(0)).num_minutes();
    (date, minutes)
}
