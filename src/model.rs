use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::kst::BusinessDate;
use crate::slot::{BookingWindow, Span, TimeSlot};

pub type ReservationId = Ulid;
pub type UserId = Ulid;
pub type DeviceId = Ulid;
pub type DeviceTypeId = Ulid;

/// Korean won. No minor unit.
pub type Won = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Approved,
    CheckedIn,
    Completed,
    Cancelled,
    Rejected,
    NoShow,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::CheckedIn => "checked_in",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::NoShow => "no_show",
        }
    }

    /// Only these hold a device for conflict checks and rental limits.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Approved | Self::CheckedIn)
    }

    /// Statuses in which an actual-time override means something.
    pub fn is_adjustable(&self) -> bool {
        matches!(self, Self::Approved | Self::CheckedIn | Self::Completed)
    }

    pub fn can_transition_to(&self, to: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, to),
            (Pending, Approved | Rejected | Cancelled)
                | (Approved, CheckedIn | Cancelled | NoShow)
                | (CheckedIn, Completed)
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditOption {
    Fixed,
    Freeplay,
    Unlimited,
}

impl CreditOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Freeplay => "freeplay",
            Self::Unlimited => "unlimited",
        }
    }
}

impl fmt::Display for CreditOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is acting on a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    User(UserId),
    Admin(UserId),
}

impl Actor {
    pub fn id(&self) -> UserId {
        match self {
            Actor::User(id) | Actor::Admin(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub user_id: UserId,
    /// Device holding the slot. Device-type requests get one assigned at
    /// admission so capacity is actually reserved.
    pub device_id: DeviceId,
    pub device_type_id: DeviceTypeId,
    /// False when the customer asked for a type and the device may be
    /// reassigned at approval.
    pub device_pinned: bool,
    pub date: BusinessDate,
    pub slot: TimeSlot,
    pub credit_option: CreditOption,
    pub status: ReservationStatus,
    pub actual_start: Option<NaiveDateTime>,
    pub actual_end: Option<NaiveDateTime>,
    pub total_amount: Won,
    /// Bumped by the store on every write.
    pub version: u64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn window(&self) -> BookingWindow {
        BookingWindow { date: self.date, slot: self.slot }
    }

    /// Booked wall-clock span.
    pub fn span(&self) -> Span {
        self.slot.span_on(self.date)
    }

    /// Same device, same business date, overlapping slots, both active.
    pub fn conflicts_with(&self, other: &Reservation) -> bool {
        self.id != other.id
            && self.is_active()
            && other.is_active()
            && self.device_id == other.device_id
            && self.date == other.date
            && self.slot.overlaps(&other.slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleEventType {
    EarlyOpen,
    Overnight,
    Other(String),
}

impl ScheduleEventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::EarlyOpen => "early_open",
            Self::Overnight => "overnight",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for ScheduleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSource {
    ReservationAuto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    pub id: Ulid,
    pub date: BusinessDate,
    pub event_type: ScheduleEventType,
    pub title: String,
    pub hours: TimeSlot,
    pub is_auto_generated: bool,
    pub source_type: ScheduleSource,
    pub affects_reservation: bool,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    AdminLate,
    SystemError,
    CustomerExtend,
    EarlyFinish,
    Other,
}

impl AdjustmentReason {
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "admin_late" => Some(Self::AdminLate),
            "system_error" => Some(Self::SystemError),
            "customer_extend" => Some(Self::CustomerExtend),
            "early_finish" => Some(Self::EarlyFinish),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdminLate => "admin_late",
            Self::SystemError => "system_error",
            Self::CustomerExtend => "customer_extend",
            Self::EarlyFinish => "early_finish",
            Self::Other => "other",
        }
    }

    /// Label shown to staff and customers.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AdminLate => "관리자 지각",
            Self::SystemError => "시스템 오류",
            Self::CustomerExtend => "고객 요청 연장",
            Self::EarlyFinish => "조기 종료",
            Self::Other => "기타",
        }
    }

    /// Whether the charge may drop below the booked duration.
    pub fn permits_discount(&self) -> bool {
        matches!(self, Self::EarlyFinish | Self::AdminLate | Self::SystemError)
    }
}

impl fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit entry written by every time adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAdjustmentRecord {
    pub id: Ulid,
    pub reservation_id: ReservationId,
    pub adjusted_by: UserId,
    pub original_start: NaiveDateTime,
    pub original_end: NaiveDateTime,
    pub actual_start: NaiveDateTime,
    pub actual_end: NaiveDateTime,
    pub original_minutes: i64,
    pub actual_minutes: i64,
    pub chargeable_minutes: i64,
    pub original_amount: Won,
    pub adjusted_amount: Won,
    pub reason: AdjustmentReason,
    pub reason_detail: Option<String>,
    pub created_at: NaiveDateTime,
}

/// WAL record: every store mutation, flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationInserted(Reservation),
    ReservationUpdated(Reservation),
    ScheduleEventSaved(ScheduleEvent),
    ScheduleEventDeleted { id: Ulid, date: BusinessDate },
    AdjustmentAppended(TimeAdjustmentRecord),
}
