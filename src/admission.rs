//! The concurrency core: turns a booking request into a committed
//! reservation, or a typed rejection.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::availability::SlotAvailabilityIndex;
use crate::error::AdmissionError;
use crate::kst::{BusinessDate, Clock};
use crate::limits::MAX_ADMISSION_ATTEMPTS;
use crate::model::*;
use crate::observability;
use crate::rental_limit::{RentalCap, RentalLimitGuard};
use crate::slot::{BookingWindow, TimeSlot};
use crate::store::{DeviceCatalog, DeviceTypeInfo, PricingLookup, ReservationStore};

/// What the customer asked for: a specific machine, or any machine of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector {
    Device(DeviceId),
    DeviceType(DeviceTypeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub user_id: UserId,
    pub target: DeviceSelector,
    pub date: BusinessDate,
    pub slot: TimeSlot,
    pub credit_option: CreditOption,
    /// Overrides the configured admission deadline.
    pub timeout: Option<Duration>,
}

impl AdmissionRequest {
    pub fn new(
        user_id: UserId,
        target: DeviceSelector,
        date: BusinessDate,
        slot: TimeSlot,
        credit_option: CreditOption,
    ) -> Self {
        Self { user_id, target, date, slot, credit_option, timeout: None }
    }

    /// Build from raw clock hours on a civil date. `00:00–05:59` starts land on
    /// the previous business date; `23 → 2` wraps to `23–26`.
    pub fn from_raw_hours(
        user_id: UserId,
        target: DeviceSelector,
        civil_date: BusinessDate,
        start: u8,
        end: u8,
        credit_option: CreditOption,
    ) -> Result<Self, AdmissionError> {
        let window = BookingWindow::normalize(civil_date, start, end)
            .map_err(|e| AdmissionError::InvalidSlot(e.to_string()))?;
        Ok(Self::new(user_id, target, window.date, window.slot, credit_option))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct AdmissionController {
    reservations: Arc<dyn ReservationStore>,
    catalog: Arc<dyn DeviceCatalog>,
    pricing: Arc<dyn PricingLookup>,
    availability: SlotAvailabilityIndex,
    limits: RentalLimitGuard,
    clock: Arc<dyn Clock>,
    advance_cutoff: chrono::Duration,
    default_timeout: Duration,
}

impl AdmissionController {
    pub fn new(
        reservations: Arc<dyn ReservationStore>,
        catalog: Arc<dyn DeviceCatalog>,
        pricing: Arc<dyn PricingLookup>,
        clock: Arc<dyn Clock>,
        advance_cutoff: chrono::Duration,
        default_timeout: Duration,
    ) -> Self {
        Self {
            availability: SlotAvailabilityIndex::new(reservations.clone(), catalog.clone()),
            limits: RentalLimitGuard::new(reservations.clone(), catalog.clone(), clock.clone()),
            reservations,
            catalog,
            pricing,
            clock,
            advance_cutoff,
            default_timeout,
        }
    }

    pub fn availability(&self) -> &SlotAvailabilityIndex {
        &self.availability
    }

    pub fn limits(&self) -> &RentalLimitGuard {
        &self.limits
    }

    pub async fn admit(&self, req: AdmissionRequest) -> Result<Reservation, AdmissionError> {
        let started = std::time::Instant::now();
        let result = self.admit_inner(&req).await;

        let outcome = match &result {
            Ok(_) => "admitted",
            Err(e) => e.outcome_label(),
        };
        metrics::counter!(observability::ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::ADMISSION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(r) => info!(
                reservation_id = %r.id,
                user_id = %r.user_id,
                device_id = %r.device_id,
                date = %r.date,
                slot = %r.slot,
                "reservation admitted"
            ),
            Err(AdmissionError::Store(e)) => {
                warn!(user_id = %req.user_id, date = %req.date, error = %e, "admission store failure")
            }
            Err(e) => debug!(user_id = %req.user_id, date = %req.date, slot = %req.slot, error = %e, "admission rejected"),
        }
        result
    }

    async fn admit_inner(&self, req: &AdmissionRequest) -> Result<Reservation, AdmissionError> {
        let deadline = Instant::now() + req.timeout.unwrap_or(self.default_timeout);

        let earliest = self.clock.now() + self.advance_cutoff;
        if req.slot.span_on(req.date).start < earliest {
            return Err(AdmissionError::InvalidSlot("past cutoff".into()));
        }

        // Everything before the insert is read-only, so abandoning it on the
        // deadline is safe. The insert bounds its own lock waits.
        let (type_info, candidates, cap, total_amount) = timeout_at(deadline, self.prepare(req))
            .await
            .map_err(|_| AdmissionError::Timeout)??;

        let pinned = matches!(req.target, DeviceSelector::Device(_));
        for device_id in candidates.into_iter().take(MAX_ADMISSION_ATTEMPTS) {
            let now = self.clock.now();
            let draft = Reservation {
                id: Ulid::new(),
                user_id: req.user_id,
                device_id,
                device_type_id: type_info.id,
                device_pinned: pinned,
                date: req.date,
                slot: req.slot,
                credit_option: req.credit_option,
                status: ReservationStatus::Pending,
                actual_start: None,
                actual_end: None,
                total_amount,
                version: 0,
                created_at: now,
                updated_at: now,
            };
            match self.reservations.insert_if_no_conflict(draft, cap, deadline).await {
                Ok(r) => return Ok(r),
                Err(e) => match AdmissionError::from(e) {
                    // someone beat us to this device; try the next one
                    AdmissionError::Conflict if !pinned => {
                        debug!(%device_id, "candidate taken, trying next");
                    }
                    other => return Err(other),
                },
            }
        }
        Err(AdmissionError::Conflict)
    }

    /// Resolve the device type, validate hours, price the slot and pick
    /// candidate devices.
    async fn prepare(
        &self,
        req: &AdmissionRequest,
    ) -> Result<(DeviceTypeInfo, Vec<DeviceId>, Option<RentalCap>, Won), AdmissionError>
    {
        let type_id = match req.target {
            DeviceSelector::Device(id) => {
                let device = self
                    .catalog
                    .device(id)
                    .await
                    .map_err(AdmissionError::Store)?
                    .ok_or(AdmissionError::UnknownDevice(id))?;
                if !device.rentable {
                    return Err(AdmissionError::DeviceTypeExhausted);
                }
                device.device_type_id
            }
            DeviceSelector::DeviceType(id) => id,
        };
        let type_info = self
            .catalog
            .device_type(type_id)
            .await
            .map_err(AdmissionError::Store)?
            .ok_or(AdmissionError::UnknownDeviceType(type_id))?;

        if !type_info.operating_hours.contains(&req.slot) {
            return Err(AdmissionError::DeviceTypeExhausted);
        }

        let candidates = match req.target {
            DeviceSelector::Device(id) => vec![id],
            DeviceSelector::DeviceType(id) => {
                if self
                    .catalog
                    .devices_of_type(id)
                    .await
                    .map_err(AdmissionError::Store)?
                    .is_empty()
                {
                    return Err(AdmissionError::DeviceTypeExhausted);
                }
                let free = self
                    .availability
                    .find_available_devices(id, req.date, &req.slot)
                    .await
                    .map_err(AdmissionError::Store)?;
                if free.is_empty() {
                    return Err(AdmissionError::Conflict);
                }
                free
            }
        };

        let cap = self.limits.cap_for(type_id).await?;
        let total_amount = self
            .pricing
            .price_for(type_id, req.credit_option, req.slot.duration_minutes())
            .await?;

        Ok((type_info, candidates, cap, total_amount))
    }
}
