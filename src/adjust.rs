use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::error::AdjustError;
use crate::kst::Clock;
use crate::limits::{CHARGE_UNIT_MINUTES, MAX_ADJUSTMENT_SPAN_MINUTES, MAX_REASON_DETAIL_LEN};
use crate::model::*;
use crate::observability;
use crate::slot::Span;
use crate::store::{AuditStore, PricingLookup, ReservationStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentRequest {
    pub reservation_id: ReservationId,
    /// KST wall-clock times the device was actually used.
    pub actual_start: NaiveDateTime,
    pub actual_end: NaiveDateTime,
    /// Reason code, e.g. `early_finish`.
    pub reason: String,
    pub reason_detail: Option<String>,
    pub adjusted_by: UserId,
}

/// Minutes billed for `actual` against the `booked` window.
///
/// Time outside the window is always billed. Time inside the window is billed
/// in full unless `reason` allows a discount, in which case only the part
/// actually used counts. The sum rounds up to the charge unit.
pub fn chargeable_minutes(booked: &Span, actual: &Span, reason: AdjustmentReason) -> i64 {
    let inside = actual.overlap_minutes(booked);
    let overtime = actual.duration_minutes() - inside;
    let base = if reason.permits_discount() {
        inside
    } else {
        booked.duration_minutes()
    };
    round_up_to_unit(base + overtime)
}

fn round_up_to_unit(minutes: i64) -> i64 {
    let unit = CHARGE_UNIT_MINUTES;
    (minutes.max(0) + unit - 1) / unit * unit
}

pub struct TimeAdjustmentService {
    reservations: Arc<dyn ReservationStore>,
    audit: Arc<dyn AuditStore>,
    pricing: Arc<dyn PricingLookup>,
    clock: Arc<dyn Clock>,
}

impl TimeAdjustmentService {
    pub fn new(
        reservations: Arc<dyn ReservationStore>,
        audit: Arc<dyn AuditStore>,
        pricing: Arc<dyn PricingLookup>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { reservations, audit, pricing, clock }
    }

    pub async fn adjust(&self, req: AdjustmentRequest) -> Result<TimeAdjustmentRecord, AdjustError> {
        let result = self.adjust_inner(&req).await;
        let outcome = match &result {
            Ok(_) => "adjusted",
            Err(AdjustError::NotFound(_)) => "not_found",
            Err(AdjustError::InvalidStatus(_)) => "invalid_status",
            Err(AdjustError::InvalidTimeRange(_) | AdjustError::InvalidReason(_)) => "invalid_input",
            Err(AdjustError::VersionConflict(_)) => "version_conflict",
            Err(AdjustError::Pricing(_)) => "pricing_error",
            Err(AdjustError::Store(_)) => "store_error",
        };
        metrics::counter!(observability::TIME_ADJUSTMENTS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Ok(rec) => info!(
                reservation_id = %rec.reservation_id,
                reason = %rec.reason,
                chargeable_minutes = rec.chargeable_minutes,
                original_amount = rec.original_amount,
                adjusted_amount = rec.adjusted_amount,
                "time adjusted"
            ),
            Err(AdjustError::Store(e)) => warn!(reservation_id = %req.reservation_id, error = %e, "time adjustment store failure"),
            Err(e) => debug!(reservation_id = %req.reservation_id, error = %e, "time adjustment rejected"),
        }
        result
    }

    /// Every adjustment recorded for the reservation, in append order.
    pub async fn history(&self, reservation_id: ReservationId) -> Result<Vec<TimeAdjustmentRecord>, AdjustError> {
        Ok(self.audit.find_by_reservation(reservation_id).await?)
    }

    async fn adjust_inner(&self, req: &AdjustmentRequest) -> Result<TimeAdjustmentRecord, AdjustError> {
        let reason = AdjustmentReason::parse(&req.reason)
            .ok_or_else(|| AdjustError::InvalidReason(req.reason.clone()))?;
        if req
            .reason_detail
            .as_ref()
            .is_some_and(|d| d.chars().count() > MAX_REASON_DETAIL_LEN)
        {
            return Err(AdjustError::InvalidReason("reason detail too long".into()));
        }
        if req.actual_start >= req.actual_end {
            return Err(AdjustError::InvalidTimeRange(format!(
                "start {} is not before end {}",
                req.actual_start, req.actual_end
            )));
        }
        let actual = Span::new(req.actual_start, req.actual_end);
        if actual.duration_minutes() > MAX_ADJUSTMENT_SPAN_MINUTES {
            return Err(AdjustError::InvalidTimeRange("longer than a day".into()));
        }

        let reservation = self
            .reservations
            .find_by_id(req.reservation_id)
            .await?
            .ok_or(AdjustError::NotFound(req.reservation_id))?;
        if !reservation.status.is_adjustable() {
            return Err(AdjustError::InvalidStatus(reservation.status));
        }

        let booked = reservation.span();
        let chargeable = chargeable_minutes(&booked, &actual, reason);
        let adjusted_amount = self
            .pricing
            .price_for(reservation.device_type_id, reservation.credit_option, chargeable)
            .await?;

        let now = self.clock.now();
        let mut next = reservation.clone();
        next.actual_start = Some(req.actual_start);
        next.actual_end = Some(req.actual_end);
        next.total_amount = adjusted_amount;
        // usage already over: the reservation stops holding its device
        if next.status == ReservationStatus::CheckedIn && req.actual_end <= now {
            next.status = ReservationStatus::Completed;
        }
        let updated = self
            .reservations
            .update_with_version(next, reservation.version)
            .await?;

        let record = TimeAdjustmentRecord {
            id: Ulid::new(),
            reservation_id: reservation.id,
            adjusted_by: req.adjusted_by,
            original_start: booked.start,
            original_end: booked.end,
            actual_start: req.actual_start,
            actual_end: req.actual_end,
            original_minutes: booked.duration_minutes(),
            actual_minutes: actual.duration_minutes(),
            chargeable_minutes: chargeable,
            original_amount: reservation.total_amount,
            adjusted_amount,
            reason,
            reason_detail: req.reason_detail.clone(),
            created_at: now,
        };
        if let Err(e) = self.audit.append(record.clone()).await {
            // no amount change without its audit record
            warn!(reservation_id = %reservation.id, error = %e, "audit append failed, restoring reservation");
            if let Err(restore) = self
                .reservations
                .update_with_version(reservation.clone(), updated.version)
                .await
            {
                error!(
                    reservation_id = %reservation.id,
                    error = %restore,
                    "could not restore reservation after audit failure"
                );
            }
            return Err(e.into());
        }
        Ok(record)
    }
}
