use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::Reservation;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Created,
    Approved,
    Cancelled,
    StatusChanged,
    TimeAdjusted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub reservation: Reservation,
}

/// In-process fan-out of reservation lifecycle events. Lossy: a lagging
/// subscriber misses events, so nothing that must converge listens here.
pub struct LifecycleHub {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn publish(&self, kind: LifecycleKind, reservation: &Reservation) {
        let _ = self.sender.send(LifecycleEvent {
            kind,
            reservation: reservation.clone(),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kst::{now_kst, BusinessDate};
    use crate::model::*;
    use crate::slot::TimeSlot;
    use ulid::Ulid;

    fn reservation() -> Reservation {
        let now = now_kst();
        Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            device_id: Ulid::new(),
            device_type_id: Ulid::new(),
            device_pinned: true,
            date: BusinessDate::parse("2025-01-25").unwrap(),
            slot: TimeSlot::new(14, 16).unwrap(),
            credit_option: CreditOption::Fixed,
            status: ReservationStatus::Pending,
            actual_start: None,
            actual_end: None,
            total_amount: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = LifecycleHub::new();
        let mut rx = hub.subscribe();
        let r = reservation();
        hub.publish(LifecycleKind::Created, &r);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, LifecycleKind::Created);
        assert_eq!(received.reservation, r);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = LifecycleHub::new();
        assert_eq!(hub.subscriber_count(), 0);
        hub.publish(LifecycleKind::Cancelled, &reservation());
    }
}
