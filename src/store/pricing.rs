use std::collections::HashMap;

use async_trait::async_trait;

use super::PricingLookup;
use crate::error::PricingError;
use crate::model::{CreditOption, DeviceTypeId, Won};

/// Per-hour rate for each `(device type, credit option)`, prorated by minute
/// and rounded up to the next won.
#[derive(Debug, Default, Clone)]
pub struct HourlyRateTable {
    rates: HashMap<(DeviceTypeId, CreditOption), Won>,
}

impl HourlyRateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, device_type_id: DeviceTypeId, option: CreditOption, per_hour: Won) -> Self {
        self.rates.insert((device_type_id, option), per_hour);
        self
    }

    pub fn rate(&self, device_type_id: DeviceTypeId, option: CreditOption) -> Option<Won> {
        self.rates.get(&(device_type_id, option)).copied()
    }
}

#[async_trait]
impl PricingLookup for HourlyRateTable {
    async fn price_for(
        &self,
        device_type_id: DeviceTypeId,
        credit_option: CreditOption,
        minutes: i64,
    ) -> Result<Won, PricingError> {
        let per_hour = self.rate(device_type_id, credit_option).ok_or(PricingError::NoRate {
            device_type: device_type_id,
            credit_option,
        })?;
        let minutes = minutes.max(0);
        Ok((per_hour * minutes + 59) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn prorates_by_minute() {
        let t = Ulid::new();
        let table = HourlyRateTable::new().with_rate(t, CreditOption::Freeplay, 10_000);
        assert_eq!(table.price_for(t, CreditOption::Freeplay, 120).await.unwrap(), 20_000);
        assert_eq!(table.price_for(t, CreditOption::Freeplay, 150).await.unwrap(), 25_000);
        assert_eq!(table.price_for(t, CreditOption::Freeplay, 1).await.unwrap(), 167);
    }

    #[tokio::test]
    async fn missing_rate_is_an_error() {
        let t = Ulid::new();
        let table = HourlyRateTable::new().with_rate(t, CreditOption::Fixed, 8_000);
        let err = table.price_for(t, CreditOption::Unlimited, 60).await.unwrap_err();
        assert_eq!(
            err,
            PricingError::NoRate { device_type: t, credit_option: CreditOption::Unlimited }
        );
    }
}
