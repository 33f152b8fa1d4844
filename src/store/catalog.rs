use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::DeviceCatalog;
use crate::error::StoreError;
use crate::model::{DeviceId, DeviceTypeId};
use crate::slot::TimeSlot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTypeInfo {
    pub id: DeviceTypeId,
    pub name: String,
    /// Count cap on a user's active rentals of this type. `None` is uncapped.
    pub max_concurrent_rentals: Option<u32>,
    /// Hours in which devices of this type can be booked.
    pub operating_hours: TimeSlot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub device_type_id: DeviceTypeId,
    /// False while the machine is under maintenance or retired.
    pub rentable: bool,
}

/// Fixed in-memory catalog, loaded once at startup.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    types: HashMap<DeviceTypeId, DeviceTypeInfo>,
    devices: HashMap<DeviceId, DeviceInfo>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, info: DeviceTypeInfo) -> Self {
        self.types.insert(info.id, info);
        self
    }

    pub fn with_device(mut self, info: DeviceInfo) -> Self {
        self.devices.insert(info.id, info);
        self
    }
}

#[async_trait]
impl DeviceCatalog for StaticCatalog {
    async fn device(&self, id: DeviceId) -> Result<Option<DeviceInfo>, StoreError> {
        Ok(self.devices.get(&id).cloned())
    }

    async fn device_type(&self, id: DeviceTypeId) -> Result<Option<DeviceTypeInfo>, StoreError> {
        Ok(self.types.get(&id).cloned())
    }

    async fn devices_of_type(&self, id: DeviceTypeId) -> Result<Vec<DeviceInfo>, StoreError> {
        let mut devices: Vec<DeviceInfo> = self
            .devices
            .values()
            .filter(|d| d.device_type_id == id && d.rentable)
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }
}
