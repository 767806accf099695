//! Provisioned-device registry
//!
//! Maps each device to the dedicated TCP port its listener binds. The
//! bundled loader reads a JSON array of devices; lookups are in-memory
//! afterwards.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A provisioned device
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Device {
    pub device_id: String,
    pub display_name: String,
    pub serial: String,
    pub port: u16,
}

/// Registry of provisioned devices
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn from_devices(devices: Vec<Device>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|d| (d.device_id.clone(), d))
                .collect(),
        }
    }

    /// Load the registry from a JSON file holding an array of devices.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading device registry {}", path.display()))?;
        let devices: Vec<Device> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing device registry {}", path.display()))?;
        Ok(Self::from_devices(devices))
    }

    pub fn list_provisioned_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn get_device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
