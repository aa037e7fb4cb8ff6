//! Simulated device table.

use serde::{Deserialize, Serialize};

/// Device type reported by every built-in simulated device.
pub const DEFAULT_DEVICE_TYPE: &str = "sensor";

/// One simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Device identifier (e.g., "device1").
    pub device_id: String,
    /// Room the device lives in.
    pub room: String,
    /// Device type label.
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

fn default_device_type() -> String {
    DEFAULT_DEVICE_TYPE.to_string()
}

impl DeviceEntry {
    pub fn new(device_id: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            room: room.into(),
            device_type: default_device_type(),
        }
    }

    pub fn with_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }
}

/// Ordered, read-only set of simulated devices.
///
/// Cycles visit devices in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTable {
    devices: Vec<DeviceEntry>,
}

impl DeviceTable {
    pub fn new(devices: Vec<DeviceEntry>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[DeviceEntry] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Distinct rooms, in first-seen order.
    pub fn rooms(&self) -> Vec<&str> {
        let mut rooms: Vec<&str> = Vec::new();
        for device in &self.devices {
            if !rooms.contains(&device.room.as_str()) {
                rooms.push(&device.room);
            }
        }
        rooms
    }
}

impl Default for DeviceTable {
    /// Eight devices spread over four rooms.
    fn default() -> Self {
        Self::new(vec![
            DeviceEntry::new("device1", "living_room"),
            DeviceEntry::new("device2", "living_room"),
            DeviceEntry::new("device3", "bedroom"),
            DeviceEntry::new("device4", "kitchen"),
            DeviceEntry::new("device5", "bedroom"),
            DeviceEntry::new("device6", "bathroom"),
            DeviceEntry::new("device7", "bedroom"),
            DeviceEntry::new("device8", "bathroom"),
        ])
    }
}

impl From<Vec<DeviceEntry>> for DeviceTable {
    fn from(devices: Vec<DeviceEntry>) -> Self {
        Self::new(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let table = DeviceTable::default();
        assert_eq!(table.len(), 8);
        assert_eq!(
            table.rooms(),
            vec!["living_room", "bedroom", "kitchen", "bathroom"]
        );
        assert!(
            table
                .devices()
                .iter()
                .all(|d| d.device_type == DEFAULT_DEVICE_TYPE)
        );
    }

    #[test]
    fn test_device_entry_default_type_from_json5() {
        let entry: DeviceEntry =
            json5::from_str(r#"{ device_id: "plug1", room: "garage" }"#).unwrap();
        assert_eq!(entry, DeviceEntry::new("plug1", "garage"));

        let entry: DeviceEntry = json5::from_str(
            r#"{ device_id: "plug1", room: "garage", device_type: "smart-plug" }"#,
        )
        .unwrap();
        assert_eq!(entry.device_type, "smart-plug");
    }
}
