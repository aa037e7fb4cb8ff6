use serde::{Deserialize, Serialize};

/// A single energy reading reported by a smart-home device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Device identifier (e.g., "device1").
    pub device_id: String,

    /// Room the device is installed in (e.g., "living_room").
    pub room: String,

    /// Kind of device (e.g., "sensor").
    pub device_type: String,

    /// Energy consumed, as reported by the device.
    pub energy_consumption: f64,
}

impl Reading {
    /// Create a new reading.
    pub fn new(
        device_id: impl Into<String>,
        room: impl Into<String>,
        device_type: impl Into<String>,
        energy_consumption: f64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            room: room.into(),
            device_type: device_type.into(),
            energy_consumption,
        }
    }

    /// The label tuple this reading aggregates under.
    pub fn label_key(&self) -> LabelKey {
        LabelKey {
            device_id: self.device_id.clone(),
            room: self.room.clone(),
            device_type: self.device_type.clone(),
        }
    }
}

/// Identity of one metric series: `(device, room, type)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelKey {
    pub device_id: String,
    pub room: String,
    pub device_type: String,
}

impl LabelKey {
    pub fn new(
        device_id: impl Into<String>,
        room: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            room: room.into(),
            device_type: device_type.into(),
        }
    }

    /// Label pairs in exposition order, using the exported label names.
    pub fn labels(&self) -> [(&'static str, &str); 3] {
        [
            ("device", self.device_id.as_str()),
            ("room", self.room.as_str()),
            ("type", self.device_type.as_str()),
        ]
    }
}

impl std::fmt::Display for LabelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.room, self.device_id, self.device_type)
    }
}
