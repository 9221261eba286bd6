// Counter identity and the sample emitted downstream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vendor::VendorKind;

/// Traffic direction of an octet counter; serializes to "in" / "out".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::In, Direction::Out];

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one monotonic wire counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub device_id: String,
    pub if_index: u32,
    pub direction: Direction,
}

impl CounterKey {
    pub fn new(device_id: impl Into<String>, if_index: u32, direction: Direction) -> Self {
        Self {
            device_id: device_id.into(),
            if_index,
            direction,
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.device_id, self.if_index, self.direction)
    }
}

/// IF-MIB ifOperStatus; serializes to lowercase names (e.g. "up", "lowerlayerdown").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperStatus {
    Up,
    Down,
    Testing,
    Unknown,
    Dormant,
    NotPresent,
    LowerLayerDown,
}

impl OperStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => OperStatus::Up,
            2 => OperStatus::Down,
            3 => OperStatus::Testing,
            4 => OperStatus::Unknown,
            5 => OperStatus::Dormant,
            6 => OperStatus::NotPresent,
            7 => OperStatus::LowerLayerDown,
            _ => return None,
        })
    }
}

/// Reconciled traffic for one counter between two consecutive readings.
/// Rates are derived downstream from `delta_octets` and `interval_seconds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub device_id: String,
    pub interface_index: u32,
    pub interface_name: String,
    pub direction: Direction,
    pub vendor: VendorKind,
    pub delta_octets: u64,
    /// Measured elapsed time since the previous reading, not the nominal interval.
    pub interval_seconds: f64,
    pub timestamp: DateTime<Utc>,
    pub counter_bits: u8,
    /// Wraps reconstructed in this interval (0 when the counter moved forward).
    #[serde(default)]
    pub wraps: u32,
    /// Counter reset detected; `delta_octets` is 0 and the baseline was rebased.
    #[serde(default)]
    pub reset: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oper_status: Option<OperStatus>,
}

impl Sample {
    pub fn key(&self) -> CounterKey {
        CounterKey::new(self.device_id.clone(), self.interface_index, self.direction)
    }
}
