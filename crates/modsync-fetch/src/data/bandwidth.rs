use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedUnit {
    #[default]
    Bytes,
    Kib,
    Mib,
}

impl SpeedUnit {
    fn multiplier(self) -> u64 {
        match self {
            SpeedUnit::Bytes => 1,
            SpeedUnit::Kib => 1024,
            SpeedUnit::Mib => 1024 * 1024,
        }
    }
}

/// A total download ceiling. A value of zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BandwidthLimit {
    pub value: u64,
    pub unit: SpeedUnit,
}

impl BandwidthLimit {
    pub const UNLIMITED: Self = Self {
        value: 0,
        unit: SpeedUnit::Bytes,
    };

    pub fn new(value: u64, unit: SpeedUnit) -> Self { Self { value, unit } }

    pub fn bytes_per_second(value: u64) -> Self { Self::new(value, SpeedUnit::Bytes) }

    pub fn is_unlimited(&self) -> bool { self.value == 0 }

    pub fn as_bytes_per_second(&self) -> u64 { self.value.saturating_mul(self.unit.multiplier()) }

    /// Share of the ceiling each of `active` concurrent transfers gets.
    ///
    /// Returns 0 (unlimited) when no ceiling is set; otherwise never less
    /// than one byte per second.
    pub fn per_slot(&self, active: usize) -> u64 {
        if self.is_unlimited() {
            return 0;
        }
        let divisor = active.max(1) as u64;
        (self.as_bytes_per_second() / divisor).max(1)
    }
}
