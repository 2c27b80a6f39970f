//! Humidifier fan modes and target humidity levels
//!
//! The humidifier has six fan modes but the fan platform only knows four
//! speeds, so `Low` and `High` share a speed with their neighbours. Going
//! back from a speed picks `Off`, `Minimum`, `Medium` or `Maximum`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fan mode as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FanMode {
    Off = 0,
    Minimum = 1,
    Low = 2,
    Medium = 3,
    High = 4,
    Maximum = 5,
}

impl FanMode {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(FanMode::Off),
            1 => Some(FanMode::Minimum),
            2 => Some(FanMode::Low),
            3 => Some(FanMode::Medium),
            4 => Some(FanMode::High),
            5 => Some(FanMode::Maximum),
            _ => None,
        }
    }

    pub fn speed(self) -> FanSpeed {
        match self {
            FanMode::Off => FanSpeed::Off,
            FanMode::Minimum | FanMode::Low => FanSpeed::Low,
            FanMode::Medium => FanSpeed::Medium,
            FanMode::High | FanMode::Maximum => FanSpeed::High,
        }
    }
}

/// Speed exposed on the fan platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanSpeed {
    Off,
    Low,
    Medium,
    High,
}

impl FanSpeed {
    pub const ALL: [FanSpeed; 4] = [FanSpeed::Off, FanSpeed::Low, FanSpeed::Medium, FanSpeed::High];

    pub fn fan_mode(self) -> FanMode {
        match self {
            FanSpeed::Off => FanMode::Off,
            FanSpeed::Low => FanMode::Minimum,
            FanSpeed::Medium => FanMode::Medium,
            FanSpeed::High => FanMode::Maximum,
        }
    }
}

impl fmt::Display for FanSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FanSpeed::Off => "off",
            FanSpeed::Low => "low",
            FanSpeed::Medium => "medium",
            FanSpeed::High => "high",
        };
        f.write_str(s)
    }
}

/// Target humidity levels the device accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DesiredHumidity {
    FortyFivePercent = 0,
    FiftyPercent = 1,
    FiftyFivePercent = 2,
    SixtyPercent = 3,
    OneHundredPercent = 4,
}

#[derive(Debug, Clone, Copy, Error, PartialEq)]
#[error("target humidity {0} is outside 0..=100")]
pub struct HumidityOutOfRange(pub f64);

impl DesiredHumidity {
    /// Bucket a requested percentage into the nearest supported level
    pub fn from_percent(target: f64) -> Result<Self, HumidityOutOfRange> {
        if !(0.0..=100.0).contains(&target) {
            return Err(HumidityOutOfRange(target));
        }
        Ok(if target < 50.0 {
            DesiredHumidity::FortyFivePercent
        } else if target < 55.0 {
            DesiredHumidity::FiftyPercent
        } else if target < 60.0 {
            DesiredHumidity::FiftyFivePercent
        } else if target < 100.0 {
            DesiredHumidity::SixtyPercent
        } else {
            DesiredHumidity::OneHundredPercent
        })
    }

    pub fn percent(self) -> u8 {
        match self {
            DesiredHumidity::FortyFivePercent => 45,
            DesiredHumidity::FiftyPercent => 50,
            DesiredHumidity::FiftyFivePercent => 55,
            DesiredHumidity::SixtyPercent => 60,
            DesiredHumidity::OneHundredPercent => 100,
        }
    }
}

/// Remembers the last non-off fan mode so turning on restores it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanModeMemory {
    current: FanMode,
    last_on: FanMode,
}

impl Default for FanModeMemory {
    fn default() -> Self {
        Self {
            current: FanMode::Off,
            last_on: FanMode::Medium,
        }
    }
}

impl FanModeMemory {
    /// Record a mode reported by the device
    pub fn observe(&mut self, mode: FanMode) {
        self.current = mode;
        if mode != FanMode::Off {
            self.last_on = mode;
        }
    }

    pub fn current(&self) -> FanMode {
        self.current
    }

    /// Mode to apply for a turn-on request, with or without an explicit speed
    pub fn turn_on_mode(&self, speed: Option<FanSpeed>) -> FanMode {
        match speed {
            Some(speed) => speed.fan_mode(),
            None => self.last_on,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_to_speed_reuses_low_and_high() {
        assert_eq!(FanMode::Off.speed(), FanSpeed::Off);
        assert_eq!(FanMode::Minimum.speed(), FanSpeed::Low);
        assert_eq!(FanMode::Low.speed(), FanSpeed::Low);
        assert_eq!(FanMode::Medium.speed(), FanSpeed::Medium);
        assert_eq!(FanMode::High.speed(), FanSpeed::High);
        assert_eq!(FanMode::Maximum.speed(), FanSpeed::High);
    }

    #[test]
    fn test_speed_to_mode() {
        assert_eq!(FanSpeed::Low.fan_mode(), FanMode::Minimum);
        assert_eq!(FanSpeed::High.fan_mode(), FanMode::Maximum);
        for speed in FanSpeed::ALL {
            assert_eq!(speed.fan_mode().speed(), speed);
        }
    }

    #[test]
    fn test_humidity_buckets() {
        let cases = [
            (0.0, 45),
            (49.9, 45),
            (50.0, 50),
            (54.0, 50),
            (55.0, 55),
            (59.5, 55),
            (60.0, 60),
            (99.0, 60),
            (100.0, 100),
        ];
        for (target, expected) in cases {
            assert_eq!(
                DesiredHumidity::from_percent(target).unwrap().percent(),
                expected,
                "target {target}"
            );
        }
        assert!(DesiredHumidity::from_percent(-1.0).is_err());
        assert!(DesiredHumidity::from_percent(101.0).is_err());
    }

    #[test]
    fn test_turn_on_restores_last_mode() {
        let mut memory = FanModeMemory::default();
        assert_eq!(memory.turn_on_mode(None), FanMode::Medium);

        memory.observe(FanMode::High);
        memory.observe(FanMode::Off);
        assert_eq!(memory.current(), FanMode::Off);
        assert_eq!(memory.turn_on_mode(None), FanMode::High);
        assert_eq!(memory.turn_on_mode(Some(FanSpeed::Low)), FanMode::Minimum);
    }

    #[test]
    fn test_from_raw() {
        assert_eq!(FanMode::from_raw(5), Some(FanMode::Maximum));
        assert_eq!(FanMode::from_raw(6), None);
    }
}
