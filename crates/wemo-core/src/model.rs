//! WeMo model names and the functional category each maps to
//!
//! The vocabulary of model names reported in device descriptions is closed,
//! so classification is an exhaustive match rather than a lookup table.
//! Anything outside the vocabulary is kept as [`ModelName::Other`] and
//! treated as a switch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Model name as reported by the device description
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelName {
    Bridge,
    CoffeeMaker,
    Dimmer,
    Humidifier,
    Insight,
    LightSwitch,
    Maker,
    Motion,
    Sensor,
    Socket,
    /// Model outside the known vocabulary
    Other(String),
}

impl ModelName {
    pub fn as_str(&self) -> &str {
        match self {
            ModelName::Bridge => "Bridge",
            ModelName::CoffeeMaker => "CoffeeMaker",
            ModelName::Dimmer => "Dimmer",
            ModelName::Humidifier => "Humidifier",
            ModelName::Insight => "Insight",
            ModelName::LightSwitch => "LightSwitch",
            ModelName::Maker => "Maker",
            ModelName::Motion => "Motion",
            ModelName::Sensor => "Sensor",
            ModelName::Socket => "Socket",
            ModelName::Other(name) => name,
        }
    }
}

impl From<&str> for ModelName {
    fn from(s: &str) -> Self {
        match s {
            "Bridge" => ModelName::Bridge,
            "CoffeeMaker" => ModelName::CoffeeMaker,
            "Dimmer" => ModelName::Dimmer,
            "Humidifier" => ModelName::Humidifier,
            "Insight" => ModelName::Insight,
            "LightSwitch" => ModelName::LightSwitch,
            "Maker" => ModelName::Maker,
            "Motion" => ModelName::Motion,
            "Sensor" => ModelName::Sensor,
            "Socket" => ModelName::Socket,
            other => ModelName::Other(other.to_string()),
        }
    }
}

impl From<String> for ModelName {
    fn from(s: String) -> Self {
        ModelName::from(s.as_str())
    }
}

impl From<ModelName> for String {
    fn from(m: ModelName) -> String {
        m.as_str().to_string()
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity platform a device is exposed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FunctionalCategory {
    BinarySensor,
    Fan,
    Light,
    #[default]
    Switch,
}

impl FunctionalCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionalCategory::BinarySensor => "binary_sensor",
            FunctionalCategory::Fan => "fan",
            FunctionalCategory::Light => "light",
            FunctionalCategory::Switch => "switch",
        }
    }

    /// Read-only categories only report state
    pub fn is_readonly(&self) -> bool {
        matches!(self, FunctionalCategory::BinarySensor)
    }
}

impl FromStr for FunctionalCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary_sensor" => Ok(FunctionalCategory::BinarySensor),
            "fan" => Ok(FunctionalCategory::Fan),
            "light" => Ok(FunctionalCategory::Light),
            "switch" => Ok(FunctionalCategory::Switch),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

impl fmt::Display for FunctionalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a model to the category it is exposed as. Never fails.
pub fn classify(model: &ModelName) -> FunctionalCategory {
    match model {
        ModelName::Bridge | ModelName::Dimmer => FunctionalCategory::Light,
        ModelName::Humidifier => FunctionalCategory::Fan,
        ModelName::Motion | ModelName::Sensor => FunctionalCategory::BinarySensor,
        ModelName::CoffeeMaker
        | ModelName::Insight
        | ModelName::LightSwitch
        | ModelName::Maker
        | ModelName::Socket
        | ModelName::Other(_) => FunctionalCategory::Switch,
    }
}

/// Classify a raw model name string
pub fn classify_model_name(model_name: &str) -> FunctionalCategory {
    classify(&ModelName::from(model_name))
}
