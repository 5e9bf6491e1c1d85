use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::error::DriverError;

/// Controller models. The model decides how current registers scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Model {
    PL20,
    PL40,
    PL60,
}

impl Model {
    /// Amps per raw count on the current registers.
    pub fn current_multiplier(self) -> f64 {
        match self {
            Model::PL20 => 0.1,
            Model::PL40 => 0.2,
            Model::PL60 => 0.4,
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Model {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PL20" => Ok(Model::PL20),
            "PL40" => Ok(Model::PL40),
            "PL60" => Ok(Model::PL60),
            other => Err(DriverError::ConfigError(format!("Unknown model: {}", other))),
        }
    }
}

/// Nominal battery bank voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum SystemVoltage {
    V12,
    V24,
    V48,
}

impl SystemVoltage {
    pub fn ratio(self) -> f64 {
        match self {
            SystemVoltage::V12 => 1.0,
            SystemVoltage::V24 => 2.0,
            SystemVoltage::V48 => 4.0,
        }
    }

    pub fn volts(self) -> u16 {
        match self {
            SystemVoltage::V12 => 12,
            SystemVoltage::V24 => 24,
            SystemVoltage::V48 => 48,
        }
    }
}

impl TryFrom<u16> for SystemVoltage {
    type Error = DriverError;

    fn try_from(volts: u16) -> Result<Self, Self::Error> {
        match volts {
            12 => Ok(SystemVoltage::V12),
            24 => Ok(SystemVoltage::V24),
            48 => Ok(SystemVoltage::V48),
            other => Err(DriverError::ConfigError(format!(
                "Unsupported system voltage {}V (expected 12, 24 or 48)",
                other
            ))),
        }
    }
}

impl From<SystemVoltage> for u16 {
    fn from(voltage: SystemVoltage) -> Self {
        voltage.volts()
    }
}

impl fmt::Display for SystemVoltage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}V", self.volts())
    }
}

/// Installation facts the driver cannot work out by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub model: Model,
    pub system_voltage: SystemVoltage,
}

impl SystemConfig {
    pub fn new(model: Model, system_voltage: SystemVoltage) -> Self {
        Self { model, system_voltage }
    }

    pub fn voltage_ratio(&self) -> f64 {
        self.system_voltage.ratio()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self::new(Model::PL40, SystemVoltage::V12)
    }
}

/// Regulator state as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    Boost,
    Equalize,
    Absorption,
    Float,
    Restricted,
    Lvd,
    ShortEq,
    Undefined,
    Unknown(u8),
}

impl ControllerState {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ControllerState::Boost,
            1 => ControllerState::Equalize,
            2 => ControllerState::Absorption,
            3 => ControllerState::Float,
            4 => ControllerState::Restricted,
            5 => ControllerState::Lvd,
            6 => ControllerState::ShortEq,
            7 => ControllerState::Undefined,
            other => ControllerState::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::Boost => "BOOST",
            ControllerState::Equalize => "EQUALIZE",
            ControllerState::Absorption => "ABSORPTION",
            ControllerState::Float => "FLOAT",
            ControllerState::Restricted => "RESTRICTED",
            ControllerState::Lvd => "LVD",
            ControllerState::ShortEq => "SHORT_EQ",
            ControllerState::Undefined => "UNDEFINED",
            ControllerState::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_lookup() {
        assert_eq!(ControllerState::from_code(0), ControllerState::Boost);
        assert_eq!(ControllerState::from_code(6).name(), "SHORT_EQ");
        assert_eq!(ControllerState::from_code(7), ControllerState::Undefined);
        assert_eq!(ControllerState::from_code(9).name(), "UNKNOWN");
    }

    #[test]
    fn test_system_voltage_ratio() {
        assert_eq!(SystemVoltage::try_from(24).unwrap().ratio(), 2.0);
        assert_eq!(SystemVoltage::V48.ratio(), 4.0);
        assert!(SystemVoltage::try_from(36).is_err());
    }

    #[test]
    fn test_model_parsing() {
        assert_eq!("pl60".parse::<Model>().unwrap(), Model::PL60);
        assert!("PL80".parse::<Model>().is_err());
        assert_eq!(Model::PL20.current_multiplier(), 0.1);
    }
}
