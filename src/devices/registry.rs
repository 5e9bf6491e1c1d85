use serde::Serialize;

use super::controller::{ControllerState, SystemConfig};
use crate::protocol::MemorySpace;

pub const VERSION: u8 = 0;
pub const BATTERY_VOLTAGE: u8 = 50;
pub const BATTERY_TEMPERATURE: u8 = 52;
pub const SOLAR_VOLTAGE: u8 = 53;
pub const CONTROLLER_STATE: u8 = 101;
pub const STATE_OF_CHARGE: u8 = 181;
pub const CHARGE_CURRENT: u8 = 205;
pub const LOAD_CURRENT: u8 = 206;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    BatteryVoltage,
    BatteryTemperature,
    StateOfCharge,
    SolarVoltage,
    ChargeCurrent,
    LoadCurrent,
    ControllerState,
}

impl Quantity {
    pub fn unit(self) -> &'static str {
        match self {
            Quantity::BatteryVoltage | Quantity::SolarVoltage => "V",
            Quantity::BatteryTemperature => "°C",
            Quantity::StateOfCharge => "%",
            Quantity::ChargeCurrent | Quantity::LoadCurrent => "A",
            Quantity::ControllerState => "",
        }
    }
}

/// How a raw byte turns into a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Formula {
    SystemVoltage,
    Offset(f64),
    Identity,
    Scale(f64),
    ModelCurrent,
    StateLookup,
}

impl Formula {
    pub fn apply(self, raw: u8, config: &SystemConfig) -> ReadingValue {
        let raw_f = f64::from(raw);
        match self {
            Formula::SystemVoltage => ReadingValue::Scalar(raw_f * config.voltage_ratio()),
            Formula::Offset(offset) => ReadingValue::Scalar(raw_f + offset),
            Formula::Identity => ReadingValue::Scalar(raw_f),
            Formula::Scale(factor) => ReadingValue::Scalar(raw_f * factor),
            Formula::ModelCurrent => {
                ReadingValue::Scalar(raw_f * config.model.current_multiplier())
            }
            Formula::StateLookup => ReadingValue::State(ControllerState::from_code(raw)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDef {
    pub quantity: Quantity,
    pub space: MemorySpace,
    pub address: u8,
    pub formula: Formula,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Scalar(f64),
    State(ControllerState),
}

impl ReadingValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReadingValue::Scalar(value) => Some(*value),
            ReadingValue::State(_) => None,
        }
    }

    pub fn as_state(&self) -> Option<ControllerState> {
        match self {
            ReadingValue::State(state) => Some(*state),
            ReadingValue::Scalar(_) => None,
        }
    }
}

/// A decoded register value. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub quantity: Quantity,
    pub address: u8,
    pub raw: u8,
    pub value: ReadingValue,
}

/// Table of known registers and their decode formulas.
#[derive(Debug, Clone)]
pub struct SemanticRegistry {
    entries: Vec<RegisterDef>,
}

impl Default for SemanticRegistry {
    fn default() -> Self {
        let ram = |quantity, address, formula| RegisterDef {
            quantity,
            space: MemorySpace::Ram,
            address,
            formula,
        };
        Self {
            entries: vec![
                ram(Quantity::BatteryVoltage, BATTERY_VOLTAGE, Formula::SystemVoltage),
                ram(Quantity::BatteryTemperature, BATTERY_TEMPERATURE, Formula::Offset(-100.0)),
                ram(Quantity::StateOfCharge, STATE_OF_CHARGE, Formula::Identity),
                ram(Quantity::SolarVoltage, SOLAR_VOLTAGE, Formula::Scale(0.5)),
                ram(Quantity::ChargeCurrent, CHARGE_CURRENT, Formula::ModelCurrent),
                ram(Quantity::LoadCurrent, LOAD_CURRENT, Formula::ModelCurrent),
                ram(Quantity::ControllerState, CONTROLLER_STATE, Formula::StateLookup),
            ],
        }
    }
}

impl SemanticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<RegisterDef>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[RegisterDef] {
        &self.entries
    }

    pub fn lookup(&self, address: u8) -> Option<&RegisterDef> {
        self.entries.iter().find(|def| def.address == address)
    }

    pub fn definition(&self, quantity: Quantity) -> Option<&RegisterDef> {
        self.entries.iter().find(|def| def.quantity == quantity)
    }

    /// Decodes `raw` read from `address`. `None` for registers not in the table.
    pub fn decode(&self, address: u8, raw: u8, config: &SystemConfig) -> Option<Reading> {
        self.lookup(address).map(|def| Reading {
            quantity: def.quantity,
            address,
            raw,
            value: def.formula.apply(raw, config),
        })
    }

    pub fn decode_quantity(&self, quantity: Quantity, raw: u8, config: &SystemConfig) -> Option<Reading> {
        self.definition(quantity)
            .and_then(|def| self.decode(def.address, raw, config))
    }

    /// Addresses `read_all` has to fetch, in table order.
    pub fn addresses(&self) -> Vec<u8> {
        self.entries.iter().map(|def| def.address).collect()
    }
}
