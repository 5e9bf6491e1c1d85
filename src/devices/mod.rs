pub mod controller;
pub mod history;
pub mod registry;
pub mod traits;

pub use controller::{ControllerState, Model, SystemConfig, SystemVoltage};
pub use history::{HistoryEntry, HistoryLayout, HistoryReader, HistoryRecord};
pub use registry::{Quantity, Reading, ReadingValue, RegisterDef, SemanticRegistry};
pub use traits::RegisterSource;
