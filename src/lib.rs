//! Driver for Plasmatronics PL20/40/60 solar charge controllers
//!
//! The controller speaks a small register protocol over a serial line that is
//! exposed on the network by a relay. This library owns that link: it encodes
//! commands, splits the reply stream into frames, matches replies to requests,
//! keeps the connection alive and turns raw register bytes into readings,
//! including the controller's 30-day history log.

pub mod cli;
pub mod config;
pub mod devices;
pub mod driver;
pub mod output;
pub mod protocol;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use devices::{
    ControllerState, HistoryEntry, HistoryRecord, Model, Reading, SemanticRegistry, SystemConfig,
    SystemVoltage,
};
pub use driver::{
    ConnectionState, Connector, DriverEvent, DriverStats, PlDriver, SolarSnapshot, TcpConnector,
};
pub use output::{ConsoleFormatter, JsonFormatter, ReadingFormatter};
pub use protocol::{Command, Frame, FrameDecoder, MemorySpace};
pub use services::MonitorService;
pub use utils::error::{DriverError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
