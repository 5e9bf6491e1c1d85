use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The channel was not open when a write was attempted.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// No data frame arrived within the request timeout.
    #[error("Timeout after {timeout_ms} ms waiting for register {address}")]
    Timeout { address: u8, timeout_ms: u64 },

    /// The device emitted an error frame. Advisory, never tied to a request.
    #[error("Device reported error code 0x{0:02x}")]
    ProtocolError(u8),

    /// The connection dropped while the request was outstanding.
    #[error("Channel closed while request was in flight")]
    ChannelClosed,

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DriverError {
    /// Failures that a reconnect or a retry can clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionError(_)
                | DriverError::Timeout { .. }
                | DriverError::ChannelClosed
                | DriverError::CommunicationError(_)
        )
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<toml::de::Error> for DriverError {
    fn from(err: toml::de::Error) -> Self {
        DriverError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for DriverError {
    fn from(err: toml::ser::Error) -> Self {
        DriverError::SerializationError(format!("TOML error: {}", err))
    }
}
