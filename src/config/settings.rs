use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::devices::{HistoryLayout, Model, SystemConfig, SystemVoltage};
use crate::driver::LinkSettings;
use crate::protocol::FrameDecoderConfig;
use crate::utils::error::{DriverError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Identification
    pub driver_name: String,
    pub log_level: String,

    pub device: DeviceConfig,
    pub timing: TimingConfig,
    pub protocol: FrameDecoderConfig,
    pub history: HistoryLayout,
}

/// Where the relay lives and what sits behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub model: Model,
    pub system_voltage: SystemVoltage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub request_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub activity_timeout_ms: u64, // 0 disables the idle check
    pub error_backoff_ms: u64,
    pub poll_interval_seconds: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".to_string(),
            port: 8899,
            model: Model::PL40,
            system_voltage: SystemVoltage::V12,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 1000,
            retry_interval_ms: 1000,
            connect_timeout_ms: 5000,
            activity_timeout_ms: 60_000,
            error_backoff_ms: 2000,
            poll_interval_seconds: 10,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver_name: "PL Link".to_string(),
            log_level: "info".to_string(),
            device: DeviceConfig::default(),
            timing: TimingConfig::default(),
            protocol: FrameDecoderConfig::default(),
            history: HistoryLayout::default(),
        }
    }
}

impl Config {
    /// Starts from `--config` (or defaults) and applies command line overrides.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(host) = matches.get_one::<String>("host") {
            config.device.host = host.clone();
        }
        if let Some(port) = matches.get_one::<String>("port") {
            config.device.port = port
                .parse()
                .map_err(|_| DriverError::ConfigError(format!("Invalid port: {}", port)))?;
        }
        if let Some(model) = matches.get_one::<String>("model") {
            config.device.model = model.parse()?;
        }
        if let Some(volts) = matches.get_one::<String>("system-voltage") {
            let volts: u16 = volts.parse().map_err(|_| {
                DriverError::ConfigError(format!("Invalid system voltage: {}", volts))
            })?;
            config.device.system_voltage = SystemVoltage::try_from(volts)?;
        }
        if let Some(timeout) = matches.get_one::<String>("timeout") {
            config.timing.request_timeout_ms = timeout
                .parse()
                .map_err(|_| DriverError::ConfigError(format!("Invalid timeout: {}", timeout)))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            DriverError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Config = toml::from_str(&content)?;

        if config.driver_name.is_empty() {
            config.driver_name = Config::default().driver_name;
        }

        config.validate()?;
        info!("⚙️  Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DriverError::ConfigError(format!("Cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            DriverError::ConfigError(format!("Cannot write {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.host.trim().is_empty() {
            return Err(DriverError::ConfigError("device.host is empty".to_string()));
        }
        if self.device.port == 0 {
            return Err(DriverError::ConfigError("device.port must be non-zero".to_string()));
        }
        if self.timing.request_timeout_ms == 0 {
            return Err(DriverError::ConfigError(
                "timing.request_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.timing.retry_interval_ms == 0 {
            return Err(DriverError::ConfigError(
                "timing.retry_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.protocol.error_code_min > self.protocol.error_code_max {
            return Err(DriverError::ConfigError(format!(
                "protocol error code range 0x{:02x}..=0x{:02x} is empty",
                self.protocol.error_code_min, self.protocol.error_code_max
            )));
        }
        if (self.protocol.error_code_min..=self.protocol.error_code_max)
            .contains(&crate::protocol::DATA_PREFIX)
        {
            return Err(DriverError::ConfigError(
                "protocol error code range overlaps the data prefix".to_string(),
            ));
        }
        if self.protocol.buffer_capacity < 2 {
            return Err(DriverError::ConfigError(
                "protocol.buffer_capacity must hold at least one data frame".to_string(),
            ));
        }
        self.history.validate()
    }

    pub fn system_config(&self) -> SystemConfig {
        SystemConfig::new(self.device.model, self.device.system_voltage)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.timing.poll_interval_seconds.max(1))
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            retry_interval: Duration::from_millis(self.timing.retry_interval_ms),
            connect_timeout: Duration::from_millis(self.timing.connect_timeout_ms),
            activity_timeout: match self.timing.activity_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            error_backoff: Duration::from_millis(self.timing.error_backoff_ms),
            decoder: self.protocol.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorFrameWidth, MemorySpace};

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_millis(1000));
        assert_eq!(config.link_settings().retry_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [device]
            host = "10.0.0.7"
            model = "PL60"
            system_voltage = 48

            [timing]
            activity_timeout_ms = 0

            [protocol]
            error_code_max = 0x85
            error_frame_width = "with_trailer"

            [history]
            space = "ram"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.host, "10.0.0.7");
        assert_eq!(config.device.port, 8899);
        assert_eq!(config.device.model, Model::PL60);
        assert_eq!(config.system_config().voltage_ratio(), 4.0);
        assert_eq!(config.link_settings().activity_timeout, None);
        assert_eq!(config.protocol.error_code_min, 0x80);
        assert_eq!(config.protocol.error_code_max, 0x85);
        assert_eq!(config.protocol.error_frame_width, ErrorFrameWidth::WithTrailer);
        assert_eq!(config.history.space, MemorySpace::Ram);
        assert_eq!(config.history.log_start, 0x2E);
    }

    #[test]
    fn test_bad_system_voltage_is_rejected() {
        let parsed: std::result::Result<Config, _> = toml::from_str(
            r#"
            [device]
            system_voltage = 36
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_error_range_overlapping_prefix_is_rejected() {
        let mut config = Config::default();
        config.protocol.error_code_max = 0xD0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_error_range_may_exclude_loopback_reply() {
        let mut config = Config::default();
        config.protocol.error_code_min = 0x81;
        config.protocol.error_frame_width = ErrorFrameWidth::WithTrailer;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!("pl_link_{}.toml", uuid::Uuid::new_v4()));
        let mut config = Config::default();
        config.device.host = "relay.local".to_string();
        config.device.system_voltage = SystemVoltage::V24;
        config.save_to_file(&path).unwrap();

        let reloaded = Config::from_file(&path).unwrap();
        assert_eq!(reloaded.device.host, "relay.local");
        assert_eq!(reloaded.device.system_voltage, SystemVoltage::V24);
        std::fs::remove_file(&path).unwrap();
    }
}
