use clap::ArgMatches;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::driver::PlDriver;
use crate::output::ReadingFormatter;
use crate::protocol::MemorySpace;
use crate::services::MonitorService;
use crate::utils::error::DriverError;

/// Accepts `50` or `0x32`.
pub fn parse_address(text: &str) -> Result<u8, DriverError> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse::<u8>(),
    };
    parsed.map_err(|_| DriverError::InvalidData(format!("Invalid register address: {}", text)))
}

pub fn parse_address_list(text: &str) -> Result<Vec<u8>, DriverError> {
    text.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(parse_address)
        .collect()
}

/// Writes a default configuration file. Needs no connection.
pub fn init_config(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    if std::path::Path::new(path).exists() {
        return Err(format!("{} already exists, not overwriting", path).into());
    }
    Config::default().save_to_file(path)?;
    println!("✅ Wrote default configuration to {}", path);
    Ok(())
}

pub async fn handle_subcommands(
    matches: &ArgMatches,
    driver: Arc<PlDriver>,
    formatter: Box<dyn ReadingFormatter>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let timeout = driver.request_timeout();

    if let Some(matches) = matches.subcommand_matches("read") {
        let address = parse_address(
            matches
                .get_one::<String>("address")
                .ok_or("missing register address")?,
        )?;
        let space = if matches.get_flag("eeprom") {
            MemorySpace::Eeprom
        } else {
            MemorySpace::Ram
        };

        info!("🔍 Reading {:?} register {}...", space, address);
        let raw = driver.read_in(space, address, timeout).await?;
        let reading = match space {
            MemorySpace::Ram => driver.registry().decode(address, raw, driver.system()),
            MemorySpace::Eeprom => None,
        };
        print!("{}", formatter.format_register(space, address, raw, reading.as_ref())?);
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("batch") {
        let addresses = parse_address_list(
            matches
                .get_one::<String>("addresses")
                .ok_or("missing register list")?,
        )?;
        info!("📈 Reading {} registers...", addresses.len());
        let values = driver.read_batch(&addresses).await;
        println!("{}", formatter.format_batch(&values)?);
        return Ok(true);
    }

    if matches.subcommand_matches("all").is_some() {
        info!("📊 Reading all known registers...");
        let snapshot = driver.read_all().await;
        print!("{}", formatter.format_header());
        println!("{}", formatter.format_snapshot(&snapshot)?);
        return Ok(true);
    }

    if matches.subcommand_matches("history").is_some() {
        info!("📜 Reading 30-day history, this takes a while...");
        let entries = driver.read_history().await?;
        println!("{}", formatter.format_history(&entries)?);
        return Ok(true);
    }

    if matches.subcommand_matches("test").is_some() {
        let passed = driver.test().await;
        println!("{}", formatter.format_self_test(passed)?);
        if !passed {
            return Err("loopback self-test failed".into());
        }
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("monitor") {
        let interval = match matches.get_one::<String>("interval") {
            Some(seconds) => Duration::from_secs(
                seconds
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid interval: {}", seconds))?
                    .max(1),
            ),
            None => driver.config().poll_interval(),
        };

        let mut service = MonitorService::new(driver.clone(), interval);
        service.set_formatter(formatter);
        let summary = service.run().await?;
        if summary.polls == 0 {
            warn!("⚠️  Monitor stopped before any poll completed");
        }
        return Ok(true);
    }

    Ok(false)
}
