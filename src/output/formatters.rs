use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;

use crate::devices::{HistoryEntry, Reading, ReadingValue};
use crate::driver::{DriverStats, SolarSnapshot};
use crate::protocol::MemorySpace;
use crate::utils::error::{DriverError, Result};

pub trait ReadingFormatter: Send + Sync {
    fn format_header(&self) -> String;
    fn format_register(
        &self,
        space: MemorySpace,
        address: u8,
        raw: u8,
        reading: Option<&Reading>,
    ) -> Result<String>;
    fn format_batch(&self, values: &BTreeMap<u8, Option<u8>>) -> Result<String>;
    fn format_snapshot(&self, snapshot: &SolarSnapshot) -> Result<String>;
    fn format_history(&self, entries: &[HistoryEntry]) -> Result<String>;
    fn format_stats(&self, stats: &DriverStats) -> Result<String>;
    fn format_self_test(&self, passed: bool) -> Result<String>;
}

/// Picks a formatter by its command line name.
pub fn formatter_for(name: &str) -> Result<Box<dyn ReadingFormatter>> {
    match name.to_ascii_lowercase().as_str() {
        "console" => Ok(Box::new(ConsoleFormatter)),
        "json" => Ok(Box::new(JsonFormatter)),
        other => Err(DriverError::ConfigError(format!("Unknown output format: {}", other))),
    }
}

fn describe_value(value: &ReadingValue, unit: &str) -> String {
    match value {
        ReadingValue::Scalar(v) if unit.is_empty() => format!("{:.1}", v),
        ReadingValue::Scalar(v) => format!("{:.1} {}", v, unit),
        ReadingValue::State(state) => state.to_string(),
    }
}

fn optional(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1} {}", v, unit),
        None => "--".to_string(),
    }
}

pub struct ConsoleFormatter;

impl ReadingFormatter for ConsoleFormatter {
    fn format_header(&self) -> String {
        format!("🌞 PL Link - {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"))
    }

    fn format_register(
        &self,
        space: MemorySpace,
        address: u8,
        raw: u8,
        reading: Option<&Reading>,
    ) -> Result<String> {
        let mut output = format!("🔹 {:?}[{}] = {} (0x{:02x})", space, address, raw, raw);
        if let Some(reading) = reading {
            output.push_str(&format!(
                " → {:?}: {}",
                reading.quantity,
                describe_value(&reading.value, reading.quantity.unit())
            ));
        }
        output.push('\n');
        Ok(output)
    }

    fn format_batch(&self, values: &BTreeMap<u8, Option<u8>>) -> Result<String> {
        let mut output = String::from("📈 Register batch:\n");
        for (address, value) in values {
            match value {
                Some(raw) => output.push_str(&format!("  {:>3}: {:>3} (0x{:02x})\n", address, raw, raw)),
                None => output.push_str(&format!("  {:>3}: unavailable\n", address)),
            }
        }
        Ok(output)
    }

    fn format_snapshot(&self, snapshot: &SolarSnapshot) -> Result<String> {
        let mut output = format!(
            "📊 {} {} @ {}\n",
            snapshot.model,
            snapshot.system_voltage,
            snapshot.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        output.push_str(&"═".repeat(40));
        output.push('\n');
        output.push_str(&format!("🔋 Battery voltage:     {}\n", optional(snapshot.battery_voltage, "V")));
        output.push_str(&format!("🌡️  Battery temperature: {}\n", optional(snapshot.battery_temperature, "°C")));
        output.push_str(&format!("⚡ State of charge:     {}\n", optional(snapshot.state_of_charge, "%")));
        output.push_str(&format!("☀️  Solar voltage:       {}\n", optional(snapshot.solar_voltage, "V")));
        output.push_str(&format!("🔌 Charge current:      {}\n", optional(snapshot.charge_current, "A")));
        output.push_str(&format!("💡 Load current:        {}\n", optional(snapshot.load_current, "A")));
        output.push_str(&format!(
            "🔄 Controller state:    {}\n",
            snapshot
                .controller_state
                .map(|state| state.to_string())
                .unwrap_or_else(|| "--".to_string())
        ));
        if let Some(version) = snapshot.version {
            output.push_str(&format!("📦 Version:             {}\n", version));
        }
        let missing = snapshot.raw.values().filter(|value| value.is_none()).count();
        if missing > 0 {
            output.push_str(&format!("⚠️  {} register(s) did not answer\n", missing));
        }
        Ok(output)
    }

    fn format_history(&self, entries: &[HistoryEntry]) -> Result<String> {
        let mut output = String::from("📜 Daily history (day 1 = today)\n");
        output.push_str("day   vmax   vmin  float  soc  chg Ah  load Ah\n");
        for entry in entries {
            match entry.record {
                Some(record) => output.push_str(&format!(
                    "{:>3} {:>6.1} {:>6.1} {:>6.1} {:>4} {:>7} {:>8}\n",
                    record.day,
                    record.vmax,
                    record.vmin,
                    record.float_hours,
                    record.soc,
                    record.charge_ah,
                    record.load_ah
                )),
                None => output.push_str(&format!("{:>3}   unavailable\n", entry.day)),
            }
        }
        Ok(output)
    }

    fn format_stats(&self, stats: &DriverStats) -> Result<String> {
        let mut output = format!("📈 Session {} ({})\n", stats.session_id, stats.endpoint);
        output.push_str(&format!("  State:      {}\n", stats.state));
        output.push_str(&format!(
            "  Requests:   {} sent, {} resolved ({:.1}%)\n",
            stats.requests_sent,
            stats.requests_resolved,
            stats.success_rate()
        ));
        output.push_str(&format!(
            "  Failures:   {} timeouts, {} other\n",
            stats.timeouts, stats.failures
        ));
        output.push_str(&format!(
            "  Stray:      {} late frames, {} protocol errors\n",
            stats.late_frames, stats.protocol_errors
        ));
        output.push_str(&format!(
            "  Link:       {} connects / {} attempts, {} B in, {} B out, {} B discarded\n",
            stats.link.connects,
            stats.link.connect_attempts,
            stats.link.bytes_received,
            stats.link.bytes_sent,
            stats.link.bytes_discarded
        ));
        Ok(output)
    }

    fn format_self_test(&self, passed: bool) -> Result<String> {
        Ok(if passed {
            "✅ Loopback self-test passed\n".to_string()
        } else {
            "❌ Loopback self-test failed\n".to_string()
        })
    }
}

pub struct JsonFormatter;

impl ReadingFormatter for JsonFormatter {
    fn format_header(&self) -> String {
        String::new()
    }

    fn format_register(
        &self,
        space: MemorySpace,
        address: u8,
        raw: u8,
        reading: Option<&Reading>,
    ) -> Result<String> {
        let value = json!({
            "space": space,
            "address": address,
            "raw": raw,
            "reading": reading,
            "timestamp": Utc::now().to_rfc3339(),
        });
        Ok(serde_json::to_string_pretty(&value)?)
    }

    fn format_batch(&self, values: &BTreeMap<u8, Option<u8>>) -> Result<String> {
        let value = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "registers": values,
        });
        Ok(serde_json::to_string_pretty(&value)?)
    }

    fn format_snapshot(&self, snapshot: &SolarSnapshot) -> Result<String> {
        Ok(serde_json::to_string_pretty(snapshot)?)
    }

    fn format_history(&self, entries: &[HistoryEntry]) -> Result<String> {
        let value = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "days": entries,
        });
        Ok(serde_json::to_string_pretty(&value)?)
    }

    fn format_stats(&self, stats: &DriverStats) -> Result<String> {
        Ok(serde_json::to_string_pretty(stats)?)
    }

    fn format_self_test(&self, passed: bool) -> Result<String> {
        Ok(serde_json::to_string(&json!({ "loopback": passed }))?)
    }
}
