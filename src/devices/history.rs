//! Daily summaries kept in the controller's circular log.
//!
//! The log holds 30 entries of 7 bytes each. A pointer register names the
//! entry for the current day; older days sit at lower offsets and wrap
//! around the end of the ring. There is no block read, so every byte is a
//! separate register round trip.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::traits::RegisterSource;
use crate::protocol::MemorySpace;
use crate::utils::error::{DriverError, Result};

pub const HISTORY_DAYS: u8 = 30;
pub const ENTRY_LEN: u8 = 7;
/// Total span of the ring in bytes.
pub const RING_SIZE: u16 = HISTORY_DAYS as u16 * ENTRY_LEN as u16;

pub const DEFAULT_LOG_START: u8 = 0x2E;
pub const DEFAULT_POINTER_ADDRESS: u8 = 0x2D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryLayout {
    pub space: MemorySpace,
    pub pointer_space: MemorySpace,
    pub pointer_address: u8,
    pub log_start: u8,
}

impl Default for HistoryLayout {
    fn default() -> Self {
        Self {
            space: MemorySpace::Eeprom,
            pointer_space: MemorySpace::Eeprom,
            pointer_address: DEFAULT_POINTER_ADDRESS,
            log_start: DEFAULT_LOG_START,
        }
    }
}

impl HistoryLayout {
    pub fn validate(&self) -> Result<()> {
        if u16::from(self.log_start) + RING_SIZE > 256 {
            return Err(DriverError::ConfigError(format!(
                "History log starting at 0x{:02x} does not fit in the address space",
                self.log_start
            )));
        }
        Ok(())
    }

    /// Start of the entry `day` days back from `pointer` (day 1 is the pointer's own entry).
    pub fn day_offset(&self, pointer: u8, day: u8) -> u8 {
        let log_start = i32::from(self.log_start);
        let base = log_start + i32::from(ENTRY_LEN) * i32::from(pointer);
        let back = i32::from(ENTRY_LEN) * (i32::from(day) - 1);
        let mut offset = base - back;
        if offset < log_start {
            offset = base + i32::from(RING_SIZE) - back;
        }
        offset as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub day: u8,
    pub vmax: f64,
    pub vmin: f64,
    pub float_hours: f64,
    pub soc: u8,
    pub charge_ah: u16,
    pub load_ah: u16,
}

impl HistoryRecord {
    /// Bytes 4 and 5 hold the low bytes of the amp-hour totals; byte 6 packs
    /// their high nibbles (charge in the low nibble, load in the high one).
    pub fn parse(day: u8, bytes: &[u8; ENTRY_LEN as usize], voltage_ratio: f64) -> Self {
        let packed = bytes[6];
        Self {
            day,
            vmax: f64::from(bytes[0]) * 0.1 * voltage_ratio,
            vmin: f64::from(bytes[1]) * 0.1 * voltage_ratio,
            float_hours: f64::from(bytes[2]) * 0.1,
            soc: bytes[3],
            charge_ah: u16::from(bytes[4]) + u16::from(packed & 0x0F) * 256,
            load_ah: u16::from(bytes[5]) + u16::from((packed & 0xF0) >> 4) * 256,
        }
    }
}

/// One slot of a history fetch; `record` is `None` when the day could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub day: u8,
    pub record: Option<HistoryRecord>,
}

impl HistoryEntry {
    pub fn is_available(&self) -> bool {
        self.record.is_some()
    }
}

pub struct HistoryReader {
    layout: HistoryLayout,
    voltage_ratio: f64,
}

impl HistoryReader {
    pub fn new(layout: HistoryLayout, voltage_ratio: f64) -> Self {
        Self { layout, voltage_ratio }
    }

    /// Walks all 30 days, newest first. Only a failed pointer read aborts the walk.
    pub async fn read(&self, source: &dyn RegisterSource) -> Result<Vec<HistoryEntry>> {
        let pointer = source
            .read_register(self.layout.pointer_space, self.layout.pointer_address)
            .await?;
        if pointer >= HISTORY_DAYS {
            return Err(DriverError::InvalidData(format!(
                "History pointer {} outside 0..{}",
                pointer, HISTORY_DAYS
            )));
        }
        info!("📜 Reading {} days of history (pointer {})", HISTORY_DAYS, pointer);

        let mut entries = Vec::with_capacity(HISTORY_DAYS as usize);
        for day in 1..=HISTORY_DAYS {
            let offset = self.layout.day_offset(pointer, day);
            let record = match self.read_entry(source, offset).await {
                Ok(bytes) => Some(HistoryRecord::parse(day, &bytes, self.voltage_ratio)),
                Err(e) => {
                    warn!("⚠️  History day {} at 0x{:02x} unavailable: {}", day, offset, e);
                    None
                }
            };
            entries.push(HistoryEntry { day, record });
        }

        let available = entries.iter().filter(|entry| entry.is_available()).count();
        debug!("History fetch complete: {}/{} days available", available, HISTORY_DAYS);
        Ok(entries)
    }

    async fn read_entry(&self, source: &dyn RegisterSource, offset: u8) -> Result<[u8; ENTRY_LEN as usize]> {
        let mut bytes = [0u8; ENTRY_LEN as usize];
        for (index, byte) in bytes.iter_mut().enumerate() {
            let address = offset.wrapping_add(index as u8);
            *byte = source.read_register(self.layout.space, address).await?;
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    struct FakeMemory {
        cells: HashMap<(MemorySpace, u8), u8>,
        broken: HashSet<u8>,
        reads: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl RegisterSource for FakeMemory {
        async fn read_register(&self, space: MemorySpace, address: u8) -> Result<u8> {
            self.reads.lock().unwrap().push(address);
            if self.broken.contains(&address) {
                return Err(DriverError::Timeout { address, timeout_ms: 10 });
            }
            Ok(*self.cells.get(&(space, address)).unwrap_or(&0))
        }
    }

    #[test]
    fn test_offsets_stay_inside_ring() {
        let layout = HistoryLayout::default();
        let upper = u16::from(layout.log_start) + RING_SIZE;
        for pointer in 0..HISTORY_DAYS {
            let mut seen = HashSet::new();
            for day in 1..=HISTORY_DAYS {
                let offset = layout.day_offset(pointer, day);
                assert!(offset >= layout.log_start, "pointer {} day {}", pointer, day);
                assert!(u16::from(offset) < upper, "pointer {} day {}", pointer, day);
                assert_eq!((offset - layout.log_start) % ENTRY_LEN, 0);
                seen.insert(offset);
            }
            assert_eq!(seen.len(), HISTORY_DAYS as usize, "every day maps to its own entry");
        }
    }

    #[test]
    fn test_offset_wraparound_example() {
        let layout = HistoryLayout::default();
        assert_eq!(layout.day_offset(2, 1), 60);
        assert_eq!(layout.day_offset(2, 3), 46);
        assert_eq!(layout.day_offset(2, 10), 207);
    }

    #[test]
    fn test_packed_nibbles() {
        let record = HistoryRecord::parse(1, &[10, 20, 30, 40, 50, 60, 0x13], 1.0);
        assert_eq!(record.charge_ah, 818);
        assert_eq!(record.load_ah, 316);
        assert!((record.vmax - 1.0).abs() < 1e-9);
        assert!((record.vmin - 2.0).abs() < 1e-9);
        assert!((record.float_hours - 3.0).abs() < 1e-9);
        assert_eq!(record.soc, 40);
    }

    #[test]
    fn test_voltage_ratio_applies_to_extremes() {
        let record = HistoryRecord::parse(4, &[140, 120, 0, 0, 0, 0, 0xFF], 2.0);
        assert!((record.vmax - 28.0).abs() < 1e-9);
        assert!((record.vmin - 24.0).abs() < 1e-9);
        assert_eq!(record.charge_ah, 15 * 256);
        assert_eq!(record.load_ah, 15 * 256);
    }

    #[test]
    fn test_layout_validation() {
        assert!(HistoryLayout::default().validate().is_ok());
        let too_late = HistoryLayout {
            log_start: 0x30,
            ..HistoryLayout::default()
        };
        assert!(too_late.validate().is_err());
    }

    fn memory_with_pointer(pointer: u8) -> FakeMemory {
        let layout = HistoryLayout::default();
        let mut cells = HashMap::new();
        cells.insert((layout.pointer_space, layout.pointer_address), pointer);
        FakeMemory {
            cells,
            broken: HashSet::new(),
            reads: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_reader_walks_newest_first() {
        let layout = HistoryLayout::default();
        let mut memory = memory_with_pointer(2);
        // Day 1 lives at offset 60, day 2 at 53.
        for (i, byte) in [10u8, 20, 30, 40, 50, 60, 0x13].iter().enumerate() {
            memory.cells.insert((layout.space, 60 + i as u8), *byte);
            memory.cells.insert((layout.space, 53 + i as u8), byte + 1);
        }

        let entries = HistoryReader::new(layout, 1.0).read(&memory).await.unwrap();
        assert_eq!(entries.len(), 30);
        assert_eq!(entries[0].day, 1);
        assert_eq!(entries[0].record.unwrap().charge_ah, 818);
        assert_eq!(entries[1].record.unwrap().soc, 41);
        assert!(entries.iter().all(|entry| entry.is_available()));
        // Pointer plus 7 bytes per day.
        assert_eq!(memory.reads.lock().unwrap().len(), 1 + 30 * 7);
    }

    #[tokio::test]
    async fn test_failed_day_is_marked_unavailable() {
        let layout = HistoryLayout::default();
        let mut memory = memory_with_pointer(0);
        // Day 2 wraps to the last entry, 46 + 203 = 249; break its third byte.
        memory.broken.insert(251);

        let entries = HistoryReader::new(layout, 1.0).read(&memory).await.unwrap();
        assert_eq!(entries.len(), 30);
        assert!(entries[0].is_available());
        assert!(!entries[1].is_available());
        assert!(entries[2..].iter().all(|entry| entry.is_available()));
        // The broken day stops after its failing byte.
        assert_eq!(memory.reads.lock().unwrap().len(), 1 + 29 * 7 + 3);
    }

    #[tokio::test]
    async fn test_out_of_range_pointer_is_rejected() {
        let memory = memory_with_pointer(30);
        let result = HistoryReader::new(HistoryLayout::default(), 1.0).read(&memory).await;
        assert!(matches!(result, Err(DriverError::InvalidData(_))));
    }
}
