use serde::{Deserialize, Serialize};

pub const READ_RAM: u8 = 20;
pub const READ_EEPROM: u8 = 72;
pub const LOOPBACK: u8 = 187;

/// Byte the controller sends back for a loopback command.
pub const LOOPBACK_REPLY: u8 = 0x80;

pub const COMMAND_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySpace {
    Ram,
    Eeprom,
}

impl MemorySpace {
    pub fn read_opcode(self) -> u8 {
        match self {
            MemorySpace::Ram => READ_RAM,
            MemorySpace::Eeprom => READ_EEPROM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub address: u8,
    pub payload: u8,
    pub checksum: u8,
}

pub fn checksum(opcode: u8, address: u8, payload: u8) -> u8 {
    opcode ^ address ^ payload ^ 0xFF
}

pub fn encode(opcode: u8, address: u8, payload: u8) -> Command {
    Command {
        opcode,
        address,
        payload,
        checksum: checksum(opcode, address, payload),
    }
}

impl Command {
    pub fn read(space: MemorySpace, address: u8) -> Self {
        encode(space.read_opcode(), address, 0)
    }

    pub fn loopback() -> Self {
        encode(LOOPBACK, 0, 0)
    }

    /// Wire order: opcode, address, payload, checksum.
    pub fn to_bytes(&self) -> [u8; COMMAND_LEN] {
        [self.opcode, self.address, self.payload, self.checksum]
    }

    pub fn is_valid(&self) -> bool {
        self.checksum == checksum(self.opcode, self.address, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_invariant() {
        for opcode in (0..=255u8).step_by(5) {
            for address in (0..=255u8).step_by(3) {
                for payload in [0u8, 1, 0x7F, 0x80, 0xC8, 0xFF] {
                    let cmd = encode(opcode, address, payload);
                    assert_eq!(cmd.checksum, opcode ^ address ^ payload ^ 0xFF);
                    assert!(cmd.is_valid());
                }
            }
        }
    }

    #[test]
    fn test_read_battery_voltage_frame() {
        let cmd = Command::read(MemorySpace::Ram, 50);
        // 20 ^ 50 ^ 0 ^ 255 = 217
        assert_eq!(cmd.to_bytes(), [20, 50, 0, 217]);
    }

    #[test]
    fn test_eeprom_and_loopback_opcodes() {
        assert_eq!(Command::read(MemorySpace::Eeprom, 0x2D).opcode, READ_EEPROM);
        let loopback = Command::loopback();
        assert_eq!(loopback.to_bytes(), [LOOPBACK, 0, 0, LOOPBACK ^ 0xFF]);
    }

    #[test]
    fn test_tampered_command_is_invalid() {
        let mut cmd = Command::read(MemorySpace::Ram, 181);
        cmd.payload = 1;
        assert!(!cmd.is_valid());
    }
}
