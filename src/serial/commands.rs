//! Programmer firmware opcodes and the constants that go with them.

pub const TEST: u8 = b't';
pub const VERSION: u8 = b'v';
pub const NAME: u8 = b'n';
pub const I2C_CLOCK: u8 = b'c';
pub const RSWP_REPORT: u8 = b'f';
pub const SCAN_BUS: u8 = b's';
pub const READ_BYTE: u8 = b'r';
pub const WRITE_BYTE: u8 = b'w';
pub const WRITE_PAGE: u8 = b'g';
pub const RSWP: u8 = b'b';
pub const DDR4_DETECT: u8 = b'4';
pub const DDR5_DETECT: u8 = b'5';
pub const PROBE_ADDRESS: u8 = b'a';
pub const SPD5_HUB: u8 = b'h';
pub const SPD_SIZE: u8 = b'z';
pub const FACTORY_RESET: u8 = b'-';
pub const RESET_CONFIG_PINS: u8 = b'd';

/// Parameter asking for the current value instead of setting one.
pub const GET: u8 = b'?';

pub const NAME_MAX_LENGTH: usize = 16;
pub const PAGE_MAX_SIZE: usize = 32;
/// Largest read the firmware serves in one response.
pub const READ_CHUNK_SIZE: u8 = 32;

/// First EEPROM address reported by the scan bitmask.
pub const SPD_BASE_ADDRESS: u8 = 0x50;
/// Range probed by a full bus scan; 0x00-0x07 and 0x78-0x7F are reserved.
pub const I2C_FIRST_ADDRESS: u8 = 0x08;
pub const I2C_LAST_ADDRESS: u8 = 0x77;

/// I2C bus clock as reported by the programmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum I2cClock {
    /// 100 kHz
    Standard,
    /// 400 kHz
    Fast,
}

impl I2cClock {
    pub fn khz(self) -> u16 {
        match self {
            I2cClock::Standard => 100,
            I2cClock::Fast => 400,
        }
    }
}

/// Memory generations whose reversible write protection the programmer can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RswpSupport(pub u8);

impl RswpSupport {
    pub const DDR3: u8 = 1 << 3;
    pub const DDR4: u8 = 1 << 4;
    pub const DDR5: u8 = 1 << 5;

    pub fn supports(self, mask: u8) -> bool {
        self.0 & mask == mask
    }

    pub fn any(self) -> bool {
        self.0 > 0
    }
}

/// Expands the scan bitmask: bit `i` set means a device answers at `0x50 + i`.
pub fn addresses_from_mask(mask: u8) -> Vec<u8> {
    (0..8u8)
        .filter(|bit| (mask >> bit) & 1 == 1)
        .map(|bit| SPD_BASE_ADDRESS + bit)
        .collect()
}
