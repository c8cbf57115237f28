//! Low-level register map and bus transport for the BQ35100.
//!
//! The gauge is a byte-oriented I2C device: direct commands are little-endian
//! 1/2/4-byte registers, and everything else goes through the
//! ManufacturerAccessControl (MAC) window at [`CMD_MAC_CONTROL`].

use embedded_hal_async::i2c::I2c;

use crate::Error;

/// Default 7-bit bus address of the gauge.
pub const DEVICE_ADDRESS: u8 = 0x55;

/// Value reported by the [`CTRL_DEVICE_TYPE`] subcommand.
pub const DEVICE_TYPE_ID: u16 = 0x0100;

// Direct commands
pub const CMD_CONTROL: u8 = 0x00;
pub const CMD_ACCUMULATED_CAPACITY: u8 = 0x02;
pub const CMD_TEMPERATURE: u8 = 0x06;
pub const CMD_VOLTAGE: u8 = 0x08;
pub const CMD_BATTERY_STATUS: u8 = 0x0A;
pub const CMD_BATTERY_ALERT: u8 = 0x0B;
pub const CMD_CURRENT: u8 = 0x0C;
pub const CMD_INTERNAL_TEMP: u8 = 0x28;
pub const CMD_SOH: u8 = 0x2E;
pub const CMD_DESIGN_CAPACITY: u8 = 0x3C;
pub const CMD_MAC_CONTROL: u8 = 0x3E;
pub const CMD_MAC_DATA: u8 = 0x40;
pub const CMD_MAC_DATA_SUM: u8 = 0x60;
pub const CMD_MAC_DATA_LEN: u8 = 0x61;
pub const CMD_CAL_COUNT: u8 = 0x79;
pub const CMD_CAL_CURRENT: u8 = 0x7A;
pub const CMD_CAL_VOLTAGE: u8 = 0x7C;
pub const CMD_CAL_TEMPERATURE: u8 = 0x7E;

// Control subcommands, written through the MAC window
pub const CTRL_CONTROL_STATUS: u16 = 0x0000;
pub const CTRL_DEVICE_TYPE: u16 = 0x0001;
pub const CTRL_FW_VERSION: u16 = 0x0002;
pub const CTRL_HW_VERSION: u16 = 0x0003;
pub const CTRL_GAUGE_START: u16 = 0x0011;
pub const CTRL_GAUGE_STOP: u16 = 0x0012;
pub const CTRL_SEALED: u16 = 0x0020;
pub const CTRL_RESET: u16 = 0x0041;
pub const CTRL_EXIT_CAL: u16 = 0x0080;
pub const CTRL_ENTER_CAL: u16 = 0x0081;
pub const CTRL_NEW_BATTERY: u16 = 0xA613;

// CONTROL_STATUS bits
pub const STATUS_GA: u16 = 1 << 0;
pub const STATUS_INITCOMP: u16 = 1 << 7;
pub const STATUS_CAL_MODE: u16 = 1 << 12;
pub const STATUS_SEC_SHIFT: u16 = 13;
pub const STATUS_SEC_MASK: u16 = 0b11;
pub const STATUS_FLASHF: u16 = 1 << 15;

// Data flash (extended memory) addresses
pub const FLASH_BASE: u16 = 0x4000;
pub const FLASH_END: u16 = 0x43FF;

pub const FLASH_CC_GAIN: u16 = 0x4000;
pub const FLASH_CC_DELTA: u16 = 0x4004;
pub const FLASH_CC_OFFSET: u16 = 0x4008;
pub const FLASH_BOARD_OFFSET: u16 = 0x400C;
pub const FLASH_INT_TEMP_OFFSET: u16 = 0x400D;
pub const FLASH_EXT_TEMP_OFFSET: u16 = 0x400E;
pub const FLASH_PACK_V_OFFSET: u16 = 0x400F;
pub const FLASH_OPERATION_CFG_A: u16 = 0x41B1;
pub const FLASH_ALERT_CFG: u16 = 0x41B2;
pub const FLASH_FULL_ACCESS_CODES: u16 = 0x41D0;
pub const FLASH_DESIGN_CAPACITY: u16 = 0x41FE;

/// Largest payload a single data flash transfer can carry.
pub const MAX_BLOCK_LEN: usize = 32;

/// Default unseal key, written as two 16-bit halves, high half first.
pub const DEFAULT_UNSEAL_CODES: u32 = 0x0414_3672;

// Device settle times. The MAC settle time is a hardware latency contract:
// a subcommand response is not valid before it has elapsed.
pub const SUBCOMMAND_SETTLE_MS: u32 = 10;
pub const PROBE_SETTLE_MS: u32 = 100;
pub const FLASH_OPEN_MS: u32 = 500;
pub const FLASH_COMMIT_MS: u32 = 100;
pub const SECURITY_SETTLE_MS: u32 = 100;
pub const SECURITY_BACKOFF_MS: u32 = 40;
pub const START_POLL_MS: u32 = 100;
pub const STOP_POLL_MS: u32 = 500;

pub const SECURITY_ATTEMPTS: u8 = 3;
pub const STATUS_POLL_ATTEMPTS: u8 = 5;

/// Raw bus access. Direct register writes are always 2 bytes; wider values
/// only exist on the read side, so the protocol's "2-byte writes only" rule
/// is enforced by construction.
pub(crate) struct Bq35100I2cInterface<I> {
    pub i2c: I,
    pub address: u8,
}

impl<I> Bq35100I2cInterface<I>
where
    I: I2c,
{
    pub async fn burst_read(&mut self, command: u8, buffer: &mut [u8]) -> Result<(), I::Error> {
        self.i2c.write_read(self.address, &[command], buffer).await
    }

    pub async fn burst_write(&mut self, bytes: &[u8]) -> Result<(), I::Error> {
        self.i2c.write(self.address, bytes).await
    }

    /// Reads a 1, 2 or 4 byte little-endian register value.
    pub async fn read_register(&mut self, command: u8, width: usize) -> Result<u32, Error<I::Error>> {
        let mut buffer = [0; 4];

        let buffer = match width {
            1 | 2 | 4 => &mut buffer[..width],
            _ => return Err(Error::Unsupported),
        };

        self.burst_read(command, buffer).await?;

        let mut value = 0;
        for byte in buffer.iter().rev() {
            value = (value << 8) | *byte as u32;
        }

        Ok(value)
    }

    pub async fn write_register16(&mut self, command: u8, value: u16) -> Result<(), I::Error> {
        let [low, high] = value.to_le_bytes();
        self.burst_write(&[command, low, high]).await
    }
}
