//! Simulated BQ35100 used by the test suite: a scripted register file, the
//! MAC block protocol with checksum verification, the security key state
//! machine, and a transaction log that tests assert against.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use core::convert::Infallible;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{ErrorType, I2c, Operation};

use crate::ll;
use crate::memory::checksum;

pub const SEC_FULL_ACCESS: u8 = 0b01;
pub const SEC_UNSEALED: u8 = 0b10;
pub const SEC_SEALED: u8 = 0b11;

const UNSEAL_KEY_HI: u16 = 0x0414;
const UNSEAL_KEY_LO: u16 = 0x3672;

#[derive(Debug)]
pub enum Transaction {
    /// Raw bytes of a bus write, command byte included.
    Write(Vec<u8>),
    /// Command byte and length of a bus read.
    Read(u8, usize),
}

impl Transaction {
    pub fn reads_register(&self, command: u8) -> bool {
        matches!(self, Transaction::Read(read, _) if *read == command)
    }

    /// Whether this is a MAC block write addressed at `address`.
    pub fn writes_block(&self, address: u16) -> bool {
        match self {
            Transaction::Write(bytes) => {
                bytes.len() > 3
                    && bytes[0] == ll::CMD_MAC_CONTROL
                    && u16::from_le_bytes([bytes[1], bytes[2]]) == address
            }
            _ => false,
        }
    }
}

pub struct SimState {
    pub security: u8,
    pub ga: bool,
    pub cal: bool,
    pub flashf: bool,
    pub device_type: u16,
    /// Data flash contents, byte addressed.
    pub flash: BTreeMap<u16, u8>,
    /// Direct register values, read little-endian.
    pub regs: BTreeMap<u8, u32>,
    pub log: Vec<Transaction>,

    /// Status reads it takes until a gauge start/stop is reflected.
    pub ga_latency: u32,
    /// When set, unseal keys are silently ignored.
    pub ignore_unseal: bool,
    /// When set, calibration mode changes are silently ignored.
    pub cal_stuck: bool,
    /// Corrupt the checksum of block read responses.
    pub corrupt_checksum: bool,
    /// Echo the wrong address in block read responses.
    pub wrong_echo: bool,
    /// Report FLASHF for every block write.
    pub fail_flash_write: bool,

    pub counter_script: Vec<u8>,
    pub sample_script: Vec<i16>,

    counter_pos: usize,
    mac_response: u16,
    read_frame: [u8; 36],
    write_stage: Option<(u16, Vec<u8>)>,
    staged_sum: Option<u8>,
    ga_pending: Option<(bool, u32)>,
    unseal_half: bool,
    full_access_half: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            security: 0,
            ga: false,
            cal: false,
            flashf: false,
            device_type: ll::DEVICE_TYPE_ID,
            flash: BTreeMap::new(),
            regs: BTreeMap::new(),
            log: Vec::new(),
            ga_latency: 0,
            ignore_unseal: false,
            cal_stuck: false,
            corrupt_checksum: false,
            wrong_echo: false,
            fail_flash_write: false,
            counter_script: Vec::new(),
            sample_script: Vec::new(),
            counter_pos: 0,
            mac_response: 0,
            read_frame: [0; 36],
            write_stage: None,
            staged_sum: None,
            ga_pending: None,
            unseal_half: false,
            full_access_half: false,
        }
    }
}

impl SimState {
    pub fn set_register(&mut self, command: u8, value: u32) {
        self.regs.insert(command, value);
    }

    /// Big-endian 16-bit data flash value, the way multi-byte flash
    /// parameters are stored.
    pub fn flash_u16(&self, address: u16) -> u16 {
        let high = self.flash.get(&address).copied().unwrap_or(0);
        let low = self.flash.get(&(address + 1)).copied().unwrap_or(0);
        u16::from_be_bytes([high, low])
    }

    fn full_access_key(&self) -> (u16, u16) {
        let bytes: Vec<u8> = (0..4)
            .map(|offset| {
                self.flash
                    .get(&(ll::FLASH_FULL_ACCESS_CODES + offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();

        (
            u16::from_be_bytes([bytes[0], bytes[1]]),
            u16::from_be_bytes([bytes[2], bytes[3]]),
        )
    }

    fn control_status(&mut self) -> u16 {
        if let Some((value, remaining)) = self.ga_pending {
            if remaining == 0 {
                self.ga = value;
                self.ga_pending = None;
            } else {
                self.ga_pending = Some((value, remaining - 1));
            }
        }

        let mut status = (self.security as u16) << ll::STATUS_SEC_SHIFT;
        if self.ga {
            status |= ll::STATUS_GA;
        }
        if self.cal {
            status |= ll::STATUS_CAL_MODE;
        }
        if self.flashf {
            status |= ll::STATUS_FLASHF;
        }

        status
    }

    fn subcommand(&mut self, subcommand: u16) {
        match subcommand {
            ll::CTRL_CONTROL_STATUS => {
                self.mac_response = self.control_status();
                return;
            }
            ll::CTRL_DEVICE_TYPE => {
                self.mac_response = self.device_type;
                return;
            }
            ll::CTRL_GAUGE_START => {
                self.ga_pending = Some((true, self.ga_latency));
                return;
            }
            ll::CTRL_GAUGE_STOP => {
                self.ga_pending = Some((false, self.ga_latency));
                return;
            }
            ll::CTRL_SEALED => {
                self.security = SEC_SEALED;
                return;
            }
            ll::CTRL_ENTER_CAL => {
                if !self.cal_stuck {
                    self.cal = true;
                }
                return;
            }
            ll::CTRL_EXIT_CAL => {
                if !self.cal_stuck {
                    self.cal = false;
                }
                return;
            }
            _ => {}
        }

        if (ll::FLASH_BASE..=ll::FLASH_END).contains(&subcommand) {
            self.stage_read_frame(subcommand);
            return;
        }

        // Unlock key sequences
        if subcommand == UNSEAL_KEY_HI && self.security == SEC_SEALED {
            self.unseal_half = true;
        } else if subcommand == UNSEAL_KEY_LO && self.unseal_half {
            self.unseal_half = false;
            if !self.ignore_unseal {
                self.security = SEC_UNSEALED;
            }
        } else {
            self.unseal_half = false;
        }

        let (key_hi, key_lo) = self.full_access_key();
        if subcommand == key_hi && self.security == SEC_UNSEALED {
            self.full_access_half = true;
        } else if subcommand == key_lo && self.full_access_half {
            self.full_access_half = false;
            self.security = SEC_FULL_ACCESS;
        } else if subcommand != key_hi {
            self.full_access_half = false;
        }
    }

    fn stage_read_frame(&mut self, address: u16) {
        let echoed = if self.wrong_echo { address ^ 0x0010 } else { address };
        self.read_frame[..2].copy_from_slice(&echoed.to_le_bytes());

        for offset in 0..32u16 {
            self.read_frame[2 + offset as usize] =
                self.flash.get(&(address + offset)).copied().unwrap_or(0);
        }

        let mut sum = checksum(&self.read_frame[..34]);
        if self.corrupt_checksum {
            sum ^= 0xFF;
        }
        self.read_frame[34] = sum;
        self.read_frame[35] = 36;
    }

    fn commit_block_write(&mut self, length: u8) {
        let Some((address, payload)) = self.write_stage.take() else {
            self.flashf = true;
            return;
        };

        let mut frame = address.to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);

        let valid = self.staged_sum.take() == Some(checksum(&frame))
            && length as usize == payload.len() + 4;

        if valid && !self.fail_flash_write {
            for (offset, byte) in payload.iter().enumerate() {
                self.flash.insert(address + offset as u16, *byte);
            }
            self.flashf = false;
        } else {
            self.flashf = true;
        }
    }

    fn handle_write(&mut self, bytes: &[u8]) {
        self.log.push(Transaction::Write(bytes.to_vec()));

        let command = bytes[0];
        let rest = &bytes[1..];

        match command {
            ll::CMD_MAC_CONTROL if rest.len() == 2 => {
                self.subcommand(u16::from_le_bytes([rest[0], rest[1]]));
            }
            ll::CMD_MAC_CONTROL if rest.len() > 2 => {
                let address = u16::from_le_bytes([rest[0], rest[1]]);
                self.write_stage = Some((address, rest[2..].to_vec()));
            }
            ll::CMD_MAC_DATA_SUM => self.staged_sum = Some(rest[0]),
            ll::CMD_MAC_DATA_LEN => self.commit_block_write(rest[0]),
            _ => {
                let mut value = 0u32;
                for byte in rest.iter().rev() {
                    value = (value << 8) | *byte as u32;
                }
                self.regs.insert(command, value);
            }
        }
    }

    fn handle_read(&mut self, command: u8, buffer: &mut [u8]) {
        self.log.push(Transaction::Read(command, buffer.len()));

        match command {
            ll::CMD_CONTROL => {
                let status = self.control_status();
                buffer.copy_from_slice(&status.to_le_bytes()[..buffer.len()]);
            }
            ll::CMD_MAC_CONTROL => {
                buffer.copy_from_slice(&self.read_frame[..buffer.len()]);
            }
            ll::CMD_MAC_DATA => {
                buffer.copy_from_slice(&self.mac_response.to_le_bytes()[..buffer.len()]);
            }
            ll::CMD_CAL_COUNT => {
                let value = self
                    .counter_script
                    .get(self.counter_pos)
                    .or(self.counter_script.last())
                    .copied()
                    .unwrap_or(0);
                self.counter_pos += 1;
                buffer[0] = value;
            }
            ll::CMD_CAL_CURRENT | ll::CMD_CAL_VOLTAGE | ll::CMD_CAL_TEMPERATURE => {
                let at = self.counter_pos.saturating_sub(1);
                let value = self
                    .sample_script
                    .get(at)
                    .or(self.sample_script.last())
                    .copied()
                    .unwrap_or(0);
                buffer.copy_from_slice(&value.to_le_bytes()[..buffer.len()]);
            }
            _ => {
                let value = self.regs.get(&command).copied().unwrap_or(0);
                let bytes = value.to_le_bytes();
                buffer.copy_from_slice(&bytes[..buffer.len()]);
            }
        }
    }
}

/// Cloneable handle to a shared [`SimState`]; the driver owns one clone as
/// its bus, the test keeps another to seed and inspect the device.
#[derive(Clone)]
pub struct SimBus(Rc<RefCell<SimState>>);

impl SimBus {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SimState::default())))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl ErrorType for SimBus {
    type Error = Infallible;
}

impl I2c for SimBus {
    async fn transaction(
        &mut self,
        _address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();

        match operations {
            [Operation::Write(bytes)] => state.handle_write(bytes),
            [Operation::Write(command), Operation::Read(buffer)] => {
                let command = command[0];
                state.handle_read(command, buffer);
            }
            _ => panic!("unexpected transaction shape"),
        }

        Ok(())
    }
}

/// Delay source that returns immediately; settle times are not part of
/// what the tests verify.
pub struct NoDelay;

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}
