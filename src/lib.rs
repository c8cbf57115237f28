#![cfg_attr(not(test), no_std)]

//! Driver for the Texas Instruments BQ35100 primary-cell battery fuel gauge.
//!
//! The gauge is commanded over I2C through direct registers, a
//! ManufacturerAccess subcommand channel and a checksummed data flash
//! protocol gated by a security state machine. All operations are `async`
//! and may sleep while the device processes a command; share a handle
//! between tasks by putting it behind a mutex.

use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::fmt::{debug, warn};

mod fmt;
pub mod ll;
mod measurement;
mod memory;
pub mod power;
mod retry;
mod security;

#[cfg(feature = "calibration")]
mod cal;
#[cfg(test)]
pub(crate) mod sim;

pub use measurement::{Channel, Measurements};
pub use security::SecurityMode;

#[cfg(feature = "calibration")]
pub use cal::{float_to_device_format, CalCommand};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// Bus transfer failed.
    Bus(E),
    /// The requested register width or attribute does not exist.
    Unsupported,
    /// A caller-provided value is outside the protocol's bounds.
    InvalidArgument,
    /// A data flash frame echoed a different address than requested.
    AddressMismatch,
    /// A data flash frame failed checksum verification.
    ChecksumMismatch,
    /// The device returned a frame with an impossible length field.
    MalformedResponse,
    /// A security mode transition did not stick.
    Security,
    /// Status polling exhausted its attempts.
    Timeout,
    /// The device flagged a failed data flash burn.
    FlashWrite,
    /// A computed calibration offset does not fit the signed byte the
    /// device stores.
    OffsetOutOfRange,
    /// The chip did not identify as a BQ35100.
    WrongDevice,
}

impl<E> From<E> for Error<E> {
    fn from(error: E) -> Self {
        Error::Bus(error)
    }
}

/// Capacity accounting mode, stored in the low bits of operation config A.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GaugeMode {
    Accumulator = 0b00,
    StateOfHealth = 0b01,
    EndOfService = 0b10,
}

impl GaugeMode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            0b00 => Some(Self::Accumulator),
            0b01 => Some(Self::StateOfHealth),
            0b10 => Some(Self::EndOfService),
            _ => None,
        }
    }
}

/// Temperature source used for measurement and calibration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TempSource {
    Internal,
    External,
}

/// Static per-device parameters.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// 7-bit bus address.
    pub address: u8,
    /// Design capacity in mAh, written during [`Bq35100::init`]. Zero
    /// leaves the value programmed in data flash untouched.
    pub design_capacity_mah: u16,
    pub gauge_mode: GaugeMode,
    pub temp_source: TempSource,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: ll::DEVICE_ADDRESS,
            design_capacity_mah: 0,
            gauge_mode: GaugeMode::Accumulator,
            temp_source: TempSource::Internal,
        }
    }
}

/// Whether the device confirmed a gauge start/stop within the polling
/// window. `Unconfirmed` means the command was issued but the state of the
/// gauge is uncertain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Confirmation {
    Confirmed,
    Unconfirmed,
}

/// BatteryStatus register.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryStatus(pub u8);

impl BatteryStatus {
    /// The ALERT pin is asserted.
    pub fn alert(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    /// Discharge current is detected.
    pub fn discharging(self) -> bool {
        self.0 & 1 != 0
    }
}

/// BatteryAlert register; each flag names the condition that raised ALERT.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryAlert(pub u8);

impl BatteryAlert {
    pub fn init_complete(self) -> bool {
        self.0 & (1 << 0) != 0
    }

    pub fn gauging_done(self) -> bool {
        self.0 & (1 << 1) != 0
    }

    pub fn end_of_service(self) -> bool {
        self.0 & (1 << 3) != 0
    }

    pub fn soh_low(self) -> bool {
        self.0 & (1 << 4) != 0
    }

    pub fn temp_high(self) -> bool {
        self.0 & (1 << 5) != 0
    }

    pub fn temp_low(self) -> bool {
        self.0 & (1 << 6) != 0
    }

    pub fn battery_low(self) -> bool {
        self.0 & (1 << 7) != 0
    }
}

pub struct Bq35100<I, D> {
    pub(crate) bus: ll::Bq35100I2cInterface<I>,
    pub(crate) delay: D,
    pub(crate) security_mode: SecurityMode,
    pub(crate) gauge_mode: Option<GaugeMode>,
    pub(crate) gauge_enabled: bool,
    config: Config,
}

impl<I, D> Bq35100<I, D> {
    pub const fn new(i2c: I, delay: D, config: Config) -> Self {
        Self {
            bus: ll::Bq35100I2cInterface {
                i2c,
                address: config.address,
            },
            delay,
            security_mode: SecurityMode::Unknown,
            gauge_mode: None,
            gauge_enabled: false,
            config,
        }
    }

    pub fn release(self) -> (I, D) {
        (self.bus.i2c, self.delay)
    }

    /// Last security mode read from the device.
    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    /// Last gauge mode read from or written to the device.
    pub fn gauge_mode(&self) -> Option<GaugeMode> {
        self.gauge_mode
    }

    pub fn is_gauge_enabled(&self) -> bool {
        self.gauge_enabled
    }
}

impl<I, D> Bq35100<I, D>
where
    I: I2c,
    D: DelayNs,
{
    /// Probes the device and applies the configuration: gauge mode,
    /// temperature source and design capacity are programmed, the device is
    /// sealed again and the gauge is started.
    pub async fn init(&mut self) -> Result<(), Error<I::Error>> {
        self.probe().await?;
        self.refresh_security_mode().await?;

        let config = self.config;
        self.set_gauge_mode(config.gauge_mode).await?;
        self.use_internal_temp(config.temp_source == TempSource::Internal).await?;

        if config.design_capacity_mah != 0 {
            self.set_design_capacity(config.design_capacity_mah).await?;
        }

        self.set_security_mode(SecurityMode::Sealed).await?;
        self.start_gauge().await?;

        Ok(())
    }

    async fn probe(&mut self) -> Result<(), Error<I::Error>> {
        self.write_subcommand(ll::CTRL_DEVICE_TYPE).await?;
        self.delay.delay_ms(ll::PROBE_SETTLE_MS).await;

        let device_type = self.read_subcommand_response().await?;
        if device_type != ll::DEVICE_TYPE_ID {
            warn!("Wrong device type {}", device_type);
            return Err(Error::WrongDevice);
        }

        Ok(())
    }

    /// Writes a subcommand through the MAC window. The settle delay is a
    /// hardware requirement; the response is undefined before it elapses.
    pub(crate) async fn write_subcommand(&mut self, subcommand: u16) -> Result<(), Error<I::Error>> {
        self.bus.write_register16(ll::CMD_MAC_CONTROL, subcommand).await?;
        self.delay.delay_ms(ll::SUBCOMMAND_SETTLE_MS).await;
        Ok(())
    }

    /// Reads the 16-bit response of the previous subcommand.
    pub(crate) async fn read_subcommand_response(&mut self) -> Result<u16, Error<I::Error>> {
        Ok(self.bus.read_register(ll::CMD_MAC_DATA, 2).await? as u16)
    }

    /// Puts the gauge into ACTIVE mode.
    pub async fn start_gauge(&mut self) -> Result<Confirmation, Error<I::Error>> {
        if self.gauge_enabled {
            debug!("Gauge already enabled");
            return Ok(Confirmation::Confirmed);
        }

        self.write_subcommand(ll::CTRL_GAUGE_START).await?;

        match self
            .wait_for_status(ll::STATUS_GA, ll::STATUS_GA, ll::START_POLL_MS)
            .await
        {
            Ok(()) => {
                debug!("Gauge enabled");
                self.gauge_enabled = true;
                Ok(Confirmation::Confirmed)
            }
            Err(Error::Timeout) => {
                warn!("Gauge start not confirmed");
                self.gauge_enabled = false;
                Ok(Confirmation::Unconfirmed)
            }
            Err(error) => Err(error),
        }
    }

    /// Stops gauging and lets the device finish its outstanding work.
    pub async fn stop_gauge(&mut self) -> Result<Confirmation, Error<I::Error>> {
        if !self.gauge_enabled {
            debug!("Gauge already disabled");
            return Ok(Confirmation::Confirmed);
        }

        self.write_subcommand(ll::CTRL_GAUGE_STOP).await?;

        // Stopping takes a lot longer than starting
        match self.wait_for_status(0, ll::STATUS_GA, ll::STOP_POLL_MS).await {
            Ok(()) => {
                debug!("Gauge stopped");
                self.gauge_enabled = false;
                Ok(Confirmation::Confirmed)
            }
            Err(Error::Timeout) => {
                warn!("Gauge stop not confirmed");
                self.gauge_enabled = true;
                Ok(Confirmation::Unconfirmed)
            }
            Err(error) => Err(error),
        }
    }

    /// Programs the design capacity, in mAh. The flash value is big-endian.
    pub async fn set_design_capacity(&mut self, capacity_mah: u16) -> Result<(), Error<I::Error>> {
        debug!("Setting design capacity to {} mAh", capacity_mah);
        self.write_data_flash(ll::FLASH_DESIGN_CAPACITY, &capacity_mah.to_be_bytes())
            .await
    }

    /// Selects the capacity accounting mode. Rewrites operation config A
    /// only when the stored mode differs, preserving its other bits.
    pub async fn set_gauge_mode(&mut self, mode: GaugeMode) -> Result<(), Error<I::Error>> {
        let mut config = [0];
        self.read_data_flash(ll::FLASH_OPERATION_CFG_A, &mut config).await?;

        if GaugeMode::from_bits(config[0]) != Some(mode) {
            let value = (config[0] & !0b11) | mode as u8;

            self.delay.delay_ms(100).await;
            self.write_data_flash(ll::FLASH_OPERATION_CFG_A, &[value]).await?;
        }

        self.gauge_mode = Some(mode);

        Ok(())
    }

    /// Selects the internal die sensor or the external thermistor as the
    /// temperature source.
    pub async fn use_internal_temp(&mut self, internal: bool) -> Result<(), Error<I::Error>> {
        const EXTERNAL_BIT: u8 = 1 << 7;

        let mut config = [0];
        self.read_data_flash(ll::FLASH_OPERATION_CFG_A, &mut config).await?;

        let internal_now = config[0] & EXTERNAL_BIT == 0;
        if internal_now != internal {
            if internal {
                config[0] &= !EXTERNAL_BIT;
            } else {
                config[0] |= EXTERNAL_BIT;
            }

            self.delay.delay_ms(50).await;
            self.write_data_flash(ll::FLASH_OPERATION_CFG_A, &config).await?;

            debug!("Temperature source set to {}", if internal { "internal" } else { "external" });
        }

        Ok(())
    }

    /// Tells the gauge a fresh battery was inserted, optionally updating
    /// the design capacity first.
    pub async fn new_battery(&mut self, capacity_mah: Option<u16>) -> Result<(), Error<I::Error>> {
        if let Some(capacity) = capacity_mah {
            self.set_design_capacity(capacity).await?;
        }

        self.write_subcommand(ll::CTRL_NEW_BATTERY).await
    }

    pub async fn battery_status(&mut self) -> Result<BatteryStatus, Error<I::Error>> {
        let raw = self.bus.read_register(ll::CMD_BATTERY_STATUS, 1).await?;
        Ok(BatteryStatus(raw as u8))
    }

    pub async fn battery_alert(&mut self) -> Result<BatteryAlert, Error<I::Error>> {
        let raw = self.bus.read_register(ll::CMD_BATTERY_ALERT, 1).await?;
        Ok(BatteryAlert(raw as u8))
    }

    /// Programs which conditions assert the ALERT pin.
    pub async fn set_alert_config(&mut self, mask: u8) -> Result<(), Error<I::Error>> {
        self.write_data_flash(ll::FLASH_ALERT_CFG, &[mask]).await
    }
}
