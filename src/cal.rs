//! Calibration flows: raw ADC sample averaging, offset and gain
//! computation, and the packed float format the device stores gain
//! constants in.

use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::{
    fmt::{debug, warn},
    ll,
    retry::Retry,
    Bq35100, Error,
};

const CAL_SAMPLES: u8 = 4;
const CAL_SAMPLE_MS: u32 = 200;
const CAL_POLL_MS: u32 = 1000;
/// Counter polls allowed per distinct sample before giving up.
const CAL_SAMPLE_ATTEMPTS: u8 = 25;

/// Scale factor between CC gain and CC delta.
const CC_DELTA_SCALE: f32 = 1_193_046.0;

/// Raw ADC registers readable in calibration mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalCommand {
    Voltage,
    Current,
    Temperature,
}

impl CalCommand {
    fn register(self) -> u8 {
        match self {
            Self::Voltage => ll::CMD_CAL_VOLTAGE,
            Self::Current => ll::CMD_CAL_CURRENT,
            Self::Temperature => ll::CMD_CAL_TEMPERATURE,
        }
    }
}

impl<I, D> Bq35100<I, D>
where
    I: I2c,
    D: DelayNs,
{
    /// Enters or leaves calibration mode. A missed confirmation is logged
    /// but tolerated, so a calibration run keeps progressing even when the
    /// device is slow to raise the flag.
    pub async fn enter_cal_mode(&mut self, enable: bool) -> Result<(), Error<I::Error>> {
        self.delay.delay_ms(1000).await;

        let subcommand = if enable {
            ll::CTRL_ENTER_CAL
        } else {
            ll::CTRL_EXIT_CAL
        };
        self.write_subcommand(subcommand).await?;

        let expected = if enable { ll::STATUS_CAL_MODE } else { 0 };
        match self.wait_for_status(expected, ll::STATUS_CAL_MODE, CAL_POLL_MS).await {
            Err(Error::Timeout) => {
                warn!("Calibration mode change not confirmed");
            }
            other => other?,
        }

        debug!("Calibration mode {}", if enable { "enabled" } else { "disabled" });

        Ok(())
    }

    /// Averages four distinct raw ADC samples of `command`.
    ///
    /// The ADC conversion counter de-duplicates samples: a sample is only
    /// taken when the counter has advanced since the previous poll, so the
    /// four values are guaranteed to come from four conversions.
    pub async fn sample_average(&mut self, command: CalCommand) -> Result<i16, Error<I::Error>> {
        self.enter_cal_mode(true).await?;

        let result = self.sample_average_inner(command).await;
        let exited = self.enter_cal_mode(false).await;

        let average = result?;
        exited?;

        Ok(average)
    }

    async fn sample_average_inner(&mut self, command: CalCommand) -> Result<i16, Error<I::Error>> {
        let mut last_counter = self.read_cal_counter().await?;
        let mut sum = 0i32;

        for _ in 0..CAL_SAMPLES {
            let mut retry = Retry::new(CAL_SAMPLE_ATTEMPTS, CAL_SAMPLE_MS);

            let raw = loop {
                if !retry.attempt(&mut self.delay).await {
                    return Err(Error::Timeout);
                }

                let counter = self.read_cal_counter().await?;
                if counter != last_counter {
                    last_counter = counter;
                    break self.bus.read_register(command.register(), 2).await? as u16 as i16;
                }
            };

            debug!("Calibration sample: {}", raw);
            sum += raw as i32;
        }

        let average = sum / CAL_SAMPLES as i32;
        debug!("Calibration average: {}", average);

        Ok(average as i16)
    }

    async fn read_cal_counter(&mut self) -> Result<u8, Error<I::Error>> {
        Ok(self.bus.read_register(ll::CMD_CAL_COUNT, 1).await? as u8)
    }

    /// Calibrates the voltage ADC against a measured cell voltage in mV.
    pub async fn calibrate_voltage(&mut self, known_mv: u16) -> Result<(), Error<I::Error>> {
        let average = self.sample_average(CalCommand::Voltage).await?;

        let offset = known_mv as i32 - average as i32;
        debug!("Voltage calibration difference: {}", offset);

        let offset = i8::try_from(offset).map_err(|_| Error::OffsetOutOfRange)?;

        self.delay.delay_ms(1000).await;
        self.write_data_flash(ll::FLASH_PACK_V_OFFSET, &[offset as u8]).await
    }

    /// Calibrates the coulomb counter against a known constant current in
    /// mA flowing through the sense resistor.
    pub async fn calibrate_current(&mut self, known_ma: u16) -> Result<(), Error<I::Error>> {
        let mut buffer = [0; 2];
        self.read_data_flash(ll::FLASH_CC_OFFSET, &mut buffer).await?;
        let cc_offset = i16::from_be_bytes(buffer);

        let mut buffer = [0; 1];
        self.read_data_flash(ll::FLASH_BOARD_OFFSET, &mut buffer).await?;
        let board_offset = buffer[0] as i8;

        self.delay.delay_ms(1000).await;
        let average = self.sample_average(CalCommand::Current).await?;

        let correction = (cc_offset as i32 + board_offset as i32) / 16;
        let gain = known_ma as f32 / (average as i32 - correction) as f32;
        let delta = gain * CC_DELTA_SCALE;

        debug!("CC gain: {}, delta: {}", gain, delta);

        self.delay.delay_ms(1000).await;
        self.write_data_flash(ll::FLASH_CC_GAIN, &float_to_device_format(gain))
            .await?;

        self.delay.delay_ms(50).await;
        self.write_data_flash(ll::FLASH_CC_DELTA, &float_to_device_format(delta))
            .await
    }

    /// Calibrates the active temperature source against a reference in
    /// 0.1 K. The source is taken from operation config A, so select it
    /// with [`Bq35100::use_internal_temp`] beforehand.
    pub async fn calibrate_temperature(&mut self, known_dk: u16) -> Result<(), Error<I::Error>> {
        let mut config = [0];
        self.read_data_flash(ll::FLASH_OPERATION_CFG_A, &mut config).await?;
        let external = config[0] & (1 << 7) != 0;

        debug!(
            "Calibrating {} temperature",
            if external { "external" } else { "internal" }
        );

        self.delay.delay_ms(1000).await;
        let average = self.sample_average(CalCommand::Temperature).await?;

        let offset = known_dk as i32 - average as i32;
        debug!("Temperature calibration difference: {}", offset);

        let offset = i8::try_from(offset).map_err(|_| Error::OffsetOutOfRange)?;

        let address = if external {
            ll::FLASH_EXT_TEMP_OFFSET
        } else {
            ll::FLASH_INT_TEMP_OFFSET
        };

        self.delay.delay_ms(1000).await;
        self.write_data_flash(address, &[offset as u8]).await
    }
}

/// Packs a float into the device's 4-byte storage format: three mantissa
/// bytes with the sign in bit 7 of the high byte, and a biased exponent.
///
/// The mantissa is normalized into `[0.5, 1.0)` by doubling or halving
/// while counting the exponent; the exponent saturates at the bounds of
/// its biased byte, which also keeps the loops bounded for non-finite
/// inputs.
pub fn float_to_device_format(value: f32) -> [u8; 4] {
    // Nudge values sitting just below a power of two over the boundary
    const ROUNDING_GUARD: f32 = 1.0 + 1.0 / (1 << 25) as f32;

    let magnitude = if value < 0.0 { -value } else { value };

    let mut exponent = 0i32;
    let mut normalized = magnitude * ROUNDING_GUARD;

    if normalized < 0.5 {
        while normalized < 0.5 && exponent > -128 {
            normalized *= 2.0;
            exponent -= 1;
        }
    } else {
        while normalized >= 1.0 && exponent < 127 {
            normalized /= 2.0;
            exponent += 1;
        }
    }

    // Rescale the magnitude itself so rounding of the guard doesn't leak
    // into the stored mantissa.
    let mut mantissa = magnitude;
    let mut scale = exponent;
    while scale > 0 {
        mantissa /= 2.0;
        scale -= 1;
    }
    while scale < 0 {
        mantissa *= 2.0;
        scale += 1;
    }

    let mut bytes = [0; 4];

    // The high mantissa byte drops its implicit leading bit to make room
    // for the sign.
    let mut rest = mantissa * 256.0 - 128.0;
    bytes[2] = rest as u8;
    rest = (rest - bytes[2] as f32) * 256.0;
    bytes[1] = rest as u8;
    rest = (rest - bytes[1] as f32) * 256.0;
    bytes[0] = rest as u8;

    if value.is_sign_negative() {
        bytes[2] |= 0x80;
    }

    bytes[3] = (exponent + 128) as u8;

    bytes
}
