//! Measurement registers and the channel table.
//!
//! Every readable quantity is one row in [`CHANNELS`]: the direct command,
//! the register width and a decode function. [`Bq35100::fetch_all`] walks
//! the table instead of branching per channel.

use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::{ll, Bq35100, Error};

/// Readable quantities of the gauge.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Channel {
    /// Temperature of the selected source, in 0.1 K.
    Temperature,
    /// Die temperature, in 0.1 K.
    InternalTemperature,
    /// Cell voltage, in mV.
    Voltage,
    /// Average cell current, in mA. Only measured while the gauge is active.
    AverageCurrent,
    /// State of health, in percent.
    StateOfHealth,
    /// Capacity drawn from the cell, in µAh.
    AccumulatedCapacity,
    /// Configured cell capacity, in mAh.
    DesignCapacity,
}

/// One snapshot of every channel, in the units listed on [`Channel`].
#[derive(Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurements {
    pub temperature: u16,
    pub internal_temperature: u16,
    pub voltage: u16,
    /// `None` while the gauge is not active.
    pub avg_current: Option<i16>,
    pub state_of_health: u8,
    pub accumulated_capacity: u32,
    pub design_capacity: u16,
}

impl Measurements {
    /// Returns a channel value as a plain integer in the channel's native
    /// unit, or `None` when the value is not available.
    pub fn channel(&self, channel: Channel) -> Option<i32> {
        match channel {
            Channel::Temperature => Some(self.temperature as i32),
            Channel::InternalTemperature => Some(self.internal_temperature as i32),
            Channel::Voltage => Some(self.voltage as i32),
            Channel::AverageCurrent => self.avg_current.map(i32::from),
            Channel::StateOfHealth => Some(self.state_of_health as i32),
            Channel::AccumulatedCapacity => Some(self.accumulated_capacity as i32),
            Channel::DesignCapacity => Some(self.design_capacity as i32),
        }
    }
}

struct ChannelRead {
    command: u8,
    width: usize,
    /// Current is only valid while the gauge is measuring.
    needs_gauge: bool,
    apply: fn(&mut Measurements, u32),
}

const CHANNELS: &[ChannelRead] = &[
    ChannelRead {
        command: ll::CMD_TEMPERATURE,
        width: 2,
        needs_gauge: false,
        apply: |m, raw| m.temperature = raw as u16,
    },
    ChannelRead {
        command: ll::CMD_INTERNAL_TEMP,
        width: 2,
        needs_gauge: false,
        apply: |m, raw| m.internal_temperature = raw as u16,
    },
    ChannelRead {
        command: ll::CMD_VOLTAGE,
        width: 2,
        needs_gauge: false,
        apply: |m, raw| m.voltage = raw as u16,
    },
    ChannelRead {
        command: ll::CMD_CURRENT,
        width: 2,
        needs_gauge: true,
        apply: |m, raw| m.avg_current = Some(raw as u16 as i16),
    },
    ChannelRead {
        command: ll::CMD_SOH,
        width: 1,
        needs_gauge: false,
        apply: |m, raw| m.state_of_health = raw as u8,
    },
    ChannelRead {
        command: ll::CMD_ACCUMULATED_CAPACITY,
        width: 4,
        needs_gauge: false,
        // The register counts charge removed as a negative quantity.
        apply: |m, raw| m.accumulated_capacity = raw.wrapping_neg(),
    },
    ChannelRead {
        command: ll::CMD_DESIGN_CAPACITY,
        width: 2,
        needs_gauge: false,
        apply: |m, raw| m.design_capacity = raw as u16,
    },
];

impl<I, D> Bq35100<I, D>
where
    I: I2c,
    D: DelayNs,
{
    /// Reads every measurement register in sequence.
    pub async fn fetch_all(&mut self) -> Result<Measurements, Error<I::Error>> {
        let mut measurements = Measurements::default();

        for channel in CHANNELS {
            if channel.needs_gauge && !self.gauge_enabled {
                continue;
            }

            let raw = self.bus.read_register(channel.command, channel.width).await?;
            (channel.apply)(&mut measurements, raw);
        }

        Ok(measurements)
    }
}
