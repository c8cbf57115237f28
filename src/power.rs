//! Power sequencing for boards that wire up the gauge enable (GE) pin.
//!
//! The policy of *when* to power the gauge lives with the caller; this
//! wrapper only owns the ordering: the GE pin comes up before the gauge is
//! started, and the gauge is stopped before the pin goes down.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::{Bq35100, Confirmation, Error};

/// GE pin settle time before the device accepts commands.
const ENABLE_SETTLE_MS: u32 = 200;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerError<E, P> {
    Gauge(Error<E>),
    Pin(P),
}

pub struct PoweredGauge<I, D, EN> {
    pub gauge: Bq35100<I, D>,
    enable: EN,
}

impl<I, D, EN> PoweredGauge<I, D, EN>
where
    I: I2c,
    D: DelayNs,
    EN: OutputPin,
{
    pub fn new(gauge: Bq35100<I, D>, enable: EN) -> Self {
        Self { gauge, enable }
    }

    /// Raises the GE pin and starts gauging once the device has booted.
    pub async fn resume(&mut self) -> Result<Confirmation, PowerError<I::Error, EN::Error>> {
        self.enable.set_high().map_err(PowerError::Pin)?;
        self.gauge.delay.delay_ms(ENABLE_SETTLE_MS).await;

        self.gauge.start_gauge().await.map_err(PowerError::Gauge)
    }

    /// The gauge has no standby state between active and off.
    pub fn suspend(&mut self) -> Result<(), PowerError<I::Error, EN::Error>> {
        Err(PowerError::Gauge(Error::Unsupported))
    }

    /// Stops gauging, then cuts power via the GE pin.
    pub async fn off(&mut self) -> Result<Confirmation, PowerError<I::Error, EN::Error>> {
        let confirmation = self.gauge.stop_gauge().await.map_err(PowerError::Gauge)?;
        self.enable.set_low().map_err(PowerError::Pin)?;

        Ok(confirmation)
    }

    pub fn release(self) -> (Bq35100<I, D>, EN) {
        (self.gauge, self.enable)
    }
}
