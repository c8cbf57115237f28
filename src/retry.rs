//! Bounded retry primitive shared by status polling and the security state
//! machine. Waiting on the device is always bounded; nothing in this crate
//! polls forever.

use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::{
    fmt::warn,
    ll::{self, STATUS_POLL_ATTEMPTS},
    Bq35100, Error,
};

pub(crate) struct Retry {
    attempts: u8,
    used: u8,
    backoff_ms: u32,
}

impl Retry {
    pub fn new(attempts: u8, backoff_ms: u32) -> Self {
        Self {
            attempts,
            used: 0,
            backoff_ms,
        }
    }

    /// Grants one more attempt, sleeping the backoff interval between
    /// consecutive attempts. Returns `false` once all attempts are used up.
    pub async fn attempt(&mut self, delay: &mut impl DelayNs) -> bool {
        if self.used >= self.attempts {
            return false;
        }

        if self.used > 0 {
            delay.delay_ms(self.backoff_ms).await;
        }

        self.used += 1;
        true
    }
}

impl<I, D> Bq35100<I, D>
where
    I: I2c,
    D: DelayNs,
{
    /// Polls CONTROL_STATUS until `(status & mask) == expected`, up to
    /// [`STATUS_POLL_ATTEMPTS`] reads spaced `interval_ms` apart.
    pub(crate) async fn wait_for_status(
        &mut self,
        expected: u16,
        mask: u16,
        interval_ms: u32,
    ) -> Result<(), Error<I::Error>> {
        let mut retry = Retry::new(STATUS_POLL_ATTEMPTS, interval_ms);

        while retry.attempt(&mut self.delay).await {
            let status = self.control_status().await?;

            if status & mask == expected {
                return Ok(());
            }

            warn!(
                "Status not yet in requested state (read {}, expected {})",
                status & mask,
                expected
            );
        }

        Err(Error::Timeout)
    }

    /// Reads CONTROL_STATUS through the direct control register.
    pub(crate) async fn control_status(&mut self) -> Result<u16, Error<I::Error>> {
        Ok(self.bus.read_register(ll::CMD_CONTROL, 2).await? as u16)
    }
}
