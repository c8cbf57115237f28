//! Security state machine.
//!
//! The gauge gates data flash and a handful of subcommands behind three
//! access tiers. Transitions are not arbitrary: full access is only
//! reachable from unsealed, and a full-access device has to seal before it
//! can return to unsealed. [`Bq35100::set_security_mode`] walks the
//! intermediate hops automatically and confirms every hop against the
//! security field of CONTROL_STATUS.

use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::{
    fmt::{debug, error, warn},
    ll::{self, SECURITY_ATTEMPTS, SECURITY_BACKOFF_MS, SECURITY_SETTLE_MS},
    retry::Retry,
    Bq35100, Error,
};

/// Access tier reported by CONTROL_STATUS bits 14:13.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityMode {
    /// The mode has not been read from the device yet, or the device
    /// reported the reserved code.
    Unknown,
    FullAccess,
    Unsealed,
    Sealed,
}

impl SecurityMode {
    pub(crate) fn from_status(status: u16) -> Self {
        match (status >> ll::STATUS_SEC_SHIFT) & ll::STATUS_SEC_MASK {
            0b01 => Self::FullAccess,
            0b10 => Self::Unsealed,
            0b11 => Self::Sealed,
            _ => Self::Unknown,
        }
    }
}

impl<I, D> Bq35100<I, D>
where
    I: I2c,
    D: DelayNs,
{
    /// Re-reads the security mode from the device and updates the cache.
    pub async fn refresh_security_mode(&mut self) -> Result<SecurityMode, Error<I::Error>> {
        let status = self.control_status().await?;
        self.security_mode = SecurityMode::from_status(status);
        debug!("Device security mode: {:?}", self.security_mode);
        Ok(self.security_mode)
    }

    /// Transitions the device to `target`, passing through intermediate
    /// modes where the device requires it. Requesting the current mode is a
    /// no-op that touches no bus traffic.
    pub async fn set_security_mode(
        &mut self,
        target: SecurityMode,
    ) -> Result<(), Error<I::Error>> {
        if target == SecurityMode::Unknown {
            return Err(Error::InvalidArgument);
        }

        while self.security_mode != target {
            let next = match (self.security_mode, target) {
                // Full access only exposes unseal from sealed
                (SecurityMode::FullAccess, SecurityMode::Unsealed) => SecurityMode::Sealed,
                // Full access keys are only accepted while unsealed
                (SecurityMode::Sealed, SecurityMode::FullAccess) => SecurityMode::Unsealed,
                _ => target,
            };

            self.transition(next).await?;
        }

        Ok(())
    }

    /// One transition hop, retried with backoff until the device confirms.
    async fn transition(&mut self, target: SecurityMode) -> Result<(), Error<I::Error>> {
        let mut retry = Retry::new(SECURITY_ATTEMPTS, SECURITY_BACKOFF_MS);

        while retry.attempt(&mut self.delay).await {
            match target {
                SecurityMode::Sealed => self.write_subcommand(ll::CTRL_SEALED).await?,
                SecurityMode::Unsealed => {
                    self.write_unlock_code(ll::DEFAULT_UNSEAL_CODES).await?;
                }
                SecurityMode::FullAccess => {
                    // The routing above guarantees we arrive here unsealed;
                    // anything else cannot read the keys out of data flash.
                    if self.security_mode != SecurityMode::Unsealed {
                        return Err(Error::Security);
                    }

                    let code = self.read_full_access_code().await?;
                    self.write_unlock_code(code).await?;
                }
                SecurityMode::Unknown => return Err(Error::InvalidArgument),
            }

            self.delay.delay_ms(SECURITY_SETTLE_MS).await;

            if self.refresh_security_mode().await? == target {
                debug!("Security mode set to {:?}", target);
                return Ok(());
            }

            warn!(
                "Security mode set failed (wanted {:?}, got {:?}), will retry",
                target, self.security_mode
            );
        }

        error!("Security mode transition failed");
        Err(Error::Security)
    }

    /// Writes a 32-bit unlock code as two subcommands, high half first.
    async fn write_unlock_code(&mut self, code: u32) -> Result<(), Error<I::Error>> {
        self.write_subcommand((code >> 16) as u16).await?;
        self.write_subcommand(code as u16).await
    }

    /// The full access keys live in data flash, stored big-endian. This
    /// reads through the raw block path: the caller already holds the
    /// required security mode, and going through the public accessor would
    /// make the transition futures cyclic.
    async fn read_full_access_code(&mut self) -> Result<u32, Error<I::Error>> {
        let mut code = [0; 4];
        let read = self
            .read_data_flash_raw(ll::FLASH_FULL_ACCESS_CODES, &mut code)
            .await?;

        if read < code.len() {
            return Err(Error::MalformedResponse);
        }

        Ok(u32::from_be_bytes(code))
    }
}
