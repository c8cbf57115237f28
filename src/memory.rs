//! Data flash (extended memory) access through the MAC window.
//!
//! Blocks of up to 32 bytes are framed as
//! `[address:2][payload][checksum:1][length:1]` where the length field is
//! `payload + 4` and the checksum covers the address and payload bytes.
//! Flash access requires the device to be unsealed; a sealed device is
//! transiently unsealed and restored to its previous mode on every exit
//! path, error paths included.

use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::{
    fmt::{debug, error},
    ll::{self, FLASH_BASE, FLASH_END, MAX_BLOCK_LEN},
    Bq35100, Error, SecurityMode,
};

/// One's-complement checksum over a data flash frame.
pub(crate) fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte));
    0xFF - sum
}

impl<I, D> Bq35100<I, D>
where
    I: I2c,
    D: DelayNs,
{
    /// Reads up to `buffer.len()` bytes of data flash starting at `address`.
    ///
    /// Returns the number of bytes copied, which is the smaller of the
    /// buffer size and the payload the device returned.
    pub async fn read_data_flash(
        &mut self,
        address: u16,
        buffer: &mut [u8],
    ) -> Result<usize, Error<I::Error>> {
        self.check_flash_access(address)?;

        let previous = self.security_mode;
        if previous == SecurityMode::Sealed {
            self.set_security_mode(SecurityMode::Unsealed).await?;
        }

        let result = self.read_data_flash_raw(address, buffer).await;
        let restored = self.restore_security_mode(previous).await;

        let read = result?;
        restored?;

        Ok(read)
    }

    /// Writes a 1..=32 byte block of data flash at `address`.
    ///
    /// The commit sequence is payload, then checksum, then length; the
    /// device only burns the block once the length register is written, and
    /// CONTROL_STATUS is read back afterwards to catch a failed burn.
    pub async fn write_data_flash(
        &mut self,
        address: u16,
        data: &[u8],
    ) -> Result<(), Error<I::Error>> {
        self.check_flash_access(address)?;

        if data.is_empty() || data.len() > MAX_BLOCK_LEN {
            return Err(Error::InvalidArgument);
        }

        let previous = self.security_mode;
        if previous == SecurityMode::Sealed {
            self.set_security_mode(SecurityMode::Unsealed).await?;
        }

        let result = self.write_data_flash_raw(address, data).await;
        let restored = self.restore_security_mode(previous).await;

        result?;
        restored?;

        Ok(())
    }

    fn check_flash_access(&self, address: u16) -> Result<(), Error<I::Error>> {
        if self.security_mode == SecurityMode::Unknown {
            error!("Security mode is unknown");
            return Err(Error::Security);
        }

        if !(FLASH_BASE..=FLASH_END).contains(&address) {
            return Err(Error::InvalidArgument);
        }

        Ok(())
    }

    async fn restore_security_mode(
        &mut self,
        previous: SecurityMode,
    ) -> Result<(), Error<I::Error>> {
        if self.security_mode != previous {
            self.set_security_mode(previous).await
        } else {
            Ok(())
        }
    }

    /// Block read without the precondition checks or the transient unseal;
    /// the security state machine uses this to fetch its own keys.
    pub(crate) async fn read_data_flash_raw(
        &mut self,
        address: u16,
        buffer: &mut [u8],
    ) -> Result<usize, Error<I::Error>> {
        // Writing the address as a subcommand opens the block for reading.
        self.write_subcommand(address).await?;
        self.delay.delay_ms(ll::FLASH_OPEN_MS).await;

        // 2 address bytes, 32 payload bytes, checksum, length
        let mut frame = [0; 36];
        self.bus.burst_read(ll::CMD_MAC_CONTROL, &mut frame).await?;

        let echoed = u16::from_le_bytes([frame[0], frame[1]]);
        if echoed != address {
            error!("Address didn't match (expected {}, received {})", address, echoed);
            return Err(Error::AddressMismatch);
        }

        let length = frame[35] as usize;
        if !(4..=frame.len()).contains(&length) {
            return Err(Error::MalformedResponse);
        }

        let computed = checksum(&frame[..length - 2]);
        if frame[34] != computed {
            error!("Checksum didn't match (expected {})", computed);
            return Err(Error::ChecksumMismatch);
        }

        // Address, checksum and length fields are not payload.
        let read = (length - 4).min(buffer.len());
        buffer[..read].copy_from_slice(&frame[2..2 + read]);

        Ok(read)
    }

    async fn write_data_flash_raw(
        &mut self,
        address: u16,
        data: &[u8],
    ) -> Result<(), Error<I::Error>> {
        let mut frame = [0; 3 + MAX_BLOCK_LEN];
        frame[0] = ll::CMD_MAC_CONTROL;
        frame[1..3].copy_from_slice(&address.to_le_bytes());
        frame[3..3 + data.len()].copy_from_slice(data);

        self.bus.burst_write(&frame[..3 + data.len()]).await?;

        let sum = checksum(&frame[1..3 + data.len()]);
        self.bus.burst_write(&[ll::CMD_MAC_DATA_SUM, sum]).await?;

        // The length write commits the transfer.
        let length = (data.len() + 4) as u8;
        self.bus.burst_write(&[ll::CMD_MAC_DATA_LEN, length]).await?;

        self.delay.delay_ms(ll::FLASH_COMMIT_MS).await;

        let status = self.control_status().await?;
        if status & ll::STATUS_FLASHF != 0 {
            error!("Writing data flash failed");
            return Err(Error::FlashWrite);
        }

        debug!("Write of {} bytes at {} successful", data.len(), address);

        Ok(())
    }
}
