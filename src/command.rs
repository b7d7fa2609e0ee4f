//! Bootloader command set.
//!
//! Each command is one or more request / acknowledge exchanges over a
//! [`Transport`]. A command is only ever attempted once, retry policy is
//! left to the caller.

use crate::error::{Error, Result};
use crate::protocol::*;
use crate::transport::Transport;

/// Information reported by the bootloader's Get, Get Version and Get ID commands
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct DeviceInfo {
    /// Bootloader protocol version (e.g. 0x31 for v3.1)
    pub version: u8,
    /// Opcodes the bootloader accepts
    pub commands: Vec<u8>,
    /// Read protection option bytes
    pub option_bytes: [u8; 2],
    /// Product ID (e.g. 0x0413 for STM32F40x)
    pub product_id: u16,
}

impl DeviceInfo {
    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&command.opcode())
    }
}

pub struct Bootloader<T> {
    transport: T,
    timeout_ms: u32,
}

impl<T: Transport> Bootloader<T> {
    pub fn new(transport: T, timeout_ms: u32) -> Self {
        Self {
            transport,
            timeout_ms,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn free(self) -> T {
        self.transport
    }

    /// Drop any input the bootloader has not consumed yet
    pub fn discard(&mut self) -> Result<usize> {
        self.transport.discard()
    }

    /// Wait for `min` bytes, dropping any partial response on timeout
    fn await_bytes(&mut self, step: Step, min: usize) -> Result<usize> {
        match self.transport.wait_for_bytes(min, self.timeout_ms)? {
            Some(n) => Ok(n),
            None => {
                let dropped = self.transport.discard()?;
                error!("Timeout awaiting {} response ({} bytes dropped)", step, dropped);
                Err(Error::ResponseTimeout {
                    step,
                    timeout_ms: self.timeout_ms,
                })
            }
        }
    }

    /// Send a frame and await a response of `expected` bytes.
    ///
    /// The first byte is checked on its own, a nack or unexpected value
    /// fails the exchange without waiting for the rest. Returns every
    /// byte received, ack included.
    fn exchange(&mut self, step: Step, frame: &[u8], expected: usize) -> Result<Vec<u8>> {
        self.transport.send(frame)?;

        self.await_bytes(step, 1)?;
        let mut response = self.transport.read_bytes(1)?;

        match response.first() {
            Some(&UART_ACK) => (),
            Some(&UART_NACK) => {
                error!("Received bootloader nack for {}", step);
                return Err(Error::Nack { step });
            }
            Some(&v) => {
                let dropped = self.transport.discard()?;
                error!(
                    "Received unexpected value for {}: 0x{:x} ({} bytes dropped)",
                    step, v, dropped
                );
                return Err(Error::InvalidResponse { step, value: v });
            }
            None => {
                return Err(Error::ResponseTimeout {
                    step,
                    timeout_ms: self.timeout_ms,
                })
            }
        }

        if expected > 1 {
            let available = self.await_bytes(step, expected - 1)?;
            response.extend(self.transport.read_bytes(available)?);
        }

        trace!("{}: ack ({} bytes)", step, response.len());
        Ok(response)
    }

    /// Send the synchronisation character
    pub fn sync(&mut self) -> Result<()> {
        debug!("Sending sync character");
        self.exchange(Step::Sync, &[UART_SYNC], 1)?;
        Ok(())
    }

    /// Fetch the bootloader version and supported commands.
    ///
    /// Returns `(version, opcodes)`.
    pub fn get(&mut self) -> Result<(u8, Vec<u8>)> {
        debug!("GET");
        let r = self.exchange(Step::Get, &Command::Get.frame(), GET_RESPONSE_LEN)?;

        // ack, n, version, n opcodes, ack
        let n = r.get(1).copied().unwrap_or(0) as usize;
        let version = r.get(2).copied().unwrap_or(0);
        let commands = r.get(3..r.len().min(3 + n)).map(|c| c.to_vec()).unwrap_or_default();

        if commands.len() != n {
            warn!("Truncated GET response ({} of {} opcodes)", commands.len(), n);
        }

        Ok((version, commands))
    }

    /// Fetch the bootloader version and read protection option bytes
    pub fn get_version(&mut self) -> Result<(u8, [u8; 2])> {
        debug!("GET VERSION & READ PROTECTION STATUS");
        let r = self.exchange(
            Step::GetVersion,
            &Command::GetVersionReadStatus.frame(),
            GET_VERSION_RESPONSE_LEN,
        )?;

        match r.get(1..4) {
            Some(v) => Ok((v[0], [v[1], v[2]])),
            None => {
                warn!("Short GET VERSION response: {:02x?}", r);
                Ok((0, [0, 0]))
            }
        }
    }

    /// Fetch the product ID
    pub fn get_id(&mut self) -> Result<u16> {
        debug!("GET ID");
        let r = self.exchange(Step::GetId, &Command::GetId.frame(), GET_ID_RESPONSE_LEN)?;

        match r.get(2..4) {
            Some(id) => Ok(u16::from_be_bytes([id[0], id[1]])),
            None => {
                warn!("Short GET ID response: {:02x?}", r);
                Ok(0)
            }
        }
    }

    /// Run Get, Get Version and Get ID, collecting the results
    pub fn device_info(&mut self) -> Result<DeviceInfo> {
        let (version, commands) = self.get()?;
        let (_, option_bytes) = self.get_version()?;
        let product_id = self.get_id()?;

        Ok(DeviceInfo {
            version,
            commands,
            option_bytes,
            product_id,
        })
    }

    /// Mass erase with the (one byte addressed) Erase command
    pub fn erase_all(&mut self) -> Result<()> {
        debug!("ERASE MEMORY");
        self.exchange(Step::Erase, &Command::Erase.frame(), 1)?;
        self.exchange(Step::EraseParams, &ERASE_ALL, 1)?;
        Ok(())
    }

    /// Mass erase with the Extended Erase command
    pub fn extended_erase_all(&mut self) -> Result<()> {
        debug!("EXTENDED ERASE MEMORY");
        self.exchange(Step::ExtendedErase, &Command::ExtendedErase.frame(), 1)?;
        self.exchange(Step::ExtendedEraseParams, &EXTENDED_ERASE_ALL, 1)?;
        Ok(())
    }

    /// Write a block of 1..=256 bytes at `address`
    pub fn write_memory(&mut self, address: FlashAddress, data: &[u8]) -> Result<()> {
        let payload = data_block_frame(data)?;

        debug!("WRITE MEMORY {} ({} bytes)", address, data.len());
        self.exchange(Step::WriteSetup, &Command::WriteMemory.frame(), 1)?;
        self.exchange(Step::WriteAddress, &address_frame(address), 1)?;
        self.exchange(Step::WritePayload, &payload, 1)?;

        Ok(())
    }

    /// Read one full page starting at `address`
    pub fn read_memory(&mut self, address: FlashAddress) -> Result<Vec<u8>> {
        debug!("READ MEMORY {}", address);
        self.exchange(Step::ReadSetup, &Command::ReadMemory.frame(), 1)?;
        self.exchange(Step::ReadAddress, &address_frame(address), 1)?;

        let length = length_frame(PAGE_SIZE)?;
        let r = self.exchange(Step::ReadLength, &length, 1 + PAGE_SIZE)?;

        match r.get(1..=PAGE_SIZE) {
            Some(page) => Ok(page.to_vec()),
            None => Err(Error::ResponseTimeout {
                step: Step::ReadLength,
                timeout_ms: self.timeout_ms,
            }),
        }
    }
}
