//! Wire format of the STM32 USART bootloader (AN3155).
//!
//! Everything in here is pure: frames are built as fresh values from
//! validated inputs and no I/O is performed.

use core::fmt;

use crate::error::Error;

/// Auto-baud / synchronisation character
pub const UART_SYNC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Flash page (and maximum read / write block) size
pub const PAGE_SIZE: usize = 256;

/// Start of program memory on STM32 parts
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Byte appended to a short final chunk to fill a page
pub const PAD_BYTE: u8 = 0x00;

/// Global (mass) erase parameter for the Erase command
pub const ERASE_ALL: [u8; 2] = [0xFF, 0x00];

/// Global (mass) erase parameter for the Extended Erase command
pub const EXTENDED_ERASE_ALL: [u8; 3] = [0xFF, 0xFF, 0x00];

/// Bytes returned by Get: ack, count, version, 11 opcodes, ack
pub const GET_RESPONSE_LEN: usize = 15;
/// Bytes returned by Get Version: ack, version, two option bytes, ack
pub const GET_VERSION_RESPONSE_LEN: usize = 5;
/// Bytes returned by Get ID: ack, count, two id bytes, ack
pub const GET_ID_RESPONSE_LEN: usize = 5;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    /// Opcode byte sent on the wire
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Two byte command frame for this command
    pub fn frame(self) -> [u8; 2] {
        command_frame(self.opcode())
    }
}

/// Build a command frame: the opcode followed by its one's complement.
pub fn command_frame(opcode: u8) -> [u8; 2] {
    [opcode, !opcode]
}

/// Build the length parameter of a Read Memory command for `count` bytes.
///
/// The frame is `N - 1` followed by its complement, so a full page encodes
/// as `[0xFF, 0x00]`. Counts outside `1..=256` are rejected.
pub fn length_frame(count: usize) -> Result<[u8; 2], Error> {
    if count == 0 || count > PAGE_SIZE {
        return Err(Error::InvalidPayloadSize(count));
    }

    let n = (count - 1) as u8;
    Ok([n, !n])
}

/// XOR of every byte in `data`
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Build the address frame: four big-endian address bytes followed by their XOR.
pub fn address_frame(address: FlashAddress) -> [u8; 5] {
    let [a0, a1, a2, a3] = address.bytes();
    [a0, a1, a2, a3, a0 ^ a1 ^ a2 ^ a3]
}

/// Build a data block frame for Write Memory.
///
/// The frame is the length byte (`N - 1`), the payload, then the XOR of the
/// length byte and every payload byte.
pub fn data_block_frame(payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.is_empty() || payload.len() > PAGE_SIZE {
        return Err(Error::InvalidPayloadSize(payload.len()));
    }

    let len = (payload.len() - 1) as u8;

    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(len);
    frame.extend_from_slice(payload);
    frame.push(len ^ checksum(payload));

    Ok(frame)
}

/// Target memory address, held as the four big-endian bytes sent on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct FlashAddress([u8; 4]);

impl FlashAddress {
    pub const fn new(address: u32) -> Self {
        Self(address.to_be_bytes())
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    pub fn value(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Advance by one page.
    ///
    /// Carries from byte 2 into bytes 1 and 0, wrapping at the top of the
    /// 32-bit address space like the bootloader itself does.
    pub fn next_page(self) -> Self {
        Self::new(self.value().wrapping_add(PAGE_SIZE as u32))
    }

    /// Address `offset` bytes past this one
    pub fn offset(self, offset: usize) -> u32 {
        self.value().wrapping_add(offset as u32)
    }
}

impl Default for FlashAddress {
    fn default() -> Self {
        Self::new(FLASH_BASE)
    }
}

impl From<u32> for FlashAddress {
    fn from(address: u32) -> Self {
        Self::new(address)
    }
}

impl fmt::Debug for FlashAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlashAddress(0x{:08x})", self.value())
    }
}

impl fmt::Display for FlashAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.value())
    }
}

/// A single exchange within a bootloader command, used to report which
/// part of a command failed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Step {
    Sync,
    Get,
    GetVersion,
    GetId,
    Erase,
    EraseParams,
    ExtendedErase,
    ExtendedEraseParams,
    WriteSetup,
    WriteAddress,
    WritePayload,
    ReadSetup,
    ReadAddress,
    ReadLength,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Sync => "sync",
            Step::Get => "get",
            Step::GetVersion => "get version",
            Step::GetId => "get id",
            Step::Erase => "erase",
            Step::EraseParams => "erase parameters",
            Step::ExtendedErase => "extended erase",
            Step::ExtendedEraseParams => "extended erase parameters",
            Step::WriteSetup => "write memory",
            Step::WriteAddress => "write address",
            Step::WritePayload => "write data",
            Step::ReadSetup => "read memory",
            Step::ReadAddress => "read address",
            Step::ReadLength => "read length",
        };
        f.write_str(s)
    }
}
