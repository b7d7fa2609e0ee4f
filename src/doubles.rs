//! Test doubles for the transport, control lines and serial port.

use std::collections::{BTreeMap, VecDeque};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;

use crate::error::Result;
use crate::protocol::*;
use crate::session::ControlLines;
use crate::transport::Transport;

/// Commands reported by an STM32F4 v3.1 bootloader
const F4_COMMANDS: [u8; 11] = [0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92];

#[derive(Debug, Clone, Copy, PartialEq)]
enum Expect {
    Command,
    EraseParams,
    ExtendedEraseParams,
    WriteAddress,
    WriteData(u32),
    ReadAddress,
    ReadLength(u32),
}

/// Bootloader simulator.
///
/// Parses every frame it is sent, validates checksums and keeps an
/// in-memory flash so written pages can be read back.
#[derive(Debug)]
pub struct Simulator {
    pub sent: Vec<Vec<u8>>,
    pub waits: Vec<(usize, u32)>,
    pub write_addresses: Vec<u32>,
    pub read_addresses: Vec<u32>,
    pub memory: BTreeMap<u32, u8>,
    pub erases: usize,
    pub discards: Vec<usize>,

    /// Nack this opcode instead of accepting it
    pub nack_opcode: Option<u8>,
    /// Nack the payload for this page index this many times
    pub nack_page: Option<(usize, usize)>,
    /// Reply with this byte instead of ack / nack
    pub reply_override: Option<u8>,
    /// Flip the byte at this address when it is read back
    pub corrupt_address: Option<u32>,
    /// Follow every nack with this byte
    pub noise_after_nack: Option<u8>,

    expect: Expect,
    rx: VecDeque<u8>,
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            sent: Vec::new(),
            waits: Vec::new(),
            write_addresses: Vec::new(),
            read_addresses: Vec::new(),
            memory: BTreeMap::new(),
            erases: 0,
            discards: Vec::new(),
            nack_opcode: None,
            nack_page: None,
            reply_override: None,
            corrupt_address: None,
            noise_after_nack: None,
            expect: Expect::Command,
            rx: VecDeque::new(),
        }
    }

    /// Queue bytes as if the target had sent them unprompted
    pub fn inject(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter());
    }

    /// Bytes received but not yet read
    pub fn pending(&self) -> Vec<u8> {
        self.rx.iter().copied().collect()
    }

    /// Number of write payloads the target accepted or rejected
    pub fn payloads_sent(&self) -> usize {
        self.sent
            .iter()
            .filter(|f| f.len() == PAGE_SIZE + 2)
            .count()
    }

    fn reply(&mut self, ok: bool) {
        let b = match self.reply_override {
            Some(b) => b,
            None if ok => UART_ACK,
            None => UART_NACK,
        };
        self.rx.push_back(b);

        if let (UART_NACK, Some(n)) = (b, self.noise_after_nack) {
            self.rx.push_back(n);
        }
    }

    fn command(&mut self, frame: &[u8]) {
        if frame == [UART_SYNC] {
            return self.reply(true);
        }

        if frame.len() != 2 || frame[1] != !frame[0] || self.nack_opcode == Some(frame[0]) {
            return self.reply(false);
        }

        match frame[0] {
            0x00 => {
                self.reply(true);
                self.rx.push_back(F4_COMMANDS.len() as u8);
                self.rx.push_back(0x31);
                self.rx.extend(F4_COMMANDS.iter());
                self.rx.push_back(UART_ACK);
            }
            0x01 => {
                self.reply(true);
                self.rx.extend([0x31, 0x00, 0x00, UART_ACK].iter());
            }
            0x02 => {
                self.reply(true);
                self.rx.extend([0x01, 0x04, 0x13, UART_ACK].iter());
            }
            0x43 => {
                self.expect = Expect::EraseParams;
                self.reply(true);
            }
            0x44 => {
                self.expect = Expect::ExtendedEraseParams;
                self.reply(true);
            }
            0x31 => {
                self.expect = Expect::WriteAddress;
                self.reply(true);
            }
            0x11 => {
                self.expect = Expect::ReadAddress;
                self.reply(true);
            }
            _ => self.reply(false),
        }
    }

    fn address(frame: &[u8]) -> Option<u32> {
        if frame.len() != 5 || checksum(&frame[..4]) != frame[4] {
            return None;
        }
        Some(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]))
    }

    fn erase(&mut self, frame: &[u8], expected: &[u8]) {
        let ok = frame == expected;
        if ok {
            self.memory.clear();
            self.erases += 1;
        }
        self.reply(ok);
    }

    fn write_data(&mut self, address: u32, frame: &[u8]) {
        let valid = frame.len() >= 3
            && frame[0] as usize + 3 == frame.len()
            && checksum(&frame[..frame.len() - 1]) == frame[frame.len() - 1];

        let page = (address.wrapping_sub(FLASH_BASE) as usize) / PAGE_SIZE;
        if let Some((p, times)) = self.nack_page {
            if p == page && times > 0 {
                self.nack_page = Some((p, times - 1));
                return self.reply(false);
            }
        }

        if valid {
            for (i, b) in frame[1..frame.len() - 1].iter().enumerate() {
                self.memory.insert(address.wrapping_add(i as u32), *b);
            }
        }
        self.reply(valid);
    }

    fn read_length(&mut self, address: u32, frame: &[u8]) {
        if frame.len() != 2 || frame[1] != !frame[0] {
            return self.reply(false);
        }

        self.reply(true);
        for i in 0..=frame[0] as u32 {
            let a = address.wrapping_add(i);
            let mut b = self.memory.get(&a).copied().unwrap_or(0xFF);
            if self.corrupt_address == Some(a) {
                b = !b;
            }
            self.rx.push_back(b);
        }
    }
}

impl Transport for Simulator {
    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        self.sent.push(bytes.to_vec());

        let expect = self.expect;
        self.expect = Expect::Command;

        match expect {
            Expect::Command => self.command(bytes),
            Expect::EraseParams => self.erase(bytes, &ERASE_ALL),
            Expect::ExtendedEraseParams => self.erase(bytes, &EXTENDED_ERASE_ALL),
            Expect::WriteAddress => match Self::address(bytes) {
                Some(a) => {
                    self.write_addresses.push(a);
                    self.expect = Expect::WriteData(a);
                    self.reply(true);
                }
                None => self.reply(false),
            },
            Expect::WriteData(a) => self.write_data(a, bytes),
            Expect::ReadAddress => match Self::address(bytes) {
                Some(a) => {
                    self.read_addresses.push(a);
                    self.expect = Expect::ReadLength(a);
                    self.reply(true);
                }
                None => self.reply(false),
            },
            Expect::ReadLength(a) => self.read_length(a, bytes),
        }

        Ok(bytes.len())
    }

    fn wait_for_bytes(&mut self, min: usize, timeout_ms: u32) -> Result<Option<usize>> {
        self.waits.push((min, timeout_ms));
        if self.rx.len() >= min {
            Ok(Some(self.rx.len()))
        } else {
            Ok(None)
        }
    }

    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let count = count.min(self.rx.len());
        Ok(self.rx.drain(..count).collect())
    }

    fn discard(&mut self) -> Result<usize> {
        let n = self.rx.len();
        self.discards.push(n);
        self.rx.clear();
        Ok(n)
    }
}

/// Transport whose target never answers
#[derive(Debug, Default)]
pub struct SilentTransport {
    pub sent: Vec<Vec<u8>>,
    pub waits: Vec<(usize, u32)>,
}

impl Transport for SilentTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        self.sent.push(bytes.to_vec());
        Ok(bytes.len())
    }

    fn wait_for_bytes(&mut self, min: usize, timeout_ms: u32) -> Result<Option<usize>> {
        self.waits.push((min, timeout_ms));
        Ok(None)
    }

    fn read_bytes(&mut self, _count: usize) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn discard(&mut self) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineEvent {
    Reset(bool),
    Boot(bool),
    Delay(u32),
}

/// Control lines recording every change
#[derive(Debug, Default)]
pub struct MockLines {
    pub events: Vec<LineEvent>,
    pub reset: bool,
    pub boot: bool,
}

impl ControlLines for MockLines {
    fn set_reset(&mut self, level: bool) -> Result<()> {
        self.reset = level;
        self.events.push(LineEvent::Reset(level));
        Ok(())
    }

    fn set_boot(&mut self, level: bool) -> Result<()> {
        self.boot = level;
        self.events.push(LineEvent::Boot(level));
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.events.push(LineEvent::Delay(ms));
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockPin {
    pub state: bool,
    pub changes: Vec<bool>,
}

impl OutputPin for MockPin {
    type Error = ();

    fn set_low(&mut self) -> core::result::Result<(), Self::Error> {
        self.state = false;
        self.changes.push(self.state);
        Ok(())
    }

    fn set_high(&mut self) -> core::result::Result<(), Self::Error> {
        self.state = true;
        self.changes.push(self.state);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockDelay {
    pub elapsed_ms: u32,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms = self.elapsed_ms.saturating_add(ms);
    }
}

/// nb serial port fed from `incoming`
#[derive(Debug, Default)]
pub struct MockSerial {
    pub incoming: VecDeque<u8>,
    pub written: Vec<u8>,
    pub flushes: usize,
    /// Number of polls that report nothing before `incoming` is visible
    pub stall_reads: usize,
    pub fail_reads: bool,
}

impl embedded_hal::serial::Read<u8> for MockSerial {
    type Error = &'static str;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        if self.fail_reads {
            return Err(nb::Error::Other("framing error"));
        }
        if self.stall_reads > 0 {
            self.stall_reads -= 1;
            return Err(nb::Error::WouldBlock);
        }
        self.incoming.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl embedded_hal::serial::Write<u8> for MockSerial {
    type Error = &'static str;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.written.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        self.flushes += 1;
        Ok(())
    }
}
