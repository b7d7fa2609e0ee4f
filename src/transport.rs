//! Byte transport to the target's bootloader UART.

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::error::{Error, Result};

/// Half-duplex byte channel with count-based receive.
pub trait Transport {
    /// Transmit every byte of `bytes`, returning the number written
    fn send(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Block until at least `min` bytes are buffered or `timeout_ms`
    /// elapses. Returns the buffered count, or `None` on timeout.
    /// Buffered bytes are not consumed.
    fn wait_for_bytes(&mut self, min: usize, timeout_ms: u32) -> Result<Option<usize>>;

    /// Consume `count` buffered bytes.
    ///
    /// Callers confirm availability with `wait_for_bytes` first, asking for
    /// more than is buffered returns only what is there.
    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>>;

    /// Drop everything received so far, returning the number of bytes
    /// discarded
    fn discard(&mut self) -> Result<usize>;
}

/// [`Transport`] over an embedded-hal serial port.
///
/// Receive data is drained from the port into a local buffer while waiting,
/// polling every `poll_delay_ms`.
pub struct SerialTransport<P, D> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
    rx: VecDeque<u8>,
}

impl<P, D, E> SerialTransport<P, D>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms: poll_delay_ms.max(1),
            rx: VecDeque::new(),
        }
    }

    /// Release the underlying port
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Move everything the port currently has into the local buffer
    fn drain(&mut self) -> Result<()> {
        loop {
            match self.port.read() {
                Ok(b) => self.rx.push_back(b),
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(Error::serial(e)),
            }
        }
    }
}

impl<P, D, E> Transport for SerialTransport<P, D>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        for b in bytes {
            block!(self.port.write(*b)).map_err(Error::serial)?;
        }
        block!(self.port.flush()).map_err(Error::serial)?;

        trace!("Wrote {} bytes", bytes.len());

        Ok(bytes.len())
    }

    fn wait_for_bytes(&mut self, min: usize, timeout_ms: u32) -> Result<Option<usize>> {
        let mut t = 0;

        loop {
            self.drain()?;

            if self.rx.len() >= min {
                return Ok(Some(self.rx.len()));
            }

            if t >= timeout_ms {
                trace!("Timeout waiting for {} bytes ({} buffered)", min, self.rx.len());
                return Ok(None);
            }

            // Wait for delay period
            self.delay.delay_ms(self.poll_delay_ms);
            t = t.saturating_add(self.poll_delay_ms);
        }
    }

    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let count = count.min(self.rx.len());
        Ok(self.rx.drain(..count).collect())
    }

    fn discard(&mut self) -> Result<usize> {
        self.drain()?;

        let n = self.rx.len();
        if n > 0 {
            debug!("Discarding {} stale bytes: {:02x?}", n, self.rx);
        }
        self.rx.clear();

        Ok(n)
    }
}
