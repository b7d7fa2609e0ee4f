//! STM32 in-system flash programmer.
//!
//! Drives the factory USART bootloader (AN3155) of a target STM32 to erase,
//! write and verify its program memory, controlling the target's reset and
//! BOOT0 lines to enter and leave the bootloader.

use std::io::{Read, Seek};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod command;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod doubles;

pub use command::{Bootloader, DeviceInfo};
pub use error::{Error, Result};
pub use protocol::{FlashAddress, Step, FLASH_BASE, PAGE_SIZE};
pub use session::{ControlLines, EraseMode, GpioLines, Session, State};
pub use transfer::{PageFailure, Phase, Progress, TransferReport};
pub use transport::{SerialTransport, Transport};

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="5000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,

    /// Period to hold the device in reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value="100"))]
    pub reset_hold_ms: u32,

    /// Period to wait for the device to boot after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value="500"))]
    pub boot_delay_ms: u32,

    /// Flash address the image is written to
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0x08000000", parse(try_from_str = parse_address)))]
    pub base_address: u32,

    /// Mass erase command(s) to use (both, standard, extended, auto, skip)
    #[cfg_attr(feature = "structopt", structopt(long, default_value="both"))]
    pub erase: EraseMode,

    /// Number of times a failed page is retried
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0"))]
    pub retries: u32,

    /// Skip the read back verification pass
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_verify: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 5000,
            poll_delay_ms: 1,
            reset_hold_ms: 100,
            boot_delay_ms: 500,
            base_address: FLASH_BASE,
            erase: EraseMode::Both,
            retries: 0,
            no_verify: false,
        }
    }
}

/// Parse a decimal or `0x` prefixed hexadecimal address
pub fn parse_address(s: &str) -> core::result::Result<u32, std::num::ParseIntError> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Connect, setup or close failure of a flashing run
#[derive(Debug)]
pub struct Failure {
    pub phase: Phase,
    pub error: Error,
}

/// Outcome of a flashing run
#[derive(Debug, Default)]
pub struct FlashReport {
    pub device: Option<DeviceInfo>,
    pub write: Option<TransferReport>,
    pub verify: Option<TransferReport>,
    pub failure: Option<Failure>,
}

impl FlashReport {
    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }

    /// The error that ended the run, with the phase it occurred in
    pub fn error(&self) -> Option<(Phase, &Error)> {
        page_error(Phase::Write, &self.write)
            .or_else(|| page_error(Phase::Verify, &self.verify))
            .or_else(|| self.failure.as_ref().map(|f| (f.phase, &f.error)))
    }

    /// Protocol step that failed, if the run ended on a command failure
    pub fn failed_step(&self) -> Option<Step> {
        self.error().and_then(|(_, e)| e.step())
    }
}

fn page_error(phase: Phase, report: &Option<TransferReport>) -> Option<(Phase, &Error)> {
    report
        .as_ref()
        .and_then(|r| r.failure.as_ref())
        .map(|f| (phase, &f.error))
}

pub struct Programmer<T: Transport, L: ControlLines> {
    bootloader: Bootloader<T>,
    lines: L,
    options: Options,
    abort: Option<Arc<AtomicBool>>,
}

impl<T: Transport, L: ControlLines> Programmer<T, L> {
    /// Create a new programmer instance
    pub fn new(transport: T, lines: L, options: Options) -> Self {
        let bootloader = Bootloader::new(transport, options.response_timeout_ms);
        Self {
            bootloader,
            lines,
            options,
            abort: None,
        }
    }

    /// Check `abort` before every page, stopping the transfer once it is set
    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn free(self) -> (T, L) {
        (self.bootloader.free(), self.lines)
    }

    /// Enter the bootloader and synchronise.
    ///
    /// The session holds the transport and control lines until it is closed
    /// or dropped.
    pub fn open_session(&mut self) -> Result<Session<'_, T, L>> {
        Session::open(
            &mut self.bootloader,
            &mut self.lines,
            &self.options,
            self.abort.as_deref(),
        )
    }

    /// Read the bootloader and chip information without touching flash
    pub fn identify(&mut self) -> Result<DeviceInfo> {
        let mut session = self.open_session()?;

        let r = session.prepare(EraseMode::Skip);
        let info = session.info().cloned();
        let closed = session.close();

        r?;
        closed?;
        Ok(info.unwrap_or_default())
    }

    /// Erase, write and verify `source`, returning the target to its
    /// application whatever the outcome.
    pub fn flash_and_verify<S: Read + Seek>(&mut self, source: &mut S) -> FlashReport {
        self.flash_and_verify_with_progress(source, &mut |_| ())
    }

    pub fn flash_and_verify_with_progress<S: Read + Seek>(
        &mut self,
        source: &mut S,
        progress: &mut dyn FnMut(Progress),
    ) -> FlashReport {
        let erase = self.options.erase;
        let verify = !self.options.no_verify;
        self.run(source, erase, true, verify, progress)
    }

    /// Compare flash with `source` without erasing or writing
    pub fn verify<S: Read + Seek>(
        &mut self,
        source: &mut S,
        progress: &mut dyn FnMut(Progress),
    ) -> FlashReport {
        self.run(source, EraseMode::Skip, false, true, progress)
    }

    fn run<S: Read + Seek>(
        &mut self,
        source: &mut S,
        erase: EraseMode,
        write: bool,
        verify: bool,
        progress: &mut dyn FnMut(Progress),
    ) -> FlashReport {
        let mut report = FlashReport::default();

        let mut session = match self.open_session() {
            Ok(s) => s,
            Err(error) => {
                report.failure = Some(Failure { phase: Phase::Connect, error });
                return report;
            }
        };

        let setup = session.prepare(erase);
        report.device = session.info().cloned();

        let mut failure = match setup {
            Ok(()) => None,
            Err(error) => Some(Failure { phase: Phase::Setup, error }),
        };

        if failure.is_none() && write {
            match session.write_image(source, progress) {
                Ok(r) => report.write = Some(r),
                Err(error) => failure = Some(Failure { phase: Phase::Write, error }),
            }
        }

        let written = report.write.as_ref().map(|r| r.is_success()).unwrap_or(true);
        if failure.is_none() && written && verify {
            match session.verify_image(source, progress) {
                Ok(r) => report.verify = Some(r),
                Err(error) => failure = Some(Failure { phase: Phase::Verify, error }),
            }
        }

        if let Err(error) = session.close() {
            match failure {
                None => failure = Some(Failure { phase: Phase::Close, error }),
                Some(_) => error!("Failed to close session: {}", error),
            }
        }

        report.failure = failure;

        match report.error() {
            None => info!("Flash operation complete"),
            Some((phase, e)) => error!("Flash operation failed during {:?}: {}", phase, e),
        }

        report
    }
}
