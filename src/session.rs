//! Device session: takes the target into its bootloader, sets it up for
//! programming and returns it to the application afterwards.
//!
//! ```text
//! Idle -> ModeAsserted -> Synced -> Erasing -> Ready -> Transferring -> Closing -> Idle
//!                 \-----------\---------\---------\---------\--> Faulted -> Closing
//! ```

use core::fmt;
use core::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;

use crate::command::{Bootloader, DeviceInfo};
use crate::error::{Error, Result};
use crate::protocol::{Command, FlashAddress};
use crate::transport::Transport;
use crate::Options;

/// Reset and mode-select (BOOT0) lines of the target.
pub trait ControlLines {
    /// Drive the (active low) reset line, `true` releases the target
    fn set_reset(&mut self, level: bool) -> Result<()>;

    /// Drive the BOOT0 line, `true` selects the system bootloader
    fn set_boot(&mut self, level: bool) -> Result<()>;

    fn delay_ms(&mut self, ms: u32);
}

/// [`ControlLines`] over a pair of embedded-hal output pins
pub struct GpioLines<RST, BOOT, D> {
    reset: RST,
    boot: BOOT,
    delay: D,
}

impl<RST, BOOT, D> GpioLines<RST, BOOT, D>
where
    RST: OutputPin,
    BOOT: OutputPin,
    RST::Error: fmt::Debug,
    BOOT::Error: fmt::Debug,
    D: DelayMs<u32>,
{
    pub fn new(reset: RST, boot: BOOT, delay: D) -> Self {
        Self { reset, boot, delay }
    }

    pub fn free(self) -> (RST, BOOT, D) {
        (self.reset, self.boot, self.delay)
    }
}

impl<RST, BOOT, D> ControlLines for GpioLines<RST, BOOT, D>
where
    RST: OutputPin,
    BOOT: OutputPin,
    RST::Error: fmt::Debug,
    BOOT::Error: fmt::Debug,
    D: DelayMs<u32>,
{
    fn set_reset(&mut self, level: bool) -> Result<()> {
        match level {
            true => self.reset.set_high(),
            false => self.reset.set_low(),
        }
        .map_err(Error::line)
    }

    fn set_boot(&mut self, level: bool) -> Result<()> {
        match level {
            true => self.boot.set_high(),
            false => self.boot.set_low(),
        }
        .map_err(Error::line)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    Idle,
    ModeAsserted,
    Synced,
    Erasing,
    Ready,
    Transferring,
    Closing,
    Faulted,
}

/// Which mass erase command(s) to issue while preparing the target
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EraseMode {
    /// Erase, then Extended Erase
    Both,
    Standard,
    Extended,
    /// Pick from the commands the bootloader reports
    Auto,
    /// Leave flash untouched
    Skip,
}

impl Default for EraseMode {
    fn default() -> Self {
        EraseMode::Both
    }
}

impl FromStr for EraseMode {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "both" => Ok(EraseMode::Both),
            "standard" => Ok(EraseMode::Standard),
            "extended" => Ok(EraseMode::Extended),
            "auto" => Ok(EraseMode::Auto),
            "skip" | "none" => Ok(EraseMode::Skip),
            _ => Err(format!("unknown erase mode '{}'", s)),
        }
    }
}

impl fmt::Display for EraseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EraseMode::Both => "both",
            EraseMode::Standard => "standard",
            EraseMode::Extended => "extended",
            EraseMode::Auto => "auto",
            EraseMode::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// One programming session against the target.
///
/// Holds the programmer's transport and control lines exclusively until it
/// is closed. Dropping an open session closes it.
pub struct Session<'a, T: Transport, L: ControlLines> {
    bootloader: &'a mut Bootloader<T>,
    lines: &'a mut L,
    pub(crate) options: &'a Options,
    pub(crate) abort: Option<&'a AtomicBool>,
    state: State,
    info: Option<DeviceInfo>,
}

impl<'a, T: Transport, L: ControlLines> Session<'a, T, L> {
    /// Put the target into bootloader mode and synchronise with it
    pub(crate) fn open(
        bootloader: &'a mut Bootloader<T>,
        lines: &'a mut L,
        options: &'a Options,
        abort: Option<&'a AtomicBool>,
    ) -> Result<Self> {
        let mut s = Self {
            bootloader,
            lines,
            options,
            abort,
            state: State::Idle,
            info: None,
        };

        s.enter()?;
        s.sync()?;

        Ok(s)
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Device information, once [`Session::prepare`] has run
    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub(crate) fn aborted(&self) -> bool {
        self.abort.map(|a| a.load(Ordering::SeqCst)).unwrap_or(false)
    }

    fn require(&self, allowed: &[State], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::SessionContractViolation {
                state: self.state,
                operation,
            })
        }
    }

    /// Run `f`, moving to `Faulted` if it fails
    fn guarded<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let r = f(self);
        if r.is_err() {
            self.state = State::Faulted;
        }
        r
    }

    fn pulse_reset(&mut self) -> Result<()> {
        let (hold, settle) = (self.options.reset_hold_ms, self.options.boot_delay_ms);

        debug!("Resetting device");
        self.lines.set_reset(false)?;
        self.lines.delay_ms(hold);
        self.lines.set_reset(true)?;
        self.lines.delay_ms(settle);

        Ok(())
    }

    fn enter(&mut self) -> Result<()> {
        self.require(&[State::Idle], "entering bootloader mode")?;

        info!("Starting connection");
        self.guarded(|s| {
            s.lines.set_boot(true)?;
            if !s.options.no_reset {
                s.pulse_reset()?;
            }

            // Anything received so far predates the bootloader
            let stale = s.bootloader.discard()?;
            if stale > 0 {
                debug!("Dropped {} bytes received before sync", stale);
            }
            Ok(())
        })?;

        self.state = State::ModeAsserted;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.require(&[State::ModeAsserted], "sync")?;

        self.guarded(|s| s.bootloader.sync())?;

        info!("Bootloader connected");
        self.state = State::Synced;
        Ok(())
    }

    /// Query the device and mass erase it as `erase` selects, leaving the
    /// session ready for transfers. The first failing step faults the session.
    pub fn prepare(&mut self, erase: EraseMode) -> Result<()> {
        self.require(&[State::Synced], "prepare")?;

        let info = self.guarded(|s| s.bootloader.device_info())?;
        debug!(
            "Bootloader v{}.{}, product id 0x{:04x}",
            info.version >> 4,
            info.version & 0x0F,
            info.product_id
        );

        let (standard, extended) = match erase {
            EraseMode::Both => (true, true),
            EraseMode::Standard => (true, false),
            EraseMode::Extended => (false, true),
            EraseMode::Auto => {
                let extended = info.supports(Command::ExtendedErase);
                (!extended && info.supports(Command::Erase), extended)
            }
            EraseMode::Skip => (false, false),
        };
        self.info = Some(info);

        if standard || extended {
            info!("Erasing flash ({})", erase);
            self.state = State::Erasing;
        }
        if standard {
            self.guarded(|s| s.bootloader.erase_all())?;
        }
        if extended {
            self.guarded(|s| s.bootloader.extended_erase_all())?;
        }

        self.state = State::Ready;
        Ok(())
    }

    /// Write one block at `address`. Leaves the session state alone on
    /// failure so the caller can decide whether to retry.
    pub fn write_page(&mut self, address: FlashAddress, data: &[u8]) -> Result<()> {
        self.require(&[State::Ready, State::Transferring], "write")?;
        self.state = State::Transferring;
        self.bootloader.write_memory(address, data)
    }

    /// Read one page at `address`
    pub fn read_page(&mut self, address: FlashAddress) -> Result<Vec<u8>> {
        self.require(&[State::Ready, State::Transferring], "read")?;
        self.state = State::Transferring;
        self.bootloader.read_memory(address)
    }

    /// Drop unread input left over from a failed exchange
    pub(crate) fn discard_input(&mut self) -> Result<usize> {
        self.bootloader.discard()
    }

    pub(crate) fn fault(&mut self) {
        self.state = State::Faulted;
    }

    fn teardown(&mut self) -> Result<()> {
        self.state = State::Closing;
        info!("Ending connection");

        let r = self
            .lines
            .set_reset(false)
            .and_then(|_| self.lines.set_boot(false))
            .and_then(|_| self.pulse_reset());

        // Lines are released whether or not they could be driven
        self.state = State::Idle;
        r
    }

    /// Return the target to its application and release the lines
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }
}

impl<'a, T: Transport, L: ControlLines> Drop for Session<'a, T, L> {
    fn drop(&mut self) {
        if self.state != State::Idle {
            warn!("Closing session left in state {:?}", self.state);
            if let Err(e) = self.teardown() {
                error!("Failed to release target: {}", e);
            }
        }
    }
}
