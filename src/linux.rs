use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{Delay, Serial, SysfsPin};
use serial_core::{
    BaudRate, CharSize, FlowControl, Parity, SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::{GpioLines, Options, Programmer, SerialTransport};

/// Programmer on a linux host: a tty for the bootloader UART and two sysfs
/// GPIOs wired to the target's NRST and BOOT0.
pub type LinuxProgrammer =
    Programmer<SerialTransport<Serial, Delay>, GpioLines<SysfsPin, SysfsPin, Delay>>;

/// Export a sysfs GPIO as an output at `level`
fn output_pin(number: u64, level: bool) -> anyhow::Result<SysfsPin> {
    let pin = SysfsPin::new(number);

    pin.0
        .export()
        .with_context(|| format!("exporting gpio {}", number))?;

    let direction = match level {
        true => Direction::High,
        false => Direction::Low,
    };
    pin.0
        .set_direction(direction)
        .with_context(|| format!("configuring gpio {} as output", number))?;

    Ok(pin)
}

impl LinuxProgrammer {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        reset_gpio: u64,
        boot_gpio: u64,
        options: Options,
    ) -> anyhow::Result<Self> {
        // Open port
        let mut port = Serial::open(port.as_ref())
            .with_context(|| format!("opening {}", port.as_ref().display()))?;

        // Apply settings, the bootloader expects 8E1
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)?;

        // Short reads, polling is handled by the transport
        port.0.set_timeout(Duration::from_millis(1))?;

        // Target left running its application until a session starts
        let reset = output_pin(reset_gpio, true)?;
        let boot = output_pin(boot_gpio, false)?;

        let transport = SerialTransport::new(port, Delay {}, options.poll_delay_ms);
        let lines = GpioLines::new(reset, boot, Delay {});

        // Return instance
        Ok(Self::new(transport, lines, options))
    }
}
