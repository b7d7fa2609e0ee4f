#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stm32_isp_flasher::linux::LinuxProgrammer;
use stm32_isp_flasher::{FlashReport, Options, Phase, Progress, PAGE_SIZE};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// sysfs GPIO number driving the target's reset line
    #[structopt(long)]
    reset_gpio: u64,

    /// sysfs GPIO number driving the target's BOOT0 line
    #[structopt(long)]
    boot_gpio: u64,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Erase the target, write an image and verify it
    Flash {
        /// Raw binary image
        file: PathBuf,
    },
    /// Compare target flash with an image
    Verify {
        /// Raw binary image
        file: PathBuf,
    },
    /// Print bootloader and chip information
    Info,
}

fn progress_bar(pages: u64) -> ProgressBar {
    let pb = ProgressBar::new(pages);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}")
            .progress_chars("#>-"),
    );
    pb
}

fn open_image(file: &PathBuf) -> anyhow::Result<(File, u64)> {
    let f = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let len = f.metadata()?.len();

    info!("Image {} ({})", file.display(), bytefmt::format(len));
    Ok((f, len))
}

fn summarise(report: &FlashReport) -> anyhow::Result<()> {
    if let Some(w) = &report.write {
        info!("Wrote {}/{} pages", w.pages_succeeded, w.pages_attempted);
    }
    if let Some(v) = &report.verify {
        info!("Verified {}/{} pages", v.pages_succeeded, v.pages_attempted);
    }

    match report.error() {
        None => Ok(()),
        Some((phase, e)) => bail!("{:?} failed: {}", phase, e),
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    let abort = Arc::new(AtomicBool::new(false));
    {
        let abort = abort.clone();
        ctrlc::set_handler(move || abort.store(true, Ordering::SeqCst))
            .context("installing ctrl-c handler")?;
    }

    info!("Connecting to serial port");

    let mut p = LinuxProgrammer::linux(&o.port, o.baud, o.reset_gpio, o.boot_gpio, o.options)?
        .with_abort(abort);

    match &o.operation {
        Operation::Info => {
            let info = p.identify()?;

            info!(
                "Bootloader version: {}.{}",
                info.version >> 4,
                info.version & 0x0F
            );
            info!("Product ID: 0x{:04x}", info.product_id);
            info!("Option bytes: {}", hex::encode(info.option_bytes));
            info!("Commands: {}", hex::encode(&info.commands));
        }
        Operation::Flash { file } | Operation::Verify { file } => {
            let (mut f, len) = open_image(file)?;
            let pages = (len + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;

            let pb = progress_bar(pages);
            let mut progress = |s: Progress| {
                if s.pages_complete == 1 {
                    pb.reset();
                    pb.set_message(match s.phase {
                        Phase::Verify => "verifying",
                        _ => "writing",
                    });
                }
                pb.set_position(s.pages_complete as u64);
            };

            let report = match o.operation {
                Operation::Flash { .. } => p.flash_and_verify_with_progress(&mut f, &mut progress),
                _ => p.verify(&mut f, &mut progress),
            };
            pb.finish_and_clear();

            if let Some(d) = &report.device {
                debug!("Device: {:02x?}", d);
            }
            summarise(&report)?;
        }
    }

    Ok(())
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
