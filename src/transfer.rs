//! Page-by-page transfer of a firmware image.

use std::io::{self, Read, Seek, SeekFrom};

use crate::error::{Error, Result};
use crate::protocol::{FlashAddress, PAD_BYTE, PAGE_SIZE};
use crate::session::{ControlLines, Session};
use crate::transport::Transport;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Phase {
    Connect,
    Setup,
    Write,
    Verify,
    Close,
}

/// Progress information passed to the progress callback after each page
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Progress {
    pub phase: Phase,
    /// Pages completed so far
    pub pages_complete: usize,
    pub pages_total: usize,
}

/// First failing page of a transfer
#[derive(Debug)]
pub struct PageFailure {
    /// Zero based page index
    pub page: usize,
    pub address: FlashAddress,
    pub error: Error,
}

/// Outcome of a write or verify pass
#[derive(Debug, Default)]
pub struct TransferReport {
    pub pages_attempted: usize,
    pub pages_succeeded: usize,
    pub failure: Option<PageFailure>,
}

impl TransferReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Fill `buf` from `source`, returning the number of bytes read (short only
/// at end of stream).
fn read_chunk<S: Read>(source: &mut S, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match source.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(r) => n += r,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

/// Rewind `source` and return its length in pages
fn rewind<S: Seek>(source: &mut S) -> io::Result<usize> {
    let len = source.seek(SeekFrom::End(0))?;
    source.seek(SeekFrom::Start(0))?;
    Ok(((len as usize) + PAGE_SIZE - 1) / PAGE_SIZE)
}

impl<'a, T: Transport, L: ControlLines> Session<'a, T, L> {
    /// Run `op` for one page, retrying up to the configured limit
    fn with_retries<R>(
        &mut self,
        page: usize,
        mut op: impl FnMut(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let mut attempt = 0;
        loop {
            match op(self) {
                Ok(r) => return Ok(r),
                Err(e) if attempt < self.options.retries && e.step().is_some() => {
                    attempt += 1;
                    warn!(
                        "Page {} failed ({}), retry {}/{}",
                        page, e, attempt, self.options.retries
                    );
                    self.discard_input()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Shared page loop of the write and verify passes
    fn transfer<S: Read + Seek>(
        &mut self,
        phase: Phase,
        source: &mut S,
        progress: &mut dyn FnMut(Progress),
        mut page_op: impl FnMut(&mut Self, usize, FlashAddress, &[u8]) -> Result<()>,
    ) -> Result<TransferReport> {
        let pages_total = rewind(source)?;

        let mut report = TransferReport::default();
        let mut address = FlashAddress::new(self.options.base_address);
        let mut block = [PAD_BYTE; PAGE_SIZE];

        loop {
            let page = report.pages_attempted;

            let r = match read_chunk(source, &mut block) {
                Ok(0) => break,
                Ok(n) => {
                    for b in block[n..].iter_mut() {
                        *b = PAD_BYTE;
                    }
                    report.pages_attempted += 1;

                    if self.aborted() {
                        Err(Error::Aborted)
                    } else {
                        page_op(self, page, address, &block[..])
                    }
                }
                Err(e) => {
                    report.pages_attempted += 1;
                    Err(e.into())
                }
            };

            if let Err(error) = r {
                error!("{:?} failed at page {} ({}): {}", phase, page, address, error);
                self.fault();
                report.failure = Some(PageFailure { page, address, error });
                break;
            }

            report.pages_succeeded += 1;
            progress(Progress {
                phase,
                pages_complete: report.pages_succeeded,
                pages_total,
            });

            address = address.next_page();
        }

        Ok(report)
    }

    /// Write `source` to flash starting at the base address.
    ///
    /// A short final chunk is padded to a full page. The pass stops at the
    /// first page that fails; `Err` is only returned when the pass could not
    /// start.
    pub fn write_image<S: Read + Seek>(
        &mut self,
        source: &mut S,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<TransferReport> {
        info!("Writing flash memory");

        self.transfer(Phase::Write, source, progress, |s, page, address, data| {
            s.with_retries(page, |s| s.write_page(address, data))
        })
    }

    /// Read back every page `write_image` would have written and compare
    /// it with `source`.
    pub fn verify_image<S: Read + Seek>(
        &mut self,
        source: &mut S,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<TransferReport> {
        info!("Verifying flash memory");

        self.transfer(Phase::Verify, source, progress, |s, page, address, expected| {
            let found = s.with_retries(page, |s| s.read_page(address))?;

            match expected.iter().zip(found.iter()).position(|(e, f)| e != f) {
                None => Ok(()),
                Some(i) => Err(Error::VerifyMismatch {
                    address: address.offset(i),
                    expected: expected[i],
                    found: found[i],
                }),
            }
        })
    }
}
