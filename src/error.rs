//! Error types for the flashing engine.

use thiserror::Error;

use crate::protocol::Step;
use crate::session::State;

/// Result type for flashing operations.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No response within the allotted window
    #[error("no response to {step} within {timeout_ms} ms")]
    ResponseTimeout { step: Step, timeout_ms: u32 },

    /// The bootloader rejected a frame
    #[error("bootloader rejected {step}")]
    Nack { step: Step },

    /// The first response byte was neither ack nor nack
    #[error("unexpected response 0x{value:02x} to {step}")]
    InvalidResponse { step: Step, value: u8 },

    /// Data block payloads must be 1..=256 bytes
    #[error("invalid payload size {0} (expected 1..=256 bytes)")]
    InvalidPayloadSize(usize),

    /// Operation issued while the session was in the wrong state
    #[error("{operation} is not allowed in session state {state:?}")]
    SessionContractViolation {
        state: State,
        operation: &'static str,
    },

    /// Read back data does not match the image
    #[error("verification failed at 0x{address:08x}: expected 0x{expected:02x}, read 0x{found:02x}")]
    VerifyMismatch { address: u32, expected: u8, found: u8 },

    /// The abort signal was raised between pages
    #[error("transfer aborted")]
    Aborted,

    /// Underlying serial port failure
    #[error("serial error: {0}")]
    Serial(String),

    /// Reset or mode-select line failure
    #[error("control line error: {0}")]
    Line(String),

    /// Failure reading the image source
    #[error("image source error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Protocol step that failed, for command failures
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::ResponseTimeout { step, .. }
            | Error::Nack { step }
            | Error::InvalidResponse { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ResponseTimeout { .. })
    }

    pub(crate) fn serial<E: core::fmt::Debug>(e: E) -> Self {
        Error::Serial(format!("{:?}", e))
    }

    pub(crate) fn line<E: core::fmt::Debug>(e: E) -> Self {
        Error::Line(format!("{:?}", e))
    }
}
