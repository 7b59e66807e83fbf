//! Error taxonomy for the scan pipeline.
//!
//! Component-local faults (a missed frame, a dropped sensor session) are
//! absorbed and logged where they happen; the variants here are what
//! crosses component boundaries.

use std::time::Duration;

use crate::{targets::CoilTarget, Axis};

/// Result alias used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the scan pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No qualifying object was found in a frame.
    #[error("no object found in the {view} frame")]
    MeasurementNotFound {
        /// Which camera view came back empty.
        view: &'static str,
    },

    /// A conversion was asked for an axis with no usable coefficient.
    #[error("axis {axis} is not calibrated")]
    Uncalibrated {
        /// The axis missing a coefficient.
        axis: Axis,
    },

    /// Calibration inputs were degenerate.
    #[error("cannot calibrate: {0}")]
    Calibration(String),

    /// No active rule is complete enough to classify against.
    #[error("no active classification rule with a target and all three limits")]
    NoClassificationRule,

    /// A field-bus operation ran out of time.
    #[error("timed out during {operation} on {target}")]
    ProtocolTimeout {
        /// What we were doing.
        operation: &'static str,
        /// Which device and coil.
        target: CoilTarget,
    },

    /// A field-bus write failed after all retries.
    #[error("writing {value} to {target} failed: {source}")]
    ProtocolIo {
        /// Which device and coil.
        target: CoilTarget,
        /// The value we tried to write.
        value: bool,
        /// Underlying protocol error.
        #[source]
        source: modbus::Error,
    },

    /// The actuation window from a previous cycle is still open.
    #[error("actuation gate busy for another {remaining:?}")]
    GateBusy {
        /// Time left in the window.
        remaining: Duration,
    },

    /// The distance sensor session failed.
    #[error("distance sensor session fault: {0}")]
    SessionFault(#[from] enip::Error),

    /// Another scan is already running.
    #[error("a scan is already in progress")]
    ScanInProgress,

    /// Scanning is stopped or paused.
    #[error("scanning is not running")]
    NotRunning,

    /// A frame had a channel count other than 1, 3 or 4.
    #[error("unsupported channel count {0}")]
    UnsupportedChannels(usize),

    /// OpenCV rejected an image operation.
    #[error("image processing failed: {0}")]
    Vision(#[from] opencv::Error),

    /// A frame's buffer does not match its declared geometry.
    #[error("frame buffer holds {actual} bytes, {expected} expected")]
    FrameSize {
        /// Bytes implied by width, height and channels.
        expected: usize,
        /// Bytes present.
        actual: usize,
    },

    /// Coil addresses are 1-based.
    #[error("coil address {0} is invalid; addresses start at 1")]
    InvalidCoilAddress(u16),

    /// An actuation target referenced by id is not configured.
    #[error("actuation target {0} is not configured")]
    UnknownTarget(u32),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An actuation target has no coil address.
    #[error("actuation target {0} has no coil address")]
    NoCoil(u32),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ProtocolTimeout { .. } => true,
            Error::ProtocolIo { source, .. } => source.is_transient(),
            Error::SessionFault(e) => e.is_transient(),
            _ => false,
        }
    }
}
