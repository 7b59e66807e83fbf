//! Errors returned by the Modbus client.

use crate::frame::ExceptionCode;

/// Result alias used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong talking to a Modbus/TCP device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The socket failed.
    #[error("modbus transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The device did not answer in time.
    #[error("modbus {operation} timed out after {after_ms}ms")]
    Timeout {
        /// What we were doing when the clock ran out.
        operation: &'static str,
        /// How long we waited.
        after_ms: u64,
    },

    /// The device answered with an exception response.
    #[error("modbus exception {code} for function 0x{function:02X}")]
    Exception {
        /// Function code of the rejected request.
        function: u8,
        /// Exception code reported by the device.
        code: ExceptionCode,
    },

    /// The request cannot be expressed as a valid frame.
    #[error("invalid modbus request: {0}")]
    InvalidRequest(String),

    /// The response frame could not be understood.
    #[error("malformed modbus frame: {0}")]
    Frame(String),

    /// The response belongs to another request.
    #[error("modbus transaction mismatch: sent {sent}, received {received}")]
    TransactionMismatch {
        /// Transaction id we sent.
        sent: u16,
        /// Transaction id we got back.
        received: u16,
    },
}

impl Error {
    /// Whether retrying the same request on a fresh connection could help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout { .. })
    }
}
