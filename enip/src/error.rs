//! Errors returned by the EtherNet/IP session.

use crate::Command;

/// Result alias used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong during an EtherNet/IP exchange.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The socket failed.
    #[error("enip transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The device did not answer in time.
    #[error("enip {operation} timed out after {after_ms}ms")]
    Timeout {
        /// What we were doing when the clock ran out.
        operation: &'static str,
        /// How long we waited.
        after_ms: u64,
    },

    /// The device answered a different command than the one sent.
    #[error("unexpected enip command 0x{received:04X} in reply to {sent}")]
    UnexpectedCommand {
        /// Command we sent.
        sent: Command,
        /// Raw command word we got back.
        received: u16,
    },

    /// The encapsulation header carried a non-zero status.
    #[error("enip encapsulation status 0x{0:08X}")]
    EncapsulationStatus(u32),

    /// Session registration came back without a handle.
    #[error("enip session registration returned handle 0")]
    NoSession,

    /// The CIP reply carried a non-zero general status.
    #[error("cip general status 0x{0:02X}")]
    CipStatus(u8),

    /// The reply could not be understood.
    #[error("malformed enip frame: {0}")]
    Frame(String),
}

impl Error {
    /// Whether reconnecting and trying again could help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout { .. })
    }
}
