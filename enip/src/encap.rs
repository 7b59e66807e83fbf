//! The 24-byte encapsulation header every EtherNet/IP frame starts with.
//!
//! All fields are little-endian:
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 2    | command        |
//! | 2      | 2    | payload length |
//! | 4      | 4    | session handle |
//! | 8      | 4    | status         |
//! | 12     | 8    | sender context |
//! | 20     | 4    | options        |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parse_display::Display;

use crate::{Error, Result};

/// Length of the encapsulation header.
pub const HEADER_LEN: usize = 24;

/// Encapsulation commands used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Command {
    /// Open a session (0x0065).
    RegisterSession,
    /// Close a session (0x0066).
    UnregisterSession,
    /// Unconnected request/reply (0x006F).
    SendRRData,
}

impl Command {
    /// The command word that goes on the wire.
    pub fn code(self) -> u16 {
        match self {
            Command::RegisterSession => 0x0065,
            Command::UnregisterSession => 0x0066,
            Command::SendRRData => 0x006F,
        }
    }
}

/// A decoded encapsulation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Raw command word.
    pub command: u16,
    /// Number of payload bytes following the header.
    pub length: u16,
    /// Session handle; 0 before registration.
    pub session_handle: u32,
    /// 0 on success.
    pub status: u32,
    /// Opaque, echoed by the device.
    pub sender_context: u64,
    /// Always 0.
    pub options: u32,
}

impl Header {
    /// A request header for `command` carrying `length` payload bytes.
    pub fn request(command: Command, session_handle: u32, length: u16) -> Self {
        Header {
            command: command.code(),
            length,
            session_handle,
            ..Default::default()
        }
    }

    /// Serialize the header followed by `payload`.
    pub fn encode_with(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u16_le(self.command);
        buf.put_u16_le(self.length);
        buf.put_u32_le(self.session_handle);
        buf.put_u32_le(self.status);
        buf.put_u64_le(self.sender_context);
        buf.put_u32_le(self.options);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Parse a header from the first [HEADER_LEN] bytes of `buf`.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Frame(format!("short encapsulation header ({} bytes)", buf.len())));
        }

        Ok(Header {
            command: buf.get_u16_le(),
            length: buf.get_u16_le(),
            session_handle: buf.get_u32_le(),
            status: buf.get_u32_le(),
            sender_context: buf.get_u64_le(),
            options: buf.get_u32_le(),
        })
    }

    /// Check this is a successful reply to `sent`.
    pub fn expect_reply_to(&self, sent: Command) -> Result<()> {
        if self.command != sent.code() {
            return Err(Error::UnexpectedCommand {
                sent,
                received: self.command,
            });
        }
        if self.status != 0 {
            return Err(Error::EncapsulationStatus(self.status));
        }
        Ok(())
    }
}

/// Payload of a `RegisterSession` request: protocol version 1, no options.
pub fn register_session_payload() -> [u8; 4] {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&1u16.to_le_bytes());
    payload
}
