//! Modbus/TCP application frames: the MBAP header plus the handful of
//! PDUs needed to drive coils.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parse_display::Display;

use crate::{Error, Result};

/// Length of the MBAP header, including the unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest PDU a conforming device will send.
pub const MAX_PDU_LEN: usize = 253;

/// Most coils a single read may ask for.
pub const MAX_READ_COILS: u16 = 2000;

const PROTOCOL_ID: u16 = 0;
const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Function codes this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "snake_case")]
pub enum FunctionCode {
    /// Read coils (0x01).
    ReadCoils,
    /// Write single coil (0x05).
    WriteSingleCoil,
}

impl FunctionCode {
    /// The byte that goes on the wire.
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::WriteSingleCoil => 0x05,
        }
    }
}

/// Exception codes a device may answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "snake_case")]
pub enum ExceptionCode {
    /// 0x01
    IllegalFunction,
    /// 0x02
    IllegalDataAddress,
    /// 0x03
    IllegalDataValue,
    /// 0x04
    ServerDeviceFailure,
    /// 0x05
    Acknowledge,
    /// 0x06
    ServerDeviceBusy,
    /// 0x0A
    GatewayPathUnavailable,
    /// 0x0B
    GatewayTargetFailedToRespond,
    /// Anything else.
    #[display("other(0x{0:02X})")]
    Other(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailedToRespond,
            other => ExceptionCode::Other(other),
        }
    }
}

/// The MBAP header that prefixes every Modbus/TCP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Echoed back by the device.
    pub transaction_id: u16,
    /// Always 0 for Modbus.
    pub protocol_id: u16,
    /// Number of bytes that follow, unit id included.
    pub length: u16,
    /// Addressed unit behind a gateway; usually 1.
    pub unit_id: u8,
}

impl Header {
    /// Parse a header from exactly [MBAP_HEADER_LEN] bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < MBAP_HEADER_LEN {
            return Err(Error::Frame(format!("short MBAP header ({} bytes)", buf.len())));
        }

        let header = Header {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
        };

        if header.protocol_id != PROTOCOL_ID {
            return Err(Error::Frame(format!("unexpected protocol id {}", header.protocol_id)));
        }
        if header.length < 2 || usize::from(header.length) > MAX_PDU_LEN + 1 {
            return Err(Error::Frame(format!("bad MBAP length {}", header.length)));
        }

        Ok(header)
    }

    /// Bytes of PDU that follow this header.
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }
}

/// A request PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Read `quantity` coils starting at `address`.
    ReadCoils {
        /// 0-based wire address.
        address: u16,
        /// Number of coils.
        quantity: u16,
    },
    /// Force one coil on or off.
    WriteSingleCoil {
        /// 0-based wire address.
        address: u16,
        /// Desired state.
        value: bool,
    },
}

impl Request {
    /// The function code of this request.
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
        }
    }

    /// Encode a full ADU (MBAP header plus PDU).
    pub fn encode(&self, transaction_id: u16, unit_id: u8) -> Bytes {
        let mut pdu = BytesMut::with_capacity(5);
        pdu.put_u8(self.function().code());
        match *self {
            Request::ReadCoils { address, quantity } => {
                pdu.put_u16(address);
                pdu.put_u16(quantity);
            }
            Request::WriteSingleCoil { address, value } => {
                pdu.put_u16(address);
                pdu.put_u16(if value { COIL_ON } else { COIL_OFF });
            }
        }

        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
        frame.put_u16(transaction_id);
        frame.put_u16(PROTOCOL_ID);
        // Length counts the unit id plus the PDU.
        frame.put_u16((pdu.len() + 1) as u16);
        frame.put_u8(unit_id);
        frame.put_slice(&pdu);
        frame.freeze()
    }
}

/// A decoded response PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Packed coil status bytes, least significant bit first.
    ReadCoils(Vec<u8>),
    /// Echo of a single coil write.
    WriteSingleCoil {
        /// 0-based wire address.
        address: u16,
        /// State that was written.
        value: bool,
    },
}

impl Response {
    /// Decode a response PDU (function code onward).
    pub fn decode(mut pdu: &[u8]) -> Result<Self> {
        if pdu.is_empty() {
            return Err(Error::Frame("empty PDU".to_string()));
        }

        let function = pdu.get_u8();
        if function & 0x80 != 0 {
            let code = pdu.first().copied().unwrap_or_default();
            return Err(Error::Exception {
                function: function & 0x7F,
                code: code.into(),
            });
        }

        match function {
            0x01 => {
                let Some((&byte_count, status)) = pdu.split_first() else {
                    return Err(Error::Frame("read coils response without byte count".to_string()));
                };
                let byte_count = usize::from(byte_count);
                if status.len() < byte_count {
                    return Err(Error::Frame(format!(
                        "read coils response announced {} bytes, carried {}",
                        byte_count,
                        status.len()
                    )));
                }
                Ok(Response::ReadCoils(status[..byte_count].to_vec()))
            }
            0x05 => {
                if pdu.len() < 4 {
                    return Err(Error::Frame("short write single coil response".to_string()));
                }
                let address = pdu.get_u16();
                let value = match pdu.get_u16() {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => return Err(Error::Frame(format!("invalid coil value 0x{:04X}", other))),
                };
                Ok(Response::WriteSingleCoil { address, value })
            }
            other => Err(Error::Frame(format!("unexpected function code 0x{:02X}", other))),
        }
    }
}

/// Unpack `quantity` coil states from their packed status bytes.
pub fn unpack_coils(status: &[u8], quantity: u16) -> Vec<bool> {
    (0..usize::from(quantity))
        .map(|i| status.get(i / 8).is_some_and(|byte| byte & (1 << (i % 8)) != 0))
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_encode_write_single_coil_on() {
        let frame = Request::WriteSingleCoil { address: 2, value: true }.encode(1, 1);
        assert_eq!(frame.as_ref(), &[0, 1, 0, 0, 0, 6, 1, 0x05, 0, 2, 0xFF, 0x00]);
    }

    #[test]
    fn test_encode_write_single_coil_off() {
        let frame = Request::WriteSingleCoil { address: 29, value: false }.encode(0x0102, 7);
        assert_eq!(frame.as_ref(), &[1, 2, 0, 0, 0, 6, 7, 0x05, 0, 29, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_read_coils() {
        let frame = Request::ReadCoils {
            address: 16,
            quantity: 1,
        }
        .encode(9, 1);
        assert_eq!(frame.as_ref(), &[0, 9, 0, 0, 0, 6, 1, 0x01, 0, 16, 0, 1]);
    }

    #[test]
    fn test_decode_header() {
        let header = Header::decode(&[0, 9, 0, 0, 0, 4, 1]).unwrap();
        assert_eq!(
            header,
            Header {
                transaction_id: 9,
                protocol_id: 0,
                length: 4,
                unit_id: 1,
            }
        );
        assert_eq!(header.pdu_len(), 3);
    }

    #[test]
    fn test_decode_header_rejects_foreign_protocol() {
        assert!(Header::decode(&[0, 9, 0, 1, 0, 4, 1]).is_err());
        assert!(Header::decode(&[0, 9, 0, 0]).is_err());
    }

    #[test]
    fn test_decode_read_coils() {
        let response = Response::decode(&[0x01, 1, 0b0000_0101]).unwrap();
        assert_eq!(response, Response::ReadCoils(vec![0b0000_0101]));
    }

    #[test]
    fn test_decode_write_echo() {
        let response = Response::decode(&[0x05, 0, 2, 0xFF, 0x00]).unwrap();
        assert_eq!(response, Response::WriteSingleCoil { address: 2, value: true });
    }

    #[test]
    fn test_decode_exception() {
        let err = Response::decode(&[0x85, 0x02]).unwrap_err();
        match err {
            Error::Exception { function, code } => {
                assert_eq!(function, 0x05);
                assert_eq!(code, ExceptionCode::IllegalDataAddress);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_decode_short_read_coils() {
        assert!(Response::decode(&[0x01, 2, 0xFF]).is_err());
    }

    #[test]
    fn test_unpack_coils() {
        assert_eq!(unpack_coils(&[0b0000_0101], 3), vec![true, false, true]);
        assert_eq!(unpack_coils(&[0x00, 0x01], 9), vec![false; 8].into_iter().chain([true]).collect::<Vec<_>>());
        assert_eq!(unpack_coils(&[], 2), vec![false, false]);
    }

    #[test]
    fn test_exception_code_display() {
        assert_eq!(ExceptionCode::IllegalDataAddress.to_string(), "illegal_data_address");
        assert_eq!(ExceptionCode::Other(0x42).to_string(), "other(0x42)");
    }
}
