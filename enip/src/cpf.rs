//! Common Packet Format: the item list inside a `SendRRData` payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Null address item type.
pub const ITEM_NULL_ADDRESS: u16 = 0x0000;

/// Unconnected data item type.
pub const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

/// Wrap a CIP request as an unconnected `SendRRData` payload: interface
/// handle 0, timeout 0, a null address item and one unconnected data item.
pub fn encode_unconnected(cip: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + cip.len());
    buf.put_u32_le(0);
    buf.put_u16_le(0);
    buf.put_u16_le(2);
    buf.put_u16_le(ITEM_NULL_ADDRESS);
    buf.put_u16_le(0);
    buf.put_u16_le(ITEM_UNCONNECTED_DATA);
    buf.put_u16_le(cip.len() as u16);
    buf.put_slice(cip);
    buf.freeze()
}

/// Find the unconnected data item in a `SendRRData` reply payload (the
/// bytes after the encapsulation header).
pub fn unconnected_data(payload: &[u8]) -> Result<&[u8]> {
    let mut buf = payload;
    if buf.remaining() < 8 {
        return Err(Error::Frame(format!("cpf payload too short ({} bytes)", buf.len())));
    }
    let _interface_handle = buf.get_u32_le();
    let _timeout = buf.get_u16_le();
    let item_count = buf.get_u16_le();

    for _ in 0..item_count {
        if buf.remaining() < 4 {
            return Err(Error::Frame("truncated cpf item header".to_string()));
        }
        let item_type = buf.get_u16_le();
        let item_len = usize::from(buf.get_u16_le());
        if buf.remaining() < item_len {
            return Err(Error::Frame(format!(
                "cpf item 0x{:04X} announced {} bytes, {} left",
                item_type,
                item_len,
                buf.remaining()
            )));
        }

        let (item, rest) = buf.split_at(item_len);
        if item_type == ITEM_UNCONNECTED_DATA {
            return Ok(item);
        }
        buf = rest;
    }

    Err(Error::Frame("no unconnected data item in reply".to_string()))
}
