//! CIP explicit messages carried inside `SendRRData`.

use crate::{Error, Result};

/// `Get_Attribute_Single` service code.
pub const SERVICE_GET_ATTRIBUTE_SINGLE: u8 = 0x0E;

/// Assembly object class.
pub const CLASS_ASSEMBLY: u8 = 0x04;

/// Assembly data attribute.
pub const ATTRIBUTE_DATA: u8 = 0x03;

/// Build a `Get_Attribute_Single` request for `class/instance/attribute`.
///
/// Instances that fit in a byte use the 8-bit logical segment (`0x24`),
/// larger ones the padded 16-bit form (`0x25 0x00 lo hi`).
pub fn get_attribute_single(class: u8, instance: u16, attribute: u8) -> Vec<u8> {
    let mut path = vec![0x20, class];
    match u8::try_from(instance) {
        Ok(instance) => path.extend_from_slice(&[0x24, instance]),
        Err(_) => {
            path.extend_from_slice(&[0x25, 0x00]);
            path.extend_from_slice(&instance.to_le_bytes());
        }
    }
    path.extend_from_slice(&[0x30, attribute]);

    let mut request = Vec::with_capacity(2 + path.len());
    request.push(SERVICE_GET_ATTRIBUTE_SINGLE);
    // Path size is counted in 16-bit words.
    request.push((path.len() / 2) as u8);
    request.extend_from_slice(&path);
    request
}

/// Attribute data from a CIP reply: checks the general status (byte 2) and
/// strips the 4-byte reply header.
pub fn reply_data(reply: &[u8]) -> Result<&[u8]> {
    if reply.len() < 4 {
        return Err(Error::Frame(format!("cip reply too short ({} bytes)", reply.len())));
    }
    match reply[2] {
        0 => Ok(&reply[4..]),
        status => Err(Error::CipStatus(status)),
    }
}
