//! Link-layer framing: CRC-8 trailer plus 4b/6b line code.

use crate::crc::crc8;
use crate::encoding::{decode_4b6b, encode_4b6b};
use crate::error::MdtError;

/// Append the CRC-8 of `payload` and 4b/6b-encode the result.
///
/// The radio driver appends the zero terminator on transmit.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 1);
    framed.extend_from_slice(payload);
    framed.push(crc8(payload));
    encode_4b6b(&framed)
}

/// Decode a received frame and verify its CRC-8 trailer.
///
/// Trailing zero bytes left by the receiver are stripped before decoding.
/// Returns the payload without the CRC byte.
pub fn decode(bytes: &[u8]) -> Result<Vec<u8>, MdtError> {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let mut data = decode_4b6b(&bytes[..end])?;
    let Some(actual) = data.pop() else {
        return Err(MdtError::Empty);
    };
    let expected = crc8(&data);
    if actual != expected {
        return Err(MdtError::BadCrc { expected, actual });
    }
    Ok(data)
}
