//! 4b/6b line code.
//!
//! Every nibble maps to a DC-balanced 6-bit symbol, so `n` bytes become
//! `ceil(3n / 2)` bytes on the air. When the symbol stream does not end on a
//! byte boundary the final four bits are padded with the nibble `0x5`.

use crate::error::MdtError;

const ENCODE: [u8; 16] = [
    0x15, 0x31, 0x32, 0x23, 0x34, 0x25, 0x26, 0x16, 0x1A, 0x19, 0x2A, 0x0B, 0x2C, 0x0D, 0x0E, 0x1C,
];

const INVALID: u8 = 0xFF;

const DECODE: [u8; 64] = decode_table();

const fn decode_table() -> [u8; 64] {
    let mut table = [INVALID; 64];
    let mut nibble = 0;
    while nibble < 16 {
        table[ENCODE[nibble] as usize] = nibble as u8;
        nibble += 1;
    }
    table
}

/// Number of encoded bytes produced for `n` input bytes.
pub fn encoded_len(n: usize) -> usize {
    (3 * n).div_ceil(2)
}

/// Encode `data` with the 4b/6b line code.
pub fn encode_4b6b(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(data.len()));
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &b in data {
        acc = (acc << 12) | (u32::from(ENCODE[(b >> 4) as usize]) << 6) | u32::from(ENCODE[(b & 0xF) as usize]);
        bits += 12;
        while bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
        acc &= (1 << bits) - 1;
    }
    if bits > 0 {
        // Only four bits can be left over; pad with the 0x5 nibble.
        out.push(((acc << 4) as u8) | 0x5);
    }
    out
}

/// Decode a 4b/6b byte stream.
///
/// Trailing bits that do not complete a whole decoded byte are padding and are
/// ignored. An unrecognized symbol fails with the index of the encoded octet
/// where the symbol starts.
pub fn decode_4b6b(data: &[u8]) -> Result<Vec<u8>, MdtError> {
    let mut out = Vec::with_capacity(data.len() * 2 / 3);
    let mut acc: u32 = 0;
    let mut bits = 0;
    let mut consumed = 0usize;
    for &b in data {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        if bits < 12 {
            continue;
        }
        bits -= 12;
        let pair = (acc >> bits) & 0xFFF;
        acc &= (1 << bits) - 1;
        let hi = DECODE[(pair >> 6) as usize];
        if hi == INVALID {
            return Err(MdtError::InvalidSymbol { index: consumed / 8 });
        }
        let lo = DECODE[(pair & 0x3F) as usize];
        if lo == INVALID {
            return Err(MdtError::InvalidSymbol {
                index: (consumed + 6) / 8,
            });
        }
        out.push((hi << 4) | lo);
        consumed += 12;
    }
    Ok(out)
}
