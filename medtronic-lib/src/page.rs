//! Page framing: 1022 payload bytes followed by a big-endian CRC-16.

use crate::crc::crc16;
use crate::error::MdtError;

/// Size of one history or CGM page as transferred.
pub const PAGE_SIZE: usize = 1024;

/// Verify a downloaded page and return its payload without the trailing CRC.
///
/// The last two bytes are the big-endian CRC-16 of the first 1022.
pub fn page_payload(page: &[u8]) -> Result<&[u8], MdtError> {
    if page.len() != PAGE_SIZE {
        return Err(MdtError::PageSize { n: page.len() });
    }
    let (payload, stored) = page.split_at(PAGE_SIZE - 2);
    let expected = crc16(payload);
    let actual = u16::from_be_bytes([stored[0], stored[1]]);
    if expected != actual {
        return Err(MdtError::PageChecksum { expected, actual });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<u8> {
        let mut page: Vec<u8> = (0..PAGE_SIZE - 2).map(|i| (i * 7) as u8).collect();
        let crc = crc16(&page);
        page.extend_from_slice(&crc.to_be_bytes());
        page
    }

    #[test]
    fn accepts_valid_page() {
        let page = page();
        assert_eq!(page_payload(&page).unwrap().len(), 1022);
    }

    #[test]
    fn corrupted_crc() {
        let mut page = page();
        let crc = crc16(&page[..1022]);
        page[1022] ^= 0xFF;
        page[1023] ^= 0x01;
        assert_eq!(
            page_payload(&page),
            Err(MdtError::PageChecksum {
                expected: crc,
                actual: crc ^ 0xFF01
            })
        );
    }

    #[test]
    fn wrong_size() {
        assert_eq!(page_payload(&[0; 64]), Err(MdtError::PageSize { n: 64 }));
    }
}
