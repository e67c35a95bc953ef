// Physical record framing for the block-structured log
//
// A log file is a sequence of 32KB blocks. Each block holds one or more
// physical records:
// [crc32: u32 LE] [length: u16 LE] [type: u8] [payload bytes]
//
// The CRC covers the type byte and the payload. A logical record that does
// not fit in the space left in a block is split into FIRST, MIDDLE... LAST
// fragments. A block tail shorter than a header is zero-filled.

use crc32fast::Hasher;
use strata_core::{Error, Result};

/// Size of a log block
pub const BLOCK_SIZE: usize = 32 * 1024;

/// crc (4) + length (2) + type (1)
pub const HEADER_SIZE: usize = 7;

/// Physical record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Reserved for preallocated, zero-filled space
    Zero = 0,
    /// A complete logical record
    Full = 1,
    /// First fragment of a logical record
    First = 2,
    /// Interior fragment
    Middle = 3,
    /// Final fragment
    Last = 4,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RecordType::Zero),
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            _ => Err(Error::Corruption(format!(
                "unknown log record type: {}",
                value
            ))),
        }
    }
}

/// Checksum of a physical record: CRC32 over the type byte and payload.
pub fn record_crc(record_type: u8, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(payload);
    hasher.finalize()
}

/// Encode the header of a physical record.
pub fn encode_header(record_type: RecordType, payload: &[u8]) -> [u8; HEADER_SIZE] {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut header = [0u8; HEADER_SIZE];
    let crc = record_crc(record_type as u8, payload);
    header[0..4].copy_from_slice(&crc.to_le_bytes());
    header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    header[6] = record_type as u8;
    header
}

/// Decoded physical record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Stored checksum
    pub crc: u32,
    /// Payload length
    pub length: usize,
    /// Raw type byte; may be an unknown type
    pub record_type: u8,
}

impl RecordHeader {
    /// Parse a header from the first `HEADER_SIZE` bytes of `data`.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            crc: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            length: u16::from_le_bytes([data[4], data[5]]) as usize,
            record_type: data[6],
        })
    }

    /// Verify the stored checksum against `payload`.
    pub fn matches(&self, payload: &[u8]) -> bool {
        record_crc(self.record_type, payload) == self.crc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_conversion() {
        assert_eq!(RecordType::try_from(1).unwrap(), RecordType::Full);
        assert_eq!(RecordType::try_from(4).unwrap(), RecordType::Last);
        assert!(RecordType::try_from(99).unwrap_err().is_corruption());
    }

    #[test]
    fn test_header_encode_decode() {
        let payload = b"hello";
        let header = encode_header(RecordType::First, payload);

        let decoded = RecordHeader::decode(&header).unwrap();
        assert_eq!(decoded.length, 5);
        assert_eq!(decoded.record_type, RecordType::First as u8);
        assert!(decoded.matches(payload));
    }

    #[test]
    fn test_crc_covers_type() {
        let payload = b"payload";
        let header = encode_header(RecordType::Full, payload);
        let mut decoded = RecordHeader::decode(&header).unwrap();

        decoded.record_type = RecordType::Last as u8;
        assert!(!decoded.matches(payload));
    }

    #[test]
    fn test_short_header() {
        assert!(RecordHeader::decode(&[0u8; 6]).is_none());
    }
}
