//! Physical layout constants and fragment header codec.

/// Size of one log block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// crc32 (4) + type (1) + total length (2).
pub const HEADER_SIZE: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

/// Builds the 7-byte header of a fragment.
pub(crate) fn encode_header(kind: RecordType, fragment: &[u8]) -> [u8; HEADER_SIZE] {
    let crc = crc32fast::hash(fragment);
    let total = (HEADER_SIZE + fragment.len()) as u16;
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&crc.to_le_bytes());
    header[4] = kind as u8;
    header[5..7].copy_from_slice(&total.to_le_bytes());
    header
}

/// Decoded fragment header: (crc, raw type byte, total bytes).
pub(crate) fn decode_header(header: &[u8]) -> (u32, u8, usize) {
    let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let total = u16::from_le_bytes([header[5], header[6]]) as usize;
    (crc, header[4], total)
}
