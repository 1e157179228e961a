//! Table file format constants and the block tailer.
//!
//! # Block layout
//!
//! ```text
//! +--------------------------------------------------+
//! | entry 0: varint klen | varint vlen | key | value |
//! | entry 1 ...                                      |
//! | zero padding to an 8-byte boundary               |
//! | restart[0..numKeys]: u32 LE offset of each entry |
//! | tailer: blockSize u32 | numKeys u32 | restartOff |
//! +--------------------------------------------------+
//! ```
//!
//! All offsets are relative to the start of the block; `blockSize` counts the
//! tailer itself.
//!
//! # Table layout
//!
//! ```text
//! [leaf block 0][leaf block 1]...[leaf block N-1][index block]
//! ```
//!
//! Index entry `i` maps the last key of leaf `i` to the absolute end offset of
//! that leaf (u32 LE). The final block of the file is always the index, so a
//! reader decodes the tailer at the end of the file first.

use crate::error::{Result, SSTableError};
use tern_core::codec::decode_fixed32;

/// Size of the block tailer.
pub const TAILER_SIZE: usize = 12;

/// Restart array alignment.
pub const BLOCK_ALIGN: usize = 8;

/// Every n-th entry of a leaf is stored with its full key.
pub const ENTRIES_PER_FULL_KEY: usize = 16;

/// Maximum number of leaf entries covered by one index entry.
pub const LEAF_ENTRIES_PER_INDEX_ENTRY: usize = 128;

/// Bytes of a table's size hint reserved for block overhead.
pub const SIZE_HINT_SLACK: usize = 64;

/// Upper bound of the common-prefix byte in a differential key.
pub const MAX_COMMON_PREFIX: usize = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tailer {
    pub block_size: u32,
    pub num_keys: u32,
    pub restart_offset: u32,
}

impl Tailer {
    pub fn encode(&self) -> [u8; TAILER_SIZE] {
        let mut out = [0u8; TAILER_SIZE];
        out[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        out[4..8].copy_from_slice(&self.num_keys.to_le_bytes());
        out[8..12].copy_from_slice(&self.restart_offset.to_le_bytes());
        out
    }

    /// Decodes the tailer stored in the last bytes of `data`.
    pub fn decode_from_end(data: &[u8]) -> Result<Self> {
        if data.len() < TAILER_SIZE {
            return Err(SSTableError::Corruption(format!(
                "block of {} bytes is shorter than its tailer",
                data.len()
            )));
        }
        let at = data.len() - TAILER_SIZE;
        Ok(Self {
            block_size: decode_fixed32(data, at)?,
            num_keys: decode_fixed32(data, at + 4)?,
            restart_offset: decode_fixed32(data, at + 8)?,
        })
    }
}

/// Rounds `n` up to the restart array alignment.
pub fn align_up(n: usize) -> usize {
    (n + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tailer_roundtrip() {
        let tailer = Tailer {
            block_size: 96,
            num_keys: 3,
            restart_offset: 72,
        };
        let mut block = vec![0xAAu8; 84];
        block.extend_from_slice(&tailer.encode());
        assert_eq!(Tailer::decode_from_end(&block).unwrap(), tailer);
    }

    #[test]
    fn test_short_tailer_is_corruption() {
        assert!(matches!(
            Tailer::decode_from_end(&[0u8; 11]),
            Err(SSTableError::Corruption(_))
        ));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(13), 16);
    }
}
