//! Log stream writer.

use crate::error::{Result, WalError};
use crate::format::{encode_header, RecordType, BLOCK_SIZE, HEADER_SIZE};
use std::io::Write;
use tern_core::WritableFile;

/// Appends logical records to a block-structured stream.
pub struct LogWriter<W: Write> {
    dest: W,
    /// Offset within the current block.
    block_offset: usize,
    bytes_written: u64,
}

impl<W: Write> LogWriter<W> {
    /// Starts a new stream at offset zero.
    pub fn new(dest: W) -> Self {
        Self::with_offset(dest, 0)
    }

    /// Continues a stream that already holds `existing_len` bytes.
    pub fn with_offset(dest: W, existing_len: u64) -> Self {
        Self {
            dest,
            block_offset: (existing_len % BLOCK_SIZE as u64) as usize,
            bytes_written: existing_len,
        }
    }

    /// Appends one logical record, fragmenting it across blocks as needed.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(WalError::EmptyRecord);
        }

        let mut left = payload;
        let mut first = true;
        loop {
            let remaining = BLOCK_SIZE - self.block_offset;

            if HEADER_SIZE + left.len() <= remaining {
                let kind = if first {
                    RecordType::Full
                } else {
                    RecordType::Last
                };
                self.emit(kind, left)?;
                return Ok(());
            }

            if remaining > HEADER_SIZE {
                let take = remaining - HEADER_SIZE;
                let kind = if first {
                    RecordType::First
                } else {
                    RecordType::Middle
                };
                self.emit(kind, &left[..take])?;
                left = &left[take..];
                first = false;
                continue;
            }

            // A fragment always fills its block exactly, so only the first
            // iteration can find a short tail.
            if !first {
                return Err(WalError::Internal(format!(
                    "block tail of {} bytes after a fragment",
                    remaining
                )));
            }
            const ZEROS: [u8; HEADER_SIZE] = [0; HEADER_SIZE];
            self.dest.write_all(&ZEROS[..remaining])?;
            self.bytes_written += remaining as u64;
            self.block_offset = 0;
        }
    }

    fn emit(&mut self, kind: RecordType, fragment: &[u8]) -> Result<()> {
        let header = encode_header(kind, fragment);
        self.dest.write_all(&header)?;
        self.dest.write_all(fragment)?;
        let written = HEADER_SIZE + fragment.len();
        self.block_offset += written;
        if self.block_offset == BLOCK_SIZE {
            self.block_offset = 0;
        }
        self.bytes_written += written as u64;
        Ok(())
    }

    /// Total stream length, padding included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.dest.flush()?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.dest
    }

    pub fn into_inner(self) -> W {
        self.dest
    }
}

impl<W: WritableFile + ?Sized> LogWriter<Box<W>> {
    /// Makes every appended record durable.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_record_is_full() {
        let mut writer = LogWriter::new(Vec::new());
        writer.append(b"abc").unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(bytes[4], RecordType::Full as u8);
        assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), 10);
        assert_eq!(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            crc32fast::hash(b"abc")
        );
    }

    #[test]
    fn test_large_record_fragments() {
        let payload = vec![7u8; BLOCK_SIZE * 2];
        let mut writer = LogWriter::new(Vec::new());
        writer.append(&payload).unwrap();
        let bytes = writer.into_inner();

        assert_eq!(bytes[4], RecordType::First as u8);
        assert_eq!(bytes[BLOCK_SIZE + 4], RecordType::Middle as u8);
        assert_eq!(bytes[2 * BLOCK_SIZE + 4], RecordType::Last as u8);
    }

    #[test]
    fn test_short_tail_is_zero_padded() {
        let mut writer = LogWriter::new(Vec::new());
        // Leaves exactly 5 bytes in the first block.
        writer
            .append(&vec![1u8; BLOCK_SIZE - HEADER_SIZE - 5])
            .unwrap();
        writer.append(b"next").unwrap();
        let bytes = writer.into_inner();

        assert_eq!(&bytes[BLOCK_SIZE - 5..BLOCK_SIZE], &[0u8; 5]);
        assert_eq!(bytes[BLOCK_SIZE + 4], RecordType::Full as u8);
        assert_eq!(bytes.len(), BLOCK_SIZE + HEADER_SIZE + 4);
    }

    #[test]
    fn test_empty_record_rejected() {
        let mut writer = LogWriter::new(Vec::new());
        assert!(matches!(writer.append(b""), Err(WalError::EmptyRecord)));
        assert_eq!(writer.bytes_written(), 0);
    }

    #[test]
    fn test_with_offset_resumes_block_position() {
        let mut writer = LogWriter::with_offset(Vec::new(), (BLOCK_SIZE - 3) as u64);
        writer.append(b"x").unwrap();
        let bytes = writer.into_inner();
        // Three bytes of padding, then a fresh block.
        assert_eq!(&bytes[..3], &[0, 0, 0]);
        assert_eq!(bytes.len(), 3 + HEADER_SIZE + 1);
    }
}
