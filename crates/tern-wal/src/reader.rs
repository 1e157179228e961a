//! Log stream reader.

use crate::error::Result;
use crate::format::{decode_header, RecordType, BLOCK_SIZE, HEADER_SIZE};
use std::io::{ErrorKind, Read};

/// Outcome of reading one logical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    /// Clean end of stream at a fragment boundary.
    Eof,
    /// Structural damage; the stream is not read past this point.
    Corruption,
}

enum Fragment {
    Record(RecordType),
    Eof,
    Corrupt(&'static str),
}

/// Reads logical records back from a block-structured stream.
pub struct LogReader<R: Read> {
    src: R,
    block: Vec<u8>,
    /// Read position within `block`.
    pos: usize,
    /// True once `src` returned a short block.
    src_exhausted: bool,
    corrupted: bool,
    /// Stream offset where the last returned record started.
    last_record_offset: u64,
    block_start: u64,
}

impl<R: Read> LogReader<R> {
    pub fn new(src: R) -> Self {
        Self {
            src,
            block: Vec::with_capacity(BLOCK_SIZE),
            pos: 0,
            src_exhausted: false,
            corrupted: false,
            last_record_offset: 0,
            block_start: 0,
        }
    }

    /// Reads the next logical record into `scratch`.
    pub fn read_record(&mut self, scratch: &mut Vec<u8>) -> Result<ReadStatus> {
        scratch.clear();
        if self.corrupted {
            return Ok(ReadStatus::Corruption);
        }

        let mut in_fragment = false;
        loop {
            let fragment_offset = self.block_start + self.pos as u64;
            match self.read_fragment(scratch)? {
                Fragment::Eof if in_fragment => {
                    return Ok(self.corrupt("stream ends inside a fragmented record"));
                }
                Fragment::Eof => return Ok(ReadStatus::Eof),
                Fragment::Corrupt(reason) => return Ok(self.corrupt(reason)),
                Fragment::Record(RecordType::Full) => {
                    if in_fragment {
                        return Ok(self.corrupt("FULL record inside a fragmented record"));
                    }
                    self.last_record_offset = fragment_offset;
                    return Ok(ReadStatus::Ok);
                }
                Fragment::Record(RecordType::First) => {
                    if in_fragment {
                        return Ok(self.corrupt("FIRST record inside a fragmented record"));
                    }
                    self.last_record_offset = fragment_offset;
                    in_fragment = true;
                }
                Fragment::Record(RecordType::Middle) => {
                    if !in_fragment {
                        return Ok(self.corrupt("MIDDLE record without FIRST"));
                    }
                }
                Fragment::Record(RecordType::Last) => {
                    if !in_fragment {
                        return Ok(self.corrupt("LAST record without FIRST"));
                    }
                    return Ok(ReadStatus::Ok);
                }
            }
        }
    }

    /// Stream offset of the record most recently returned with `Ok`.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    fn corrupt(&mut self, reason: &'static str) -> ReadStatus {
        tracing::warn!(
            offset = self.block_start + self.pos as u64,
            reason,
            "log stream corruption"
        );
        self.corrupted = true;
        ReadStatus::Corruption
    }

    /// Appends the next physical fragment's payload to `scratch`.
    fn read_fragment(&mut self, scratch: &mut Vec<u8>) -> Result<Fragment> {
        loop {
            if BLOCK_SIZE - self.pos <= HEADER_SIZE || self.pos >= self.block.len() {
                // Padding tail or nothing buffered: move to the next block.
                if !self.load_next_block()? {
                    return Ok(Fragment::Eof);
                }
                continue;
            }

            let available = self.block.len() - self.pos;
            if available < HEADER_SIZE {
                return Ok(Fragment::Corrupt("short fragment header"));
            }

            let (crc, kind, total) = decode_header(&self.block[self.pos..self.pos + HEADER_SIZE]);
            if total <= HEADER_SIZE || total > BLOCK_SIZE - self.pos {
                return Ok(Fragment::Corrupt("fragment length out of range"));
            }
            if total > available {
                return Ok(Fragment::Corrupt("truncated fragment"));
            }

            let payload = &self.block[self.pos + HEADER_SIZE..self.pos + total];
            if crc32fast::hash(payload) != crc {
                return Ok(Fragment::Corrupt("checksum mismatch"));
            }
            let Some(kind) = RecordType::from_u8(kind) else {
                return Ok(Fragment::Corrupt("unknown fragment type"));
            };

            scratch.extend_from_slice(payload);
            self.pos += total;
            return Ok(Fragment::Record(kind));
        }
    }

    /// Loads the next block; returns false at end of stream.
    fn load_next_block(&mut self) -> Result<bool> {
        if self.src_exhausted {
            self.pos = self.block.len();
            return Ok(false);
        }

        self.block_start += self.block.len() as u64;
        self.block.clear();
        self.block.resize(BLOCK_SIZE, 0);
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.src.read(&mut self.block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.block.truncate(filled);
        self.pos = 0;
        if filled < BLOCK_SIZE {
            self.src_exhausted = true;
        }
        Ok(filled > 0)
    }

    /// Reads every record up to the first EOF or corruption.
    ///
    /// Corruption truncates the stream: the records before it are returned
    /// and `truncated` is set.
    pub fn recover(mut self) -> Result<Recovered> {
        let mut records = Vec::new();
        let mut scratch = Vec::new();
        loop {
            match self.read_record(&mut scratch)? {
                ReadStatus::Ok => records.push(std::mem::take(&mut scratch)),
                ReadStatus::Eof => {
                    return Ok(Recovered {
                        records,
                        truncated: false,
                    })
                }
                ReadStatus::Corruption => {
                    return Ok(Recovered {
                        records,
                        truncated: true,
                    })
                }
            }
        }
    }
}

/// Result of [`LogReader::recover`].
#[derive(Debug, Default)]
pub struct Recovered {
    pub records: Vec<Vec<u8>>,
    pub truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::LogWriter;

    fn write_all(records: &[&[u8]]) -> Vec<u8> {
        let mut writer = LogWriter::new(Vec::new());
        for r in records {
            writer.append(r).unwrap();
        }
        writer.into_inner()
    }

    fn read_statuses(bytes: &[u8]) -> Vec<(ReadStatus, Vec<u8>)> {
        let mut reader = LogReader::new(bytes);
        let mut out = Vec::new();
        loop {
            let mut scratch = Vec::new();
            let status = reader.read_record(&mut scratch).unwrap();
            out.push((status, scratch));
            if status != ReadStatus::Ok {
                return out;
            }
        }
    }

    #[test]
    fn test_empty_stream_is_eof() {
        let statuses = read_statuses(&[]);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, ReadStatus::Eof);
    }

    #[test]
    fn test_records_across_block_boundary() {
        let big = vec![b'x'; 2 * BLOCK_SIZE + 2];
        let bytes = write_all(&[b"hello world", &big, b"go programming is fun"]);

        let statuses = read_statuses(&bytes);
        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses[0], (ReadStatus::Ok, b"hello world".to_vec()));
        assert_eq!(statuses[1], (ReadStatus::Ok, big));
        assert_eq!(
            statuses[2],
            (ReadStatus::Ok, b"go programming is fun".to_vec())
        );
        assert_eq!(statuses[3].0, ReadStatus::Eof);
    }

    #[test]
    fn test_padding_is_skipped() {
        let first = vec![3u8; BLOCK_SIZE - HEADER_SIZE - HEADER_SIZE];
        let bytes = write_all(&[&first, b"after padding"]);
        let statuses = read_statuses(&bytes);
        assert_eq!(statuses[0], (ReadStatus::Ok, first));
        assert_eq!(statuses[1], (ReadStatus::Ok, b"after padding".to_vec()));
        assert_eq!(statuses[2].0, ReadStatus::Eof);
    }

    #[test]
    fn test_crc_mismatch_is_corruption() {
        let mut bytes = write_all(&[b"one", b"two"]);
        let second = HEADER_SIZE + 3;
        bytes[second + HEADER_SIZE] ^= 0xFF;

        let statuses = read_statuses(&bytes);
        assert_eq!(statuses[0], (ReadStatus::Ok, b"one".to_vec()));
        assert_eq!(statuses[1].0, ReadStatus::Corruption);
    }

    #[test]
    fn test_short_header_is_corruption() {
        let mut bytes = write_all(&[b"one"]);
        bytes.extend_from_slice(&[1, 2, 3]);
        let statuses = read_statuses(&bytes);
        assert_eq!(statuses[1].0, ReadStatus::Corruption);
    }

    #[test]
    fn test_truncated_fragmented_record_is_corruption() {
        let big = vec![1u8; BLOCK_SIZE + 100];
        let bytes = write_all(&[&big]);
        let statuses = read_statuses(&bytes[..BLOCK_SIZE]);
        assert_eq!(statuses[0].0, ReadStatus::Corruption);
    }

    #[test]
    fn test_last_without_first_is_corruption() {
        let big = vec![1u8; BLOCK_SIZE + 100];
        let bytes = write_all(&[&big]);
        // Start reading at the second block, which holds only the LAST part.
        let statuses = read_statuses(&bytes[BLOCK_SIZE..]);
        assert_eq!(statuses[0].0, ReadStatus::Corruption);
    }

    #[test]
    fn test_full_inside_fragment_is_corruption() {
        let big = vec![1u8; BLOCK_SIZE + 100];
        let mut bytes = write_all(&[&big]);
        // Rewrite the LAST fragment's type as FULL, keeping its crc valid.
        bytes[BLOCK_SIZE + 4] = RecordType::Full as u8;
        let statuses = read_statuses(&bytes);
        assert_eq!(statuses[0].0, ReadStatus::Corruption);
    }

    #[test]
    fn test_length_out_of_range_is_corruption() {
        let mut bytes = write_all(&[b"abc"]);
        bytes[5..7].copy_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
        let statuses = read_statuses(&bytes);
        assert_eq!(statuses[0].0, ReadStatus::Corruption);
    }

    #[test]
    fn test_recover_truncates_at_corruption() {
        let mut bytes = write_all(&[b"keep", b"drop", b"lost"]);
        let second = HEADER_SIZE + 4;
        bytes[second] ^= 0x01;
        let recovered = LogReader::new(bytes.as_slice()).recover().unwrap();
        assert_eq!(recovered.records, vec![b"keep".to_vec()]);
        assert!(recovered.truncated);
    }

    #[test]
    fn test_last_record_offset() {
        let bytes = write_all(&[b"a", b"bb"]);
        let mut reader = LogReader::new(bytes.as_slice());
        let mut scratch = Vec::new();
        reader.read_record(&mut scratch).unwrap();
        assert_eq!(reader.last_record_offset(), 0);
        reader.read_record(&mut scratch).unwrap();
        assert_eq!(reader.last_record_offset(), (HEADER_SIZE + 1) as u64);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::writer::LogWriter;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_log_roundtrip(records in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..(BLOCK_SIZE + 500)), 1..6)
        ) {
            let mut writer = LogWriter::new(Vec::new());
            for r in &records {
                writer.append(r).unwrap();
            }
            let bytes = writer.into_inner();

            let recovered = LogReader::new(bytes.as_slice()).recover().unwrap();
            prop_assert!(!recovered.truncated);
            prop_assert_eq!(recovered.records, records);
        }
    }
}
