//! Record-based log stream used by the write-ahead log and the manifest.
//!
//! The stream is a sequence of 32 KiB blocks. A logical record is split into
//! one or more physical fragments, none of which crosses a block boundary:
//!
//! ```text
//! +---------+--------+-----------+------------------+
//! | crc32:4 | type:1 | total:2   | payload fragment |
//! +---------+--------+-----------+------------------+
//!   total = 7 + fragment length, all fields little-endian
//!   type  = FULL(1) | FIRST(2) | MIDDLE(3) | LAST(4)
//! ```
//!
//! A block tail of seven bytes or fewer is zero-filled padding.
//!
//! # Example
//!
//! ```
//! use tern_wal::{LogReader, LogWriter, ReadStatus};
//!
//! let mut writer = LogWriter::new(Vec::new());
//! writer.append(b"hello world").unwrap();
//! let bytes = writer.into_inner();
//!
//! let mut reader = LogReader::new(bytes.as_slice());
//! let mut scratch = Vec::new();
//! assert_eq!(reader.read_record(&mut scratch).unwrap(), ReadStatus::Ok);
//! assert_eq!(scratch, b"hello world");
//! assert_eq!(reader.read_record(&mut scratch).unwrap(), ReadStatus::Eof);
//! ```

pub mod error;
pub mod format;
pub mod reader;
pub mod writer;

pub use error::{Result, WalError};
pub use format::{RecordType, BLOCK_SIZE, HEADER_SIZE};
pub use reader::{LogReader, ReadStatus, Recovered};
pub use writer::LogWriter;
