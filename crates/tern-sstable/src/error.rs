//! Error types for tern-sstable operations.

use std::io;
use tern_core::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SSTableError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk structure violates the block or table format.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Leaf payload would exceed the size hint given to the builder.
    #[error("Table overflow: entry of {entry_bytes} bytes does not fit in size hint {size_hint}")]
    Overflow { entry_bytes: usize, size_hint: usize },
}

impl From<CodecError> for SSTableError {
    fn from(e: CodecError) -> Self {
        SSTableError::Corruption(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SSTableError>;
