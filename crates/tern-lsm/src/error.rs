use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL error: {0}")]
    Wal(#[from] tern_wal::WalError),

    #[error("SSTable error: {0}")]
    SSTable(#[from] tern_sstable::SSTableError),

    /// An on-disk structural invariant was violated.
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Database is closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tern_core::CodecError> for Error {
    fn from(e: tern_core::CodecError) -> Self {
        Error::Corruption(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Corruption(format!("manifest decode: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
