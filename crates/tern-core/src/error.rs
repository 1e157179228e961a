use thiserror::Error;

/// Decoding failures of the shared codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Incomplete input: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("Varint overflow")]
    VarintOverflow,
}

pub type Result<T> = std::result::Result<T, CodecError>;
