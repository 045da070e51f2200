//! Error types for tile decoding.

use std::fmt;

/// Errors that can occur while decoding a tile or hierarchy chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input length does not hold a whole number of records.
    BufferTooSmall { expected: usize, actual: usize },
    /// Invalid data format or structure.
    InvalidFormat {
        context: &'static str,
        detail: String,
    },
    /// A read ran past the end of the buffer.
    UnexpectedEof { context: &'static str },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall { expected, actual } => {
                write!(
                    f,
                    "buffer too small: expected a multiple of {expected} bytes, got {actual}"
                )
            }
            Self::InvalidFormat { context, detail } => {
                write!(f, "invalid format in {context}: {detail}")
            }
            Self::UnexpectedEof { context } => {
                write!(f, "unexpected end of buffer in {context}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Result type for decoding operations.
pub type DecodeResult<T> = Result<T, DecodeError>;
