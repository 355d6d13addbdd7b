//! Encoding errors for frontend messages.

use std::fmt;

/// Errors that can occur while encoding a frontend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A string field contains a NUL byte (0x00), which cannot be framed
    /// as a protocol C string.
    NullByte,
    /// Too many declared parameter types (limit is i16::MAX = 32767).
    TooManyParameters(usize),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::NullByte => {
                write!(f, "string contains a NUL byte (0x00), which the protocol cannot carry")
            }
            EncodeError::TooManyParameters(count) => {
                write!(f, "too many parameter types: {} (limit is 32767)", count)
            }
        }
    }
}

impl std::error::Error for EncodeError {}
