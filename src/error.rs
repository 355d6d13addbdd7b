//! Error types for typeprobe.

use thiserror::Error;
use typeprobe_pg::PgError;

/// Faults that abort an introspection call.
///
/// Server-reported problems with the query itself are not errors; they come
/// back as [`crate::Outcome::ServerError`].
#[derive(Debug, Error)]
pub enum TypeprobeError {
    /// Channel, protocol or unexpected server failure.
    #[error(transparent)]
    Pg(#[from] PgError),

    /// Catalog rows that contradict each other or can't be read.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// A type oid the catalog knows nothing about.
    #[error("Unknown type oid {0}")]
    UnknownType(u32),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TypeprobeError {
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for typeprobe operations.
pub type TypeprobeResult<T> = Result<T, TypeprobeError>;
