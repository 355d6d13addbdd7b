//! PostgreSQL Driver Module (async I/O)
//!
//! - `channel.rs` - the `MessageChannel` seam every protocol step talks to
//! - `connection.rs` - connection options and the socket-backed channel
//! - `io.rs` - send / recv over the socket
//! - `startup.rs` - startup and authentication handshake
//! - `prepared.rs` - deterministic statement names

mod channel;
mod connection;
mod io;
mod prepared;
mod startup;
mod stream;

pub use channel::MessageChannel;
pub use connection::{ConnectionOptions, PgConnection, TlsConfig};
pub use prepared::statement_name;
pub use startup::{APPLICATION_NAME, AuthOutcome, authenticate};

use crate::protocol::{EncodeError, ErrorFields, MessageKind};

/// Error type for PostgreSQL driver operations.
#[derive(Debug)]
pub enum PgError {
    /// Connection error
    Connection(String),
    /// Protocol error (malformed or out-of-sequence message)
    Protocol(String),
    /// Authentication error
    Auth(String),
    /// ErrorResponse the caller was not prepared to handle
    Server(ErrorFields),
    /// Message could not be encoded
    Encode(EncodeError),
    /// I/O error
    Io(std::io::Error),
}

impl PgError {
    /// A reply of the wrong kind arrived.
    pub(crate) fn unexpected(expected: &[MessageKind], got: MessageKind) -> Self {
        PgError::Protocol(format!("expected one of {:?}, got {:?}", expected, got))
    }

    /// Server-reported fields, when this error came from an ErrorResponse.
    pub fn server_fields(&self) -> Option<&ErrorFields> {
        match self {
            PgError::Server(fields) => Some(fields),
            _ => None,
        }
    }
}

impl std::fmt::Display for PgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PgError::Connection(e) => write!(f, "Connection error: {}", e),
            PgError::Protocol(e) => write!(f, "Protocol error: {}", e),
            PgError::Auth(e) => write!(f, "Auth error: {}", e),
            PgError::Server(fields) => write!(f, "Server error: {}", fields),
            PgError::Encode(e) => write!(f, "Encode error: {}", e),
            PgError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PgError::Encode(e) => Some(e),
            PgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PgError {
    fn from(e: std::io::Error) -> Self {
        PgError::Io(e)
    }
}

impl From<EncodeError> for PgError {
    fn from(e: EncodeError) -> Self {
        PgError::Encode(e)
    }
}

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;
