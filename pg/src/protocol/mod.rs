//! PostgreSQL Wire Protocol (pure, sync)
//!
//! Message codec and authentication primitives.
//! No async, no I/O, no tokio - just bytes in, bytes out.

pub mod auth;
pub mod error;
pub mod wire;

pub use auth::{SaslContinue, SaslHelper, SaslInitial, ScramSha256, md5_password, SCRAM_SHA_256};
pub use error::EncodeError;
pub use wire::*;
