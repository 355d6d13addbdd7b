//! PostgreSQL wire layer for typeprobe.
//!
//! **Features:** protocol 3.0 codec, SCRAM-SHA-256 / MD5 / cleartext auth,
//! TCP, TLS and Unix socket transports behind one `MessageChannel` trait.
//!
//! ```ignore
//! let options = ConnectionOptions::new("localhost", 5432, "postgres", "app").password("secret");
//! let mut conn = PgConnection::connect(&options).await?;
//! conn.send(FrontendMessage::Query("SELECT 1".into())).await?;
//! ```

pub mod driver;
pub mod protocol;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use driver::{
    APPLICATION_NAME, AuthOutcome, ConnectionOptions, MessageChannel, PgConnection, PgError,
    PgResult, TlsConfig, authenticate, statement_name,
};
pub use protocol::{
    BackendMessage, ErrorFields, FieldDescription, FrontendMessage, MessageKind, SaslHelper,
    ScramSha256, Target, TransactionStatus, md5_password,
};
