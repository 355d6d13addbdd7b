//! # typeprobe
//!
//! > **Ask the server what your SQL means.**
//!
//! typeprobe prepares each query on a live PostgreSQL connection without
//! running it, then resolves its placeholder and result column types
//! (enums and arrays of enums included), column nullability and comments.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use typeprobe::prelude::*;
//!
//! let options = ConnectionOptions::new("localhost", 5432, "postgres", "app");
//! let mut conn = PgConnection::connect(&options).await?;
//!
//! let mapping = BTreeMap::from([(1, "userId".to_string())]);
//! match typeprobe::infer("SELECT id, name FROM users WHERE id = $1", mapping, &mut conn).await? {
//!     Outcome::Ok(types) => println!("{}", serde_json::to_string_pretty(&types)?),
//!     Outcome::ServerError(e) => eprintln!("{}", e),
//! }
//! ```
//!
//! ## Pipeline
//!
//! | Step       | Module     | Talks to                        |
//! |------------|------------|---------------------------------|
//! | Probe      | `probe`    | Parse / Describe / Close / Sync |
//! | Explain    | `explain`  | `EXPLAIN EXECUTE` with NULLs    |
//! | Types      | `catalog`  | `pg_type`, `pg_enum`            |
//! | Columns    | `metadata` | `pg_attribute`, `pg_description`|

pub mod catalog;
pub mod config;
pub mod error;
pub mod escape;
pub mod explain;
pub mod infer;
pub mod metadata;
pub mod probe;
pub mod query;
pub mod types;

pub use error::{TypeprobeError, TypeprobeResult};
pub use infer::{infer, infer_with};
pub use types::*;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::*;
    pub use crate::infer::{infer, infer_with};
    pub use crate::types::*;
    pub use std::collections::BTreeMap;
    pub use typeprobe_pg::{
        AuthOutcome, ConnectionOptions, MessageChannel, PgConnection, PgError, TlsConfig,
    };
}
