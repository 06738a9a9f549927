//! PostgreSQL wire protocol client.
//!
//! This module provides an async client that:
//! - Speaks the v3 extended query protocol, binary where the type allows it
//! - Caches prepared statements per connection and closes evicted ones once
//!   nothing references them any more
//! - Interrupts in-flight operations when the connection closes
//!
//! Architecture:
//! - `buffer`: Message framing and checked reads
//! - `protocol`: Frontend message encoding, backend message decoding
//! - `auth`: MD5 and SCRAM-SHA-256 authentication
//! - `types`: PostgreSQL type encoding/decoding
//! - `wire`: One request/response exchange at a time over the socket
//! - `statement`: Prepared statement handles
//! - `cache`: LRU statement cache and the pending-close set
//! - `connection`: Connection state machine and public query surface

pub mod auth;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod row;
pub mod statement;
pub mod types;
pub(crate) mod wire;

#[cfg(test)]
mod mock;

pub use cache::CacheStats;
pub use config::Config;
pub use connection::{Connection, ConnectionState};
pub use error::{PgError, PgResult, ServerError};
pub use row::{Column, Row, RowIndex};
pub use statement::PreparedStatement;
pub use types::{Format, Oid, Value};
