//! pgprep - an async PostgreSQL client built around prepared statements.
//!
//! ```no_run
//! # async fn demo() -> pgprep::PgResult<()> {
//! use pgprep::{Connection, Value};
//!
//! let conn = Connection::connect("postgresql://postgres@localhost/postgres").await?;
//! let stmt = conn.prepare("SELECT $1::int4 + 1").await?;
//! assert_eq!(stmt.fetch_value(&[Value::Int4(41)]).await?, Some(Value::Int4(42)));
//!
//! // Same text, same server-side statement, no round trip
//! let again = conn.prepare("SELECT $1::int4 + 1").await?;
//! assert_eq!(again.name(), stmt.name());
//!
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod pg;

pub use pg::{
    CacheStats, Column, Config, Connection, ConnectionState, Format, Oid, PgError, PgResult,
    PreparedStatement, Row, RowIndex, ServerError, Value,
};
