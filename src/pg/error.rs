//! Error types for the PostgreSQL client.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unexpected server message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Server returned an error.
    #[error(transparent)]
    Server(Box<ServerError>),

    /// Value could not be encoded or decoded for the requested type.
    #[error("type error: {0}")]
    Type(String),

    /// Invalid connection configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The connection was already closed when the operation started.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The connection was closed or terminated while the operation was waiting
    /// on the server.
    #[error("connection was closed in the middle of operation")]
    ClosedMidOperation,

    /// The prepared statement was closed before the operation started.
    #[error("prepared statement is closed")]
    StatementClosed,

    /// Timeout waiting for the server.
    #[error("operation timed out")]
    Timeout,
}

impl PgError {
    /// True for both flavours of "the connection is gone".
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, PgError::ConnectionClosed | PgError::ClosedMidOperation)
    }

    /// The server diagnostic, if the server reported this error.
    pub fn server(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(err) => Some(err),
            _ => None,
        }
    }

    /// SQLSTATE code of a server-reported error.
    pub fn code(&self) -> Option<&str> {
        self.server().map(|err| err.code.as_str())
    }
}

impl From<ServerError> for PgError {
    fn from(err: ServerError) -> Self {
        PgError::Server(Box::new(err))
    }
}

/// Diagnostic reported by the server in an `ErrorResponse`.
///
/// The message is kept verbatim; `RAISE EXCEPTION` texts of hundreds of
/// kilobytes arrive intact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub context: Option<String>,
}

impl ServerError {
    /// Build from the `(field type, value)` pairs of an error or notice body.
    pub fn from_fields(fields: Vec<(u8, String)>) -> Self {
        let mut err = ServerError::default();
        for (kind, value) in fields {
            match kind {
                // 'V' is the non-localized severity, prefer it when present
                b'S' if err.severity.is_empty() => err.severity = value,
                b'V' => err.severity = value,
                b'C' => err.code = value,
                b'M' => err.message = value,
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                b'P' => err.position = value.parse().ok(),
                b'W' => err.context = Some(value),
                _ => {}
            }
        }
        err
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}
