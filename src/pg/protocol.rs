//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{BufMut, Bytes, BytesMut};

use super::buffer::{put_cstr, write_message, write_untagged, ReadBuffer};
use super::error::{PgError, PgResult};
use super::row::Column;
use super::types::{Format, Oid, Param};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Protocol(format!(
                "unknown transaction status '{}'",
                other as char
            ))),
        }
    }
}

/// Target of a `Describe` or `Close` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages into the connection's write buffer
pub trait FrontendMessage {
    fn encode(&self, buf: &mut BytesMut);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage<'a> {
    pub user: &'a str,
    pub database: Option<&'a str>,
    pub options: Vec<(&'a str, &'a str)>,
}

impl FrontendMessage for StartupMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_untagged(buf, |b| {
            b.put_i32(PROTOCOL_VERSION);
            put_cstr(b, "user");
            put_cstr(b, self.user);
            if let Some(db) = self.database {
                put_cstr(b, "database");
                put_cstr(b, db);
            }
            for (key, value) in &self.options {
                put_cstr(b, key);
                put_cstr(b, value);
            }
            b.put_u8(0);
        });
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendMessage for PasswordMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'p', |b| put_cstr(b, self.password));
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'p', |b| {
            put_cstr(b, self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(self.data);
        });
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'p', |b| b.put_slice(self.data));
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'Q', |b| put_cstr(b, self.query));
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'P', |b| {
            put_cstr(b, self.name);
            put_cstr(b, self.query);
            b.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                b.put_u32(oid.0);
            }
        });
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [Param],
    pub result_formats: &'a [Format],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'B', |b| {
            put_cstr(b, self.portal);
            put_cstr(b, self.statement);

            b.put_i16(self.params.len() as i16);
            for param in self.params {
                b.put_i16(param.format as i16);
            }

            b.put_i16(self.params.len() as i16);
            for param in self.params {
                match &param.data {
                    Some(data) => {
                        b.put_i32(data.len() as i32);
                        b.put_slice(data);
                    }
                    None => b.put_i32(-1),
                }
            }

            b.put_i16(self.result_formats.len() as i16);
            for fmt in self.result_formats {
                b.put_i16(*fmt as i16);
            }
        });
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'E', |b| {
            put_cstr(b, self.portal);
            b.put_i32(self.max_rows);
        });
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'D', |b| {
            b.put_u8(self.target.code());
            put_cstr(b, self.name);
        });
    }
}

/// Close message ('C') - Release a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'C', |b| {
            b.put_u8(self.target.code());
            put_cstr(b, self.name);
        });
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'S', |_| {});
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, b'X', |_| {});
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<Column> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: Vec<(u8, String)> },
    NoticeResponse { fields: Vec<(u8, String)> },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode the body of a message with the given tag.
    ///
    /// Any field running past the end of `body` is a protocol error.
    pub fn decode(tag: u8, body: Bytes) -> PgResult<Self> {
        let mut body = ReadBuffer::new(body);

        let msg = match tag {
            b'R' => Self::decode_auth(body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: body.read_cstr()?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::try_from(body.read_u8()?)?,
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: body.read_cstr()?,
                value: body.read_cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.read_i32()?,
                secret_key: body.read_i32()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let count = body.read_count()?;
                let mut type_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    type_oids.push(Oid(body.read_i32()? as u32));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.read_i32()?,
                channel: body.read_cstr()?,
                payload: body.read_cstr()?,
            },
            _ => {
                return Err(PgError::Protocol(format!(
                    "unknown message type '{}'",
                    tag as char
                )))
            }
        };

        Ok(msg)
    }

    /// Short name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk
            | BackendMessage::AuthenticationCleartextPassword
            | BackendMessage::AuthenticationMD5Password { .. }
            | BackendMessage::AuthenticationSASL { .. }
            | BackendMessage::AuthenticationSASLContinue { .. }
            | BackendMessage::AuthenticationSASLFinal { .. } => "Authentication",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }

    fn decode_auth(mut body: ReadBuffer) -> PgResult<Self> {
        let auth_type = body.read_i32()?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let raw = body.read_bytes(4)?;
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&raw);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = body.read_cstr()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue {
                data: body.into_rest(),
            }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal {
                data: body.into_rest(),
            }),
            _ => Err(PgError::Auth(format!(
                "unsupported authentication request {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(body: &mut ReadBuffer) -> PgResult<Self> {
        let count = body.read_count()?;
        let mut fields = Vec::with_capacity(count);

        for _ in 0..count {
            fields.push(Column {
                name: body.read_cstr()?,
                table_oid: body.read_i32()? as u32,
                column_attr: body.read_i16()?,
                type_oid: Oid(body.read_i32()? as u32),
                type_size: body.read_i16()?,
                type_modifier: body.read_i32()?,
                format: Format::from_code(body.read_i16()?)?,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut ReadBuffer) -> PgResult<Self> {
        let count = body.read_count()?;
        let mut values = Vec::with_capacity(count);

        for _ in 0..count {
            values.push(body.read_nullable()?);
        }

        Ok(BackendMessage::DataRow { values })
    }
}

/// Read error/notice response fields
fn read_error_fields(body: &mut ReadBuffer) -> PgResult<Vec<(u8, String)>> {
    let mut fields = Vec::new();

    while body.remaining() > 0 {
        let field_type = body.read_u8()?;
        if field_type == 0 {
            break;
        }
        fields.push((field_type, body.read_cstr()?));
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: &impl FrontendMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        buf
    }

    #[test]
    fn test_startup_message_structure() {
        let encoded = encode(&StartupMessage {
            user: "test",
            database: Some("testdb"),
            options: vec![],
        });

        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());

        let version = i32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(&encoded[8..], b"user\0test\0database\0testdb\0\0");
    }

    #[test]
    fn test_close_message_structure() {
        let encoded = encode(&CloseMessage {
            target: Target::Statement,
            name: "s1",
        });
        assert_eq!(&encoded[..], b"C\0\0\0\x08Ss1\0");
    }

    #[test]
    fn test_bind_message_null_and_formats() {
        let params = [
            Param::null(),
            Param {
                format: Format::Text,
                data: Some(Bytes::from_static(b"1.5")),
            },
        ];
        let encoded = encode(&BindMessage {
            portal: "",
            statement: "s",
            params: &params,
            result_formats: &[Format::Binary],
        });

        let body = &encoded[5..];
        // portal "", statement "s"
        assert_eq!(&body[..3], b"\0s\0");
        // two format codes: binary, text
        assert_eq!(&body[3..9], &[0, 2, 0, 1, 0, 0]);
        // two values: NULL, "1.5"
        assert_eq!(&body[9..11], &[0, 2]);
        assert_eq!(&body[11..15], &(-1i32).to_be_bytes());
        assert_eq!(&body[15..19], &3i32.to_be_bytes());
        assert_eq!(&body[19..22], b"1.5");
        // one result format: binary
        assert_eq!(&body[22..], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_decode_truncated_data_row_is_protocol_error() {
        // Column count says 1 but the length word is cut short
        let body = Bytes::from_static(&[0, 1, 0, 0]);
        let err = BackendMessage::decode(b'D', body).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }

    #[test]
    fn test_decode_unknown_tag() {
        let err = BackendMessage::decode(b'?', Bytes::new()).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }
}
