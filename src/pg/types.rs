//! PostgreSQL type encoding and decoding.
//!
//! Parameters are encoded against the type the server described for them,
//! results are decoded according to the column type and the format we asked
//! for in `Bind`. Types without a binary codec here travel in text format.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use uuid::Uuid;

use super::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub u32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const NUMERIC: Oid = Oid(1700);
    pub const VOID: Oid = Oid(2278);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Format to request for result columns of this type.
    pub fn result_format(self) -> Format {
        match self {
            Oid::BOOL
            | Oid::BYTEA
            | Oid::INT2
            | Oid::INT4
            | Oid::INT8
            | Oid::OID
            | Oid::FLOAT4
            | Oid::FLOAT8
            | Oid::TEXT
            | Oid::VARCHAR
            | Oid::BPCHAR
            | Oid::NAME
            | Oid::UUID
            | Oid::DATE
            | Oid::TIME
            | Oid::TIMESTAMP
            | Oid::TIMESTAMPTZ
            | Oid::JSON
            | Oid::JSONB => Format::Binary,
            _ => Format::Text,
        }
    }
}

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    pub fn from_code(code: i16) -> PgResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(PgError::Protocol(format!("unknown format code {}", other))),
        }
    }
}

// ============================================================================
// Values
// ============================================================================

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// `num_days_from_ce` of 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;

/// A PostgreSQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary precision numbers keep the server's textual form.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(String),
}

/// A parameter ready for a `Bind` message.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub format: Format,
    /// `None` encodes SQL NULL.
    pub data: Option<Bytes>,
}

impl Param {
    pub fn null() -> Self {
        Self {
            format: Format::Binary,
            data: None,
        }
    }
}

impl Value {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Any integer variant widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int2(v) => Some(i64::from(*v)),
            Value::Int4(v) => Some(i64::from(*v)),
            Value::Int8(v) => Some(*v),
            _ => None,
        }
    }

    /// Any integer or float variant as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float4(v) => Some(f64::from(*v)),
            Value::Float8(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Borrow textual variants (text, numeric, json).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Numeric(s) | Value::Json(s) => Some(s),
            _ => None,
        }
    }

    /// Encode this value as a parameter of type `oid`.
    ///
    /// Uses the binary format where a codec exists for the pair, and falls
    /// back to the text representation, which the server parses itself.
    pub fn encode(&self, oid: Oid) -> PgResult<Param> {
        if self.is_null() {
            return Ok(Param::null());
        }
        Ok(match self.encode_binary(oid)? {
            Some(data) => Param {
                format: Format::Binary,
                data: Some(Bytes::from(data)),
            },
            None => Param {
                format: Format::Text,
                data: Some(Bytes::from(self.to_text())),
            },
        })
    }

    /// Binary encoding for parameter type `oid`, or `None` when this value
    /// has no binary codec for that type.
    pub fn encode_binary(&self, oid: Oid) -> PgResult<Option<Vec<u8>>> {
        let out = match oid {
            Oid::BOOL => self.as_bool().map(|v| vec![u8::from(v)]),
            Oid::INT2 => match self.as_i64() {
                Some(v) => Some(narrow::<i16>(v, "int2")?.to_be_bytes().to_vec()),
                None => None,
            },
            Oid::INT4 => match self.as_i64() {
                Some(v) => Some(narrow::<i32>(v, "int4")?.to_be_bytes().to_vec()),
                None => None,
            },
            Oid::INT8 => self.as_i64().map(|v| v.to_be_bytes().to_vec()),
            Oid::OID => match self.as_i64() {
                Some(v) => Some(narrow::<u32>(v, "oid")?.to_be_bytes().to_vec()),
                None => None,
            },
            Oid::FLOAT4 => self.as_f64().map(|v| (v as f32).to_be_bytes().to_vec()),
            Oid::FLOAT8 => self.as_f64().map(|v| v.to_be_bytes().to_vec()),
            Oid::JSONB => match self {
                Value::Json(s) | Value::Text(s) => {
                    let mut data = Vec::with_capacity(s.len() + 1);
                    data.push(1);
                    data.extend_from_slice(s.as_bytes());
                    Some(data)
                }
                _ => None,
            },
            Oid::JSON | Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::NAME => match self {
                Value::Text(s) | Value::Json(s) => Some(s.as_bytes().to_vec()),
                _ => None,
            },
            Oid::BYTEA => match self {
                Value::Bytea(v) => Some(v.clone()),
                _ => None,
            },
            Oid::UUID => match self {
                Value::Uuid(v) => Some(v.as_bytes().to_vec()),
                _ => None,
            },
            Oid::DATE => match self {
                Value::Date(d) => {
                    Some((d.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE).to_be_bytes().to_vec())
                }
                _ => None,
            },
            Oid::TIME => match self {
                Value::Time(t) => {
                    let micros = i64::from(t.num_seconds_from_midnight()) * 1_000_000
                        + i64::from(t.nanosecond() / 1_000);
                    Some(micros.to_be_bytes().to_vec())
                }
                _ => None,
            },
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => {
                let micros = match self {
                    Value::Timestamp(ts) => Some(ts.and_utc().timestamp_micros()),
                    Value::TimestampTz(ts) => Some(ts.timestamp_micros()),
                    _ => None,
                };
                micros.map(|m| (m - PG_EPOCH_OFFSET_MICROS).to_be_bytes().to_vec())
            }
            _ => None,
        };
        Ok(out)
    }

    /// Text representation as the server's input functions accept it.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
            Value::Int2(v) => v.to_string(),
            Value::Int4(v) => v.to_string(),
            Value::Int8(v) => v.to_string(),
            Value::Float4(v) if v.is_finite() => v.to_string(),
            Value::Float4(v) => float_text(f64::from(*v)),
            Value::Float8(v) => float_text(*v),
            Value::Numeric(s) | Value::Text(s) | Value::Json(s) => s.clone(),
            Value::Bytea(v) => {
                let mut out = String::with_capacity(2 + v.len() * 2);
                out.push_str("\\x");
                for b in v {
                    out.push_str(&format!("{:02x}", b));
                }
                out
            }
            Value::Uuid(v) => v.hyphenated().to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Value::TimestampTz(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f+00").to_string(),
        }
    }

    /// Decode a column value received in `format`.
    pub fn decode(oid: Oid, format: Format, data: &[u8]) -> PgResult<Self> {
        match format {
            Format::Binary => Self::decode_binary(oid, data),
            Format::Text => Self::decode_text(oid, data),
        }
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        match oid {
            Oid::BOOL => match data {
                [b] => Ok(Value::Bool(*b != 0)),
                _ => Err(bad_length("bool", data)),
            },
            Oid::INT2 => Ok(Value::Int2(i16::from_be_bytes(fixed(data, "int2")?))),
            Oid::INT4 => Ok(Value::Int4(i32::from_be_bytes(fixed(data, "int4")?))),
            Oid::INT8 => Ok(Value::Int8(i64::from_be_bytes(fixed(data, "int8")?))),
            Oid::OID => Ok(Value::Int8(i64::from(u32::from_be_bytes(fixed(data, "oid")?)))),
            Oid::FLOAT4 => Ok(Value::Float4(f32::from_be_bytes(fixed(data, "float4")?))),
            Oid::FLOAT8 => Ok(Value::Float8(f64::from_be_bytes(fixed(data, "float8")?))),
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN => {
                Ok(Value::Text(utf8(data, "text")?))
            }
            Oid::BYTEA => Ok(Value::Bytea(data.to_vec())),
            Oid::UUID => Uuid::from_slice(data)
                .map(Value::Uuid)
                .map_err(|_| bad_length("uuid", data)),
            Oid::DATE => {
                let days = i32::from_be_bytes(fixed(data, "date")?);
                days.checked_add(PG_EPOCH_DAYS_FROM_CE)
                    .and_then(NaiveDate::from_num_days_from_ce_opt)
                    .map(Value::Date)
                    .ok_or_else(|| PgError::Type(format!("date out of range: {}", days)))
            }
            Oid::TIME => {
                let micros = i64::from_be_bytes(fixed(data, "time")?);
                let secs = u32::try_from(micros / 1_000_000).ok();
                let nanos = ((micros % 1_000_000) * 1_000) as u32;
                secs.and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, nanos))
                    .map(Value::Time)
                    .ok_or_else(|| PgError::Type(format!("time out of range: {}", micros)))
            }
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => {
                let micros = i64::from_be_bytes(fixed(data, "timestamp")?);
                let ts = micros
                    .checked_add(PG_EPOCH_OFFSET_MICROS)
                    .and_then(DateTime::<Utc>::from_timestamp_micros)
                    .ok_or_else(|| PgError::Type(format!("timestamp out of range: {}", micros)))?;
                if oid == Oid::TIMESTAMPTZ {
                    Ok(Value::TimestampTz(ts))
                } else {
                    Ok(Value::Timestamp(ts.naive_utc()))
                }
            }
            Oid::JSON => Ok(Value::Json(utf8(data, "json")?)),
            Oid::JSONB => match data.split_first() {
                Some((1, rest)) => Ok(Value::Json(utf8(rest, "jsonb")?)),
                Some((version, _)) => Err(PgError::Type(format!(
                    "unsupported jsonb version {}",
                    version
                ))),
                None => Err(bad_length("jsonb", data)),
            },
            other => Err(PgError::Type(format!(
                "no binary decoder for type oid {}",
                other.0
            ))),
        }
    }

    /// Decode from text format (simple queries and types without a binary
    /// codec).
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = utf8(data, "text value")?;

        let parsed = match oid {
            Oid::BOOL => Value::Bool(text == "t" || text == "true"),
            Oid::INT2 => Value::Int2(parse(&text, "int2")?),
            Oid::INT4 => Value::Int4(parse(&text, "int4")?),
            Oid::INT8 | Oid::OID => Value::Int8(parse(&text, "int8")?),
            Oid::FLOAT4 => Value::Float4(parse(&text, "float4")?),
            Oid::FLOAT8 => Value::Float8(parse(&text, "float8")?),
            Oid::NUMERIC => Value::Numeric(text),
            Oid::JSON | Oid::JSONB => Value::Json(text),
            Oid::UUID => Value::Uuid(parse(&text, "uuid")?),
            Oid::DATE => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| PgError::Type(format!("invalid date {:?}: {}", text, e)))?,
            Oid::TIME => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
                .map(Value::Time)
                .map_err(|e| PgError::Type(format!("invalid time {:?}: {}", text, e)))?,
            Oid::TIMESTAMP => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                .map(Value::Timestamp)
                .map_err(|e| PgError::Type(format!("invalid timestamp {:?}: {}", text, e)))?,
            Oid::TIMESTAMPTZ => DateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|ts| Value::TimestampTz(ts.with_timezone(&Utc)))
                .map_err(|e| PgError::Type(format!("invalid timestamptz {:?}: {}", text, e)))?,
            // Everything else, including bytea in its escaped form, stays text
            _ => Value::Text(text),
        };
        Ok(parsed)
    }
}

fn narrow<T: TryFrom<i64>>(v: i64, ty: &str) -> PgResult<T> {
    T::try_from(v).map_err(|_| PgError::Type(format!("{} is out of range for {}", v, ty)))
}

fn fixed<const N: usize>(data: &[u8], ty: &str) -> PgResult<[u8; N]> {
    data.try_into().map_err(|_| bad_length(ty, data))
}

fn bad_length(ty: &str, data: &[u8]) -> PgError {
    PgError::Type(format!("invalid {} length: {}", ty, data.len()))
}

fn utf8(data: &[u8], ty: &str) -> PgResult<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| PgError::Type(format!("invalid UTF-8 in {}: {}", ty, e)))
}

fn parse<T>(text: &str, ty: &str) -> PgResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    text.parse::<T>()
        .map_err(|e| PgError::Type(format!("invalid {} {:?}: {}", ty, text, e)))
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        (if v > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else {
        v.to_string()
    }
}

// ============================================================================
// Conversions
// ============================================================================

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    Vec<u8> => Bytea,
    Uuid => Uuid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
