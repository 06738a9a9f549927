//! Prepared statements.
//!
//! A [`PreparedStatement`] is a cheap, clonable handle. All clones share one
//! `Arc<StatementHandle>`, whose strong count is the number of references held
//! outside the connection. When the last clone goes away the handle's `Drop`
//! tells the connection synchronously, which is how an evicted statement that
//! was still in use finally gets closed on the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use smallvec::SmallVec;

use super::connection::Inner;
use super::error::{PgError, PgResult};
use super::row::{Column, Row, RowIndex, SharedColumns};
use super::types::{Format, Oid, Param, Value};
use super::wire::Description;

/// Parameters for one `Bind`, inline for the common short case.
pub(crate) type BoundParams = SmallVec<[Param; 8]>;

// ============================================================================
// Statement state
// ============================================================================

/// Everything known about a server-side statement.
///
/// Owned jointly by the cache (or pending-close set) and every handle.
#[derive(Debug)]
pub(crate) struct StatementState {
    /// Server-side name (e.g. `__pgprep_12`)
    pub name: String,
    /// The SQL query text, also the cache key
    pub query: String,
    /// Parameter types from `ParameterDescription`
    pub params: Vec<Oid>,
    /// Result columns from `RowDescription`, with the format we request
    pub columns: SharedColumns,
    /// Result format codes sent in every `Bind`
    pub result_formats: Vec<Format>,
    closed: AtomicBool,
}

impl StatementState {
    pub(crate) fn new(name: String, query: String, description: Description) -> Self {
        let columns: Vec<Column> = description
            .columns
            .into_iter()
            .map(|mut column| {
                column.format = column.type_oid.result_format();
                column
            })
            .collect();
        let result_formats = columns.iter().map(|c| c.format).collect();

        Self {
            name,
            query,
            params: description.params,
            columns: Arc::new(columns),
            result_formats,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed. Returns true only for the call that actually closed it,
    /// so the server-side close is queued exactly once.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Encode `values` against the described parameter types.
    pub(crate) fn encode_params(&self, values: &[Value]) -> PgResult<BoundParams> {
        if values.len() != self.params.len() {
            return Err(PgError::Type(format!(
                "statement expects {} parameters, {} given",
                self.params.len(),
                values.len()
            )));
        }
        values
            .iter()
            .zip(&self.params)
            .map(|(value, &oid)| value.encode(oid))
            .collect()
    }

    pub(crate) fn decode_row(&self, raw: Vec<Option<Bytes>>) -> PgResult<Row> {
        if raw.len() != self.columns.len() {
            return Err(PgError::Protocol(format!(
                "row has {} values, statement describes {} columns",
                raw.len(),
                self.columns.len()
            )));
        }

        let mut values = Vec::with_capacity(raw.len());
        for (data, column) in raw.into_iter().zip(self.columns.iter()) {
            values.push(match data {
                Some(data) => Value::decode(column.type_oid, column.format, &data)?,
                None => Value::Null,
            });
        }
        Ok(Row::new(Arc::clone(&self.columns), values))
    }
}

// ============================================================================
// Handle
// ============================================================================

/// The reference-counted part of a [`PreparedStatement`].
pub(crate) struct StatementHandle {
    pub(crate) state: Arc<StatementState>,
    pub(crate) conn: Weak<Inner>,
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.conn.upgrade() {
            inner.release(&self.state);
        }
    }
}

// ============================================================================
// Prepared Statement
// ============================================================================

/// A server-side prepared statement.
///
/// Obtained from [`Connection::prepare`](super::Connection::prepare).
/// Preparing the same query text again while this statement is cached returns
/// a handle to the same statement without a round trip.
#[derive(Clone)]
pub struct PreparedStatement {
    handle: Arc<StatementHandle>,
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("name", &self.state().name)
            .field("query", &self.state().query)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PreparedStatement {
    pub(crate) fn from_handle(handle: Arc<StatementHandle>) -> Self {
        Self { handle }
    }

    #[inline]
    pub(crate) fn state(&self) -> &Arc<StatementState> {
        &self.handle.state
    }

    /// The query text this statement was prepared from.
    pub fn query(&self) -> &str {
        &self.state().query
    }

    /// Parameter types the server inferred.
    pub fn parameters(&self) -> &[Oid] {
        &self.state().params
    }

    /// Result column descriptions.
    pub fn attributes(&self) -> &[Column] {
        &self.state().columns
    }

    /// Server-side statement name.
    pub fn name(&self) -> &str {
        &self.state().name
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Run the statement and return every row.
    pub async fn fetch(&self, params: &[Value]) -> PgResult<Vec<Row>> {
        self.connection()?.run(self.state(), params, 0).await
    }

    /// First row, or `None` when the statement returns no rows.
    pub async fn fetch_row(&self, params: &[Value]) -> PgResult<Option<Row>> {
        let rows = self.connection()?.run(self.state(), params, 1).await?;
        Ok(rows.into_iter().next())
    }

    /// First column of the first row. `None` for no rows or SQL NULL.
    pub async fn fetch_value(&self, params: &[Value]) -> PgResult<Option<Value>> {
        self.fetch_column(params, 0).await
    }

    /// First column of the first row, or `default` when there are no rows.
    /// SQL NULL comes back as [`Value::Null`].
    pub async fn fetch_value_or(&self, params: &[Value], default: Value) -> PgResult<Value> {
        match self.fetch_row(params).await? {
            Some(row) => row
                .take(0)
                .ok_or_else(|| PgError::Type("no column 0 in result".to_string())),
            None => Ok(default),
        }
    }

    /// The given column of the first row. `None` for no rows or SQL NULL.
    pub async fn fetch_column<I: RowIndex>(
        &self,
        params: &[Value],
        column: I,
    ) -> PgResult<Option<Value>> {
        let Some(row) = self.fetch_row(params).await? else {
            return Ok(None);
        };
        let described = column.describe();
        let value = row
            .take(column)
            .ok_or_else(|| PgError::Type(format!("no column {} in result", described)))?;
        Ok((!value.is_null()).then_some(value))
    }

    /// The server's plan for this statement with these parameters, as JSON.
    ///
    /// With `analyze` the statement is actually executed inside a
    /// transaction (or savepoint) that is rolled back afterwards, and the
    /// plan carries runtime statistics.
    pub async fn explain(&self, params: &[Value], analyze: bool) -> PgResult<serde_json::Value> {
        self.connection()?
            .explain(self.state(), params, analyze)
            .await
    }

    /// Close the statement now for every holder of this handle.
    ///
    /// The server-side close is sent ahead of the connection's next request.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if let Some(inner) = self.handle.conn.upgrade() {
            inner.close_statement(self.state());
        } else {
            self.state().mark_closed();
        }
    }

    /// The owning connection, or the closed error without any I/O.
    fn connection(&self) -> PgResult<Arc<Inner>> {
        if self.is_closed() {
            return Err(PgError::StatementClosed);
        }
        self.handle
            .conn
            .upgrade()
            .ok_or(PgError::StatementClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> Description {
        Description {
            params: vec![Oid::INT2, Oid::NUMERIC],
            columns: vec![
                Column {
                    name: "n".to_string(),
                    table_oid: 0,
                    column_attr: 0,
                    type_oid: Oid::INT4,
                    type_size: 4,
                    type_modifier: -1,
                    format: Format::Text,
                },
                Column {
                    name: "d".to_string(),
                    table_oid: 0,
                    column_attr: 0,
                    type_oid: Oid::NUMERIC,
                    type_size: -1,
                    type_modifier: -1,
                    format: Format::Text,
                },
            ],
        }
    }

    #[test]
    fn test_result_formats_follow_column_types() {
        let state = StatementState::new("s1".into(), "SELECT".into(), description());
        assert_eq!(state.result_formats, vec![Format::Binary, Format::Text]);
        assert_eq!(state.columns[0].format, Format::Binary);
    }

    #[test]
    fn test_encode_params_checks_count() {
        let state = StatementState::new("s1".into(), "SELECT".into(), description());
        let err = state.encode_params(&[Value::Int2(1)]).unwrap_err();
        assert!(matches!(err, PgError::Type(_)));

        let params = state
            .encode_params(&[Value::Int4(5), Value::Text("1.25".into())])
            .unwrap();
        assert_eq!(params[0].format, Format::Binary);
        assert_eq!(params[1].format, Format::Text);
    }

    #[test]
    fn test_decode_row() {
        let state = StatementState::new("s1".into(), "SELECT".into(), description());
        let row = state
            .decode_row(vec![
                Some(Bytes::copy_from_slice(&9i32.to_be_bytes())),
                None,
            ])
            .unwrap();
        assert_eq!(row["n"], Value::Int4(9));
        assert_eq!(row["d"], Value::Null);

        assert!(matches!(
            state.decode_row(vec![None]),
            Err(PgError::Protocol(_))
        ));
    }

    #[test]
    fn test_mark_closed_once() {
        let state = StatementState::new("s1".into(), "SELECT".into(), description());
        assert!(state.mark_closed());
        assert!(!state.mark_closed());
        assert!(state.is_closed());
    }
}
