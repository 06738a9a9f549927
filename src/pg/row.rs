//! Result rows.

use std::ops::Index;
use std::sync::Arc;

use super::error::{PgError, PgResult};
use super::types::{Format, Oid, Value};

/// Field description from a `RowDescription` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Column descriptions shared between a statement and every row it produces.
pub type SharedColumns = Arc<Vec<Column>>;

/// A decoded row, addressable by position or by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: SharedColumns,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Value at `index`, or `None` if there is no such column.
    pub fn get<I: RowIndex>(&self, index: I) -> Option<&Value> {
        index.position(self).map(|i| &self.values[i])
    }

    /// Like [`Row::get`], reporting a missing column as an error.
    pub fn try_get<I: RowIndex>(&self, index: I) -> PgResult<&Value> {
        let described = index.describe();
        self.get(index)
            .ok_or_else(|| PgError::Type(format!("no column {} in row", described)))
    }

    /// Take the value at `index` out of the row.
    pub(crate) fn take<I: RowIndex>(mut self, index: I) -> Option<Value> {
        let i = index.position(&self)?;
        Some(self.values.swap_remove(i))
    }
}

/// Something that selects a column of a [`Row`].
pub trait RowIndex {
    fn position(&self, row: &Row) -> Option<usize>;

    fn describe(&self) -> String;
}

impl RowIndex for usize {
    fn position(&self, row: &Row) -> Option<usize> {
        (*self < row.values.len()).then_some(*self)
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl RowIndex for &str {
    fn position(&self, row: &Row) -> Option<usize> {
        row.columns.iter().position(|c| c.name == *self)
    }

    fn describe(&self) -> String {
        format!("{:?}", self)
    }
}

impl<I: RowIndex> Index<I> for Row {
    type Output = Value;

    /// Panics if the column does not exist, like slice indexing.
    fn index(&self, index: I) -> &Value {
        match index.position(self) {
            Some(i) => &self.values[i],
            None => panic!("no column {} in row", index.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, type_oid: Oid) -> Column {
        Column {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: Format::Binary,
        }
    }

    #[test]
    fn test_positional_and_named_access() {
        let columns = Arc::new(vec![column("id", Oid::INT4), column("name", Oid::TEXT)]);
        let row = Row::new(
            columns,
            vec![Value::Int4(7), Value::Text("seven".to_string())],
        );

        assert_eq!(row.len(), 2);
        assert_eq!(row[0], Value::Int4(7));
        assert_eq!(row["name"], Value::Text("seven".to_string()));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.get(5), None);
        assert!(row.try_get("missing").is_err());
        assert_eq!(row.take("name"), Some(Value::Text("seven".to_string())));
    }
}
