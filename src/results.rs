//! Adapts one executed statement into the row-shaped views the application
//! asks for: a single row at a time, materialized batches, or a tabular
//! string, with optional lazy JSON/JSONB expansion.

use std::collections::HashMap;

use crate::driver::{RawResult, RawRow, Value};

/// The outcome of one executed statement.
///
/// `S` is the driver's statement-handle type ([`crate::driver::Driver::Statement`]);
/// a `Results` keeps it alive (by holding a clone) until the `Results` itself
/// is dropped, per §4.4's lifetime rule.
pub struct Results<S> {
    stmt: S,
    columns: Vec<String>,
    column_is_json: Vec<bool>,
    rows: Vec<RawRow>,
    rows_affected: u64,
    cursor: usize,
    expand: bool,
}

impl<S> Results<S> {
    pub(crate) fn new(stmt: S, raw: RawResult) -> Self {
        Results {
            stmt,
            columns: raw.columns,
            column_is_json: raw.column_is_json,
            rows: raw.rows,
            rows_affected: raw.rows_affected,
            cursor: 0,
            expand: false,
        }
    }

    /// A `Results` for a statement that never ran to completion (e.g. an
    /// asynchronous query that errored): no rows, no columns.
    pub(crate) fn empty(stmt: S) -> Self {
        Results {
            stmt,
            columns: Vec::new(),
            column_is_json: Vec::new(),
            rows: Vec::new(),
            rows_affected: 0,
            cursor: 0,
            expand: false,
        }
    }

    /// Ordered column names. Idempotent.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows affected (INSERT/UPDATE/DELETE) or row count (SELECT, when
    /// available). Idempotent.
    pub fn rows(&self) -> u64 {
        if self.rows_affected > 0 {
            self.rows_affected
        } else {
            self.rows.len() as u64
        }
    }

    /// Sets the JSON-expand flag: on subsequent row reads, any JSON/JSONB
    /// column is decoded rather than handed back as a raw string. Applied
    /// per-row as rows are read, not eagerly to already-read rows.
    pub fn expand(mut self) -> Self {
        self.expand = true;
        self
    }

    fn expand_row(&self, row: &RawRow) -> Vec<Value> {
        if !self.expand {
            return row.values.clone();
        }
        row.values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let is_json = self.column_is_json.get(i).copied().unwrap_or(false);
                match (is_json, v) {
                    (true, Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| v.clone()),
                    _ => v.clone(),
                }
            })
            .collect()
    }

    /// The next row as an ordered sequence of column values, or `None` when
    /// exhausted.
    pub fn array(&mut self) -> Option<Vec<Value>> {
        let row = self.rows.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(self.expand_row(&row))
    }

    /// The next row as a column-name-to-value mapping, or `None` when
    /// exhausted.
    pub fn hash(&mut self) -> Option<HashMap<String, Value>> {
        let values = self.array()?;
        Some(self.columns.iter().cloned().zip(values).collect())
    }

    /// All remaining rows as array-of-arrays. Materializes; calling this
    /// after manually walking rows with [`Results::array`] only returns what
    /// remains.
    pub fn arrays(&mut self) -> Vec<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(row) = self.array() {
            out.push(row);
        }
        out
    }

    /// All remaining rows as array-of-hashes.
    pub fn hashes(&mut self) -> Vec<HashMap<String, Value>> {
        let mut out = Vec::new();
        while let Some(row) = self.hash() {
            out.push(row);
        }
        out
    }

    /// Consumes the `Results`, returning the raw remaining rows without
    /// column-name zipping (used internally, e.g. by
    /// [`crate::session::Session::tables`]).
    pub(crate) fn into_rows(mut self) -> Vec<RawRow> {
        let remaining = self.rows.split_off(self.cursor);
        self.cursor = self.rows.len();
        remaining
    }

    /// A tabular string rendering: two-space column separation, one line per
    /// remaining row, no header. Consumes rows like [`Results::array`].
    pub fn text(&mut self) -> String {
        let mut out = String::new();
        while let Some(row) = self.array() {
            let cells: Vec<String> = row.iter().map(render_cell).collect();
            out.push_str(&cells.join("  "));
            out.push('\n');
        }
        out
    }

    /// The underlying statement handle, exposed for introspection and
    /// identity assertions in tests.
    pub fn sth(&self) -> &S {
        &self.stmt
    }
}

fn render_cell(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Results<&'static str> {
        Results::new(
            "stmt",
            RawResult {
                columns: vec!["one".into(), "two".into(), "three".into()],
                column_is_json: vec![false, false, false],
                rows: vec![RawRow {
                    values: vec![1.into(), 2.into(), 3.into()],
                }],
                rows_affected: 0,
            },
        )
    }

    #[test]
    fn first_row_as_hash_matches_column_order() {
        let mut r = sample();
        let row = r.hash().unwrap();
        assert_eq!(row.get("one"), Some(&Value::from(1)));
        assert_eq!(row.get("two"), Some(&Value::from(2)));
        assert_eq!(row.get("three"), Some(&Value::from(3)));
    }

    #[test]
    fn exhausted_array_returns_none() {
        let mut r = sample();
        assert!(r.array().is_some());
        assert!(r.array().is_none());
    }

    #[test]
    fn rows_affected_takes_priority_over_row_count() {
        let r = Results::new(
            "stmt",
            RawResult {
                columns: vec![],
                column_is_json: vec![],
                rows: vec![],
                rows_affected: 7,
            },
        );
        assert_eq!(r.rows(), 7);
    }

    #[test]
    fn expand_decodes_json_typed_columns() {
        let mut r = Results::new(
            "stmt",
            RawResult {
                columns: vec!["data".into()],
                column_is_json: vec![true],
                rows: vec![RawRow {
                    values: vec![Value::String("{\"a\":1}".into())],
                }],
                rows_affected: 0,
            },
        )
        .expand();
        let row = r.array().unwrap();
        assert_eq!(row[0], serde_json::json!({"a": 1}));
    }

    #[test]
    fn expand_leaves_non_json_text_columns_alone() {
        // A plain text column whose contents happen to parse as JSON must
        // not be rewritten: only columns flagged JSON/JSONB are decoded.
        let mut r = Results::new(
            "stmt",
            RawResult {
                columns: vec!["name".into()],
                column_is_json: vec![false],
                rows: vec![RawRow {
                    values: vec![Value::String("123".into())],
                }],
                rows_affected: 0,
            },
        )
        .expand();
        let row = r.array().unwrap();
        assert_eq!(row[0], Value::String("123".into()));
    }

    #[test]
    fn text_has_no_header_row() {
        let mut r = sample();
        let rendered = r.text();
        assert_eq!(rendered, "1  2  3\n");
    }
}
