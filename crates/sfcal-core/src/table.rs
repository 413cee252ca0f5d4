//! Small labeled table used for extracted survival fractions, channel maps
//! and the aggregated results.
//!
//! Rows carry a string label (the index) which is not required to be unique:
//! concatenating per-run tables repeats channel labels across runs. Cells are
//! `serde_json::Value`s so numeric, string and null entries share one column
//! type.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("column not found: {0}")]
    MissingColumn(String),
    #[error("row '{label}' has {found} values, table has {expected} columns")]
    RowWidth {
        label: String,
        expected: usize,
        found: usize,
    },
    #[error("column '{column}' holds {value}, which cannot be used as an index label")]
    InvalidIndexValue { column: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    index_name: String,
    index: Vec<String>,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            ..Self::default()
        }
    }

    pub fn with_columns<I, S>(index_name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new(index_name);
        for column in columns {
            table.ensure_column(&column.into());
        }
        table
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn index(&self) -> &[String] {
        &self.index
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_position(name).is_some()
    }

    fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn row_position(&self, label: &str) -> Option<usize> {
        self.index.iter().position(|l| l == label)
    }

    /// Adds a null-filled column unless it already exists; returns its position.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(pos) = self.column_position(name) {
            return pos;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(Value::Null);
        }
        self.columns.len() - 1
    }

    /// Adds a null-filled row unless the label already exists; returns the
    /// position of the first row carrying the label.
    pub fn ensure_row(&mut self, label: &str) -> usize {
        if let Some(pos) = self.row_position(label) {
            return pos;
        }
        self.index.push(label.to_string());
        self.rows.push(vec![Value::Null; self.columns.len()]);
        self.rows.len() - 1
    }

    /// Sets a single cell, creating the row and the column when missing.
    pub fn set(&mut self, label: &str, column: &str, value: Value) {
        let col = self.ensure_column(column);
        let row = self.ensure_row(label);
        self.rows[row][col] = value;
    }

    pub fn push_row(&mut self, label: impl Into<String>, values: Vec<Value>) -> Result<(), TableError> {
        let label = label.into();
        if values.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                label,
                expected: self.columns.len(),
                found: values.len(),
            });
        }
        self.index.push(label);
        self.rows.push(values);
        Ok(())
    }

    /// Cell of the first row carrying `label`.
    pub fn get(&self, label: &str, column: &str) -> Option<&Value> {
        let row = self.row_position(label)?;
        self.cell(row, column)
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let col = self.column_position(column)?;
        self.rows.get(row).map(|r| &r[col])
    }

    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let col = self.column_position(name)?;
        Some(self.rows.iter().map(|r| &r[col]).collect())
    }

    pub fn rows(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.index
            .iter()
            .map(String::as_str)
            .zip(self.rows.iter().map(Vec::as_slice))
    }

    /// Sets `column` to `value` on every row.
    pub fn with_constant(mut self, column: &str, value: Value) -> Self {
        let col = self.ensure_column(column);
        for row in &mut self.rows {
            row[col] = value.clone();
        }
        self
    }

    /// Moves `column` into the index, mapping every cell through `key`.
    pub fn set_index<F>(self, column: &str, mut key: F) -> Result<Self, TableError>
    where
        F: FnMut(&Value) -> Option<String>,
    {
        let col = self
            .column_position(column)
            .ok_or_else(|| TableError::MissingColumn(column.to_string()))?;
        let mut out = Self::new(column);
        out.columns = self
            .columns
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != col)
            .map(|(_, c)| c.clone())
            .collect();
        for mut row in self.rows {
            let raw = row.remove(col);
            let label = key(&raw).ok_or_else(|| TableError::InvalidIndexValue {
                column: column.to_string(),
                value: raw.to_string(),
            })?;
            out.index.push(label);
            out.rows.push(row);
        }
        Ok(out)
    }

    /// Appends `columns` of `other`, aligned on index labels. Every row of
    /// `self` is kept; labels missing from `other` get nulls and rows only
    /// present in `other` are ignored.
    pub fn left_join<S: AsRef<str>>(mut self, other: &Table, columns: &[S]) -> Result<Self, TableError> {
        let mut lookup: HashMap<&str, usize> = HashMap::new();
        for (pos, label) in other.index.iter().enumerate() {
            lookup.entry(label.as_str()).or_insert(pos);
        }
        for column in columns {
            let column = column.as_ref();
            let src = other
                .column_position(column)
                .ok_or_else(|| TableError::MissingColumn(column.to_string()))?;
            let dst = self.ensure_column(column);
            for (label, row) in self.index.iter().zip(self.rows.iter_mut()) {
                row[dst] = lookup
                    .get(label.as_str())
                    .map(|&pos| other.rows[pos][src].clone())
                    .unwrap_or(Value::Null);
            }
        }
        Ok(self)
    }

    /// Row-wise union. Columns are the union of all inputs in order of first
    /// appearance; cells a table lacks are null. Index labels are kept as-is.
    pub fn concat<I>(tables: I) -> Self
    where
        I: IntoIterator<Item = Table>,
    {
        let mut out = Self::default();
        for table in tables {
            if out.index_name.is_empty() {
                out.index_name = table.index_name.clone();
            }
            let positions: Vec<usize> = table
                .columns
                .iter()
                .map(|c| out.ensure_column(c))
                .collect();
            for (label, row) in table.index.into_iter().zip(table.rows) {
                let mut values = vec![Value::Null; out.columns.len()];
                for (value, &pos) in row.into_iter().zip(&positions) {
                    values[pos] = value;
                }
                out.index.push(label);
                out.rows.push(values);
            }
        }
        out
    }

    /// One JSON object per row, index label first.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows()
            .map(|(label, values)| {
                let mut record = Map::new();
                record.insert(self.index_name.clone(), Value::String(label.to_string()));
                for (column, value) in self.columns.iter().zip(values) {
                    record.insert(column.clone(), value.clone());
                }
                Value::Object(record)
            })
            .collect()
    }
}

/// Renders a cell the way it is printed and written to CSV: strings bare,
/// nulls empty.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let display = |v: &Value| match v {
            Value::Null => "null".to_string(),
            other => cell_text(other),
        };
        let mut widths: Vec<usize> = self.columns.iter().map(String::len).collect();
        let mut label_width = self.index_name.len();
        for (label, values) in self.rows() {
            label_width = label_width.max(label.len());
            for (w, v) in widths.iter_mut().zip(values) {
                *w = (*w).max(display(v).len());
            }
        }
        write!(f, "{:<label_width$}", self.index_name)?;
        for (column, w) in self.columns.iter().zip(&widths) {
            write!(f, "  {:>w$}", column, w = *w)?;
        }
        writeln!(f)?;
        for (label, values) in self.rows() {
            write!(f, "{:<label_width$}", label)?;
            for (v, w) in values.iter().zip(&widths) {
                write!(f, "  {:>w$}", display(v), w = *w)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
