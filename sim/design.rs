//! # Design Tables
//!
//! A design table holds one simulation scenario per row and one named numeric parameter per
//! column. It is the only way scenario parameters enter the crate: every consumer asks for the
//! columns it needs by name and fails with `missing required column 'X'` when one is absent.
//! Nothing is defaulted.
//!
//! Tables are read from and written to CSV with a header row. Cells must parse as `f64`;
//! `inf` and `nan` spellings are accepted, empty cells are not.

use itertools::Itertools;
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DesignError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column '{0}'")]
    MissingColumn(String),
    #[error("column '{0}' appears more than once")]
    DuplicateColumn(String),
    #[error("row {row}, column '{column}': '{value}' is not a number")]
    InvalidNumber {
        row: usize,
        column: String,
        value: String,
    },
    #[error("row {row} has {found} cells but the header has {expected} columns")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("column '{column}' has invalid value {value}: {reason}")]
    InvalidValue {
        column: String,
        value: f64,
        reason: &'static str,
    },
    #[error("grid parameter '{0}' has no values")]
    EmptyParameter(String),
    #[error("column '{column}' has {found} values but the table has {expected} rows")]
    ColumnLength {
        column: String,
        expected: usize,
        found: usize,
    },
}

/// One scenario: parameter names with their values, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignRow {
    columns: Vec<String>,
    values: Vec<f64>,
}

impl DesignRow {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| self.values[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn require(&self, name: &str) -> Result<f64, DesignError> {
        self.get(name)
            .ok_or_else(|| DesignError::MissingColumn(name.to_string()))
    }

    /// Required finite value `>= 0`.
    pub fn require_non_negative(&self, name: &str) -> Result<f64, DesignError> {
        let value = self.require(name)?;
        if value.is_finite() && value >= 0.0 {
            Ok(value)
        } else {
            Err(invalid(name, value, "must be finite and non-negative"))
        }
    }

    /// Required value `>= 0`, where `inf` is allowed.
    pub fn require_time(&self, name: &str) -> Result<f64, DesignError> {
        let value = self.require(name)?;
        if value >= 0.0 {
            Ok(value)
        } else {
            Err(invalid(name, value, "must be a non-negative time"))
        }
    }

    /// Required value in `[0, 1]`.
    pub fn require_probability(&self, name: &str) -> Result<f64, DesignError> {
        let value = self.require(name)?;
        if (0.0..=1.0).contains(&value) {
            Ok(value)
        } else {
            Err(invalid(name, value, "must lie in [0, 1]"))
        }
    }

    /// Required non-negative whole number, such as an arm size.
    pub fn require_count(&self, name: &str) -> Result<usize, DesignError> {
        let value = self.require_non_negative(name)?;
        if value.fract() != 0.0 || value > u32::MAX as f64 {
            return Err(invalid(name, value, "must be a whole number"));
        }
        Ok(value as usize)
    }

    /// Sets `name`, appending the column when it is new.
    pub fn set(&mut self, name: &str, value: f64) {
        match self.columns.iter().position(|c| c == name) {
            Some(i) => self.values[i] = value,
            None => {
                self.columns.push(name.to_string());
                self.values.push(value);
            }
        }
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.set(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

impl Default for DesignRow {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(column: &str, value: f64, reason: &'static str) -> DesignError {
    DesignError::InvalidValue {
        column: column.to_string(),
        value,
        reason,
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DesignTable {
    columns: Vec<String>,
    rows: Vec<DesignRow>,
}

impl DesignTable {
    /// Builds a table from rows, taking the union of their columns in first-seen order.
    /// Rows lacking a column get `NaN` in that cell of the output.
    pub fn from_rows(rows: Vec<DesignRow>) -> Self {
        Self::from_rows_with_columns(&[], rows)
    }

    /// Like [`DesignTable::from_rows`], but `columns` come first and survive even when `rows` is
    /// empty, so a header-only input is written back with its header.
    pub fn from_rows_with_columns(columns: &[String], rows: Vec<DesignRow>) -> Self {
        let mut columns: Vec<String> = columns.to_vec();
        for row in &rows {
            for name in &row.columns {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[DesignRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<DesignRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&DesignRow> {
        self.rows.get(index)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Fails on the first of `names` that the table lacks.
    pub fn require_columns(&self, names: &[&str]) -> Result<(), DesignError> {
        match names.iter().find(|name| !self.has_column(name)) {
            Some(name) => Err(DesignError::MissingColumn(name.to_string())),
            None => Ok(()),
        }
    }

    /// Adds or overwrites a whole column.
    pub fn set_column(&mut self, name: &str, values: &[f64]) -> Result<(), DesignError> {
        if values.len() != self.rows.len() {
            return Err(DesignError::ColumnLength {
                column: name.to_string(),
                expected: self.rows.len(),
                found: values.len(),
            });
        }
        for (row, &value) in self.rows.iter_mut().zip(values) {
            row.set(name, value);
        }
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
        Ok(())
    }

    pub fn read_csv<R: io::Read>(reader: R) -> Result<Self, DesignError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if let Some(duplicate) = columns.iter().duplicates().next() {
            return Err(DesignError::DuplicateColumn(duplicate.clone()));
        }

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() != columns.len() {
                return Err(DesignError::RaggedRow {
                    row: index,
                    expected: columns.len(),
                    found: record.len(),
                });
            }
            let values = record
                .iter()
                .zip(&columns)
                .map(|(cell, column)| {
                    cell.parse::<f64>().map_err(|_| DesignError::InvalidNumber {
                        row: index,
                        column: column.clone(),
                        value: cell.to_string(),
                    })
                })
                .collect::<Result<Vec<f64>, DesignError>>()?;
            rows.push(DesignRow {
                columns: columns.clone(),
                values,
            });
        }
        Ok(Self { columns, rows })
    }

    pub fn from_path(path: &Path) -> Result<Self, DesignError> {
        Self::read_csv(File::open(path)?)
    }

    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), DesignError> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            let cells = self
                .columns
                .iter()
                .map(|c| format_cell(row.get(c).unwrap_or(f64::NAN)));
            writer.write_record(cells)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_path(&self, path: &Path) -> Result<(), DesignError> {
        self.write_csv(File::create(path)?)
    }
}

fn format_cell(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{value}")
    }
}

/// Explicit factorial design: every combination of the listed parameter values becomes a row,
/// with the first parameter varying slowest.
#[derive(Debug, Clone, Default)]
pub struct DesignGrid {
    parameters: Vec<(String, Vec<f64>)>,
}

impl DesignGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameter(mut self, name: &str, values: &[f64]) -> Self {
        match self.parameters.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = values.to_vec(),
            None => self.parameters.push((name.to_string(), values.to_vec())),
        }
        self
    }

    pub fn build(&self) -> Result<DesignTable, DesignError> {
        if let Some((name, _)) = self.parameters.iter().find(|(_, v)| v.is_empty()) {
            return Err(DesignError::EmptyParameter(name.clone()));
        }
        let columns: Vec<String> = self.parameters.iter().map(|(n, _)| n.clone()).collect();
        if self.parameters.is_empty() {
            return Ok(DesignTable {
                columns,
                rows: Vec::new(),
            });
        }
        let rows = self
            .parameters
            .iter()
            .map(|(_, values)| values.iter().copied())
            .multi_cartesian_product()
            .map(|values| DesignRow {
                columns: columns.clone(),
                values,
            })
            .collect();
        Ok(DesignTable { columns, rows })
    }
}
