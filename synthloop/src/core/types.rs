//! Shared tabular types for reference data and candidate results.
//!
//! These types define stable contracts between core components. They do not
//! depend on external state or I/O.

use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// A single table cell.
///
/// `Missing` is the absent-value sentinel: it is never equal to zero or to an
/// empty string, only to another `Missing` at the same position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Missing,
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    /// Render for diagnostics. Text is quoted so whitespace differences stay visible.
    pub fn render(&self) -> String {
        match self {
            Cell::Missing => "<missing>".to_string(),
            Cell::Number(n) => n.to_string(),
            Cell::Text(s) => format!("{s:?}"),
        }
    }

    /// Render for prompt tables, without quoting.
    pub fn render_plain(&self) -> String {
        match self {
            Cell::Missing => String::new(),
            Cell::Number(n) => n.to_string(),
            Cell::Text(s) => s.clone(),
        }
    }
}

/// Row and column counts of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub columns: usize,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rows x {} columns", self.rows, self.columns)
    }
}

/// Ordered named columns and ordered rows. Every row has one cell per column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                bail!(
                    "row {idx} has {} cells but there are {} columns",
                    row.len(),
                    columns.len()
                );
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn shape(&self) -> Shape {
        Shape {
            rows: self.rows.len(),
            columns: self.columns.len(),
        }
    }
}

/// Comparison kind of a reference column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Numeric,
    Text,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Text => "text",
        }
    }
}

/// Canonical numeric reading of a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Missing,
    Value(f64),
    /// Present but not a number.
    Invalid,
}

/// Coerce a cell to its canonical numeric form.
///
/// Strings are trimmed and parsed as `f64`; empty strings and `NaN` readings
/// collapse into the missing sentinel.
pub fn coerce_numeric(cell: &Cell) -> Numeric {
    match cell {
        Cell::Missing => Numeric::Missing,
        Cell::Number(n) if n.is_nan() => Numeric::Missing,
        Cell::Number(n) => Numeric::Value(*n),
        Cell::Text(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Numeric::Missing;
            }
            match trimmed.parse::<f64>() {
                Ok(n) if n.is_nan() => Numeric::Missing,
                Ok(n) => Numeric::Value(n),
                Err(_) => Numeric::Invalid,
            }
        }
    }
}

/// Schema summary used for prompt construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    pub columns: Vec<String>,
    pub kinds: Vec<ColumnKind>,
    pub row_count: usize,
    /// Leading rows rendered as plain strings.
    pub sample: Vec<Vec<String>>,
}

/// The reference dataset: a table plus the inferred kind of each column.
///
/// Numeric columns hold `Number`/`Missing` cells only after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    table: Table,
    kinds: Vec<ColumnKind>,
}

impl Dataset {
    /// Infer column kinds and canonicalize numeric columns.
    ///
    /// A column is numeric when it has at least one present value and every
    /// present value coerces to a number.
    pub fn from_table(table: Table) -> Self {
        let width = table.columns.len();
        let kinds: Vec<ColumnKind> = (0..width)
            .map(|col| infer_kind(table.rows.iter().map(|row| &row[col])))
            .collect();

        let rows = table
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&kinds)
                    .map(|(cell, kind)| match (kind, coerce_numeric(&cell)) {
                        (ColumnKind::Numeric, Numeric::Value(n)) => Cell::Number(n),
                        (ColumnKind::Numeric, _) => Cell::Missing,
                        (ColumnKind::Text, _) => cell,
                    })
                    .collect()
            })
            .collect();

        Self {
            table: Table {
                columns: table.columns,
                rows,
            },
            kinds,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn kinds(&self) -> &[ColumnKind] {
        &self.kinds
    }

    pub fn schema(&self, sample_rows: usize) -> Schema {
        Schema {
            columns: self.table.columns.clone(),
            kinds: self.kinds.clone(),
            row_count: self.table.rows.len(),
            sample: self
                .table
                .rows
                .iter()
                .take(sample_rows)
                .map(|row| row.iter().map(Cell::render_plain).collect())
                .collect(),
        }
    }
}

fn infer_kind<'a>(cells: impl Iterator<Item = &'a Cell>) -> ColumnKind {
    let mut present = 0usize;
    for cell in cells {
        match coerce_numeric(cell) {
            Numeric::Missing => {}
            Numeric::Value(_) => present += 1,
            Numeric::Invalid => return ColumnKind::Text,
        }
    }
    if present == 0 {
        ColumnKind::Text
    } else {
        ColumnKind::Numeric
    }
}
