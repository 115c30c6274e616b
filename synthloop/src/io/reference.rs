//! Reference dataset loading.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use tracing::{debug, instrument};

use crate::core::types::{Cell, Dataset, Table};

/// The reference could not be read or parsed. Fatal for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceUnavailable {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for ReferenceUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reference unavailable at {}: {}",
            self.path.display(),
            self.reason
        )
    }
}

impl std::error::Error for ReferenceUnavailable {}

/// Load a CSV reference with a header row. Empty fields are missing values.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_reference(path: &Path) -> Result<Dataset> {
    let table = read_csv(path).map_err(|err| {
        anyhow!(ReferenceUnavailable {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        })
    })?;
    let dataset = Dataset::from_table(table);
    debug!(shape = %dataset.table().shape(), "loaded reference");
    Ok(dataset)
}

fn read_csv(path: &Path) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        bail!("missing header row");
    }
    let mut seen = HashSet::new();
    let mut columns = Vec::with_capacity(headers.len());
    for (idx, name) in headers.iter().enumerate() {
        let name = name.trim_start_matches('\u{feff}');
        if name.trim().is_empty() {
            bail!("column {idx} has an empty name");
        }
        if !seen.insert(name.to_string()) {
            bail!("duplicate column name {name:?}");
        }
        columns.push(name.to_string());
    }

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != columns.len() {
            bail!(
                "row {idx} has {} fields but the header has {}",
                record.len(),
                columns.len()
            );
        }
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        Cell::Missing
                    } else {
                        Cell::Text(field.to_string())
                    }
                })
                .collect(),
        );
    }

    Table::new(columns, rows)
}
