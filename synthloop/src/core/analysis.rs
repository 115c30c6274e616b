//! Per-column hints derived from the reference data for prompt construction.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::{Cell, ColumnKind, Dataset};

const MAX_EXAMPLES: usize = 3;

static DIGIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d").expect("static digit regex"));
static LETTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]").expect("static letter regex"));

/// Observed properties of one reference column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnProfile {
    pub name: String,
    pub kind: ColumnKind,
    pub present: usize,
    pub missing: usize,
    /// First distinct present values, in row order.
    pub examples: Vec<String>,
    /// Digit signature shared by every present value, e.g. `dd-dd-dddd`.
    pub pattern: Option<String>,
}

impl ColumnProfile {
    /// Single bullet line used in the analysis prompt section.
    pub fn describe(&self) -> String {
        let mut line = format!(
            "{} ({}): {} present, {} missing",
            self.name,
            self.kind.as_str(),
            self.present,
            self.missing
        );
        if let Some(pattern) = &self.pattern {
            line.push_str(&format!("; every value looks like `{pattern}`"));
        }
        if !self.examples.is_empty() {
            let quoted: Vec<String> = self.examples.iter().map(|e| format!("{e:?}")).collect();
            line.push_str(&format!("; e.g. {}", quoted.join(", ")));
        }
        line
    }
}

/// Profile every column of the reference.
pub fn analyze(dataset: &Dataset) -> Vec<ColumnProfile> {
    let table = dataset.table();
    table
        .columns()
        .iter()
        .enumerate()
        .map(|(col, name)| {
            let cells: Vec<&Cell> = table.rows().iter().map(|row| &row[col]).collect();
            profile_column(name, dataset.kinds()[col], &cells)
        })
        .collect()
}

fn profile_column(name: &str, kind: ColumnKind, cells: &[&Cell]) -> ColumnProfile {
    let mut present = 0;
    let mut missing = 0;
    let mut seen = BTreeSet::new();
    let mut examples = Vec::new();
    let mut signatures = BTreeSet::new();

    for cell in cells {
        let value = match cell {
            Cell::Missing => {
                missing += 1;
                continue;
            }
            Cell::Text(s) if s.is_empty() => {
                missing += 1;
                continue;
            }
            other => other.render_plain(),
        };
        present += 1;
        if kind == ColumnKind::Text {
            signatures.insert(signature(&value));
        }
        if examples.len() < MAX_EXAMPLES && seen.insert(value.clone()) {
            examples.push(value);
        }
    }

    let pattern = match (signatures.len(), signatures.into_iter().next()) {
        (1, Some(Some(sig))) => Some(sig),
        _ => None,
    };

    ColumnProfile {
        name: name.to_string(),
        kind,
        present,
        missing,
        examples,
        pattern,
    }
}

/// Digit signature for values made of digits and punctuation only.
fn signature(value: &str) -> Option<String> {
    if LETTER_RE.is_match(value) || !DIGIT_RE.is_match(value) {
        return None;
    }
    Some(DIGIT_RE.replace_all(value, "d").into_owned())
}
