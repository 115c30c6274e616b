//! Layered comparison of a candidate result against the reference dataset.
//!
//! Layers run in order and short-circuit: shape, then column identity, then
//! cell values. The comparator is pure, so re-running it on the same inputs
//! always yields the same verdict.

use std::collections::BTreeSet;

use crate::core::diagnosis::{CellDiff, Diagnosis};
use crate::core::types::{Cell, ColumnKind, Dataset, Numeric, Table, coerce_numeric};

/// Outcome of comparing a candidate table with the reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch(Diagnosis),
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }
}

/// Compare `candidate` with `reference`, keeping at most `sample_limit` cell diffs.
pub fn compare(candidate: &Table, reference: &Dataset, sample_limit: usize) -> Verdict {
    let expected = reference.table();

    if candidate.shape() != expected.shape() {
        return Verdict::Mismatch(Diagnosis::ShapeMismatch {
            got: candidate.shape(),
            expected: expected.shape(),
        });
    }

    if candidate.columns() != expected.columns() {
        return Verdict::Mismatch(Diagnosis::ColumnMismatch {
            got: candidate.columns().to_vec(),
            expected: expected.columns().to_vec(),
        });
    }

    let mut rows = BTreeSet::new();
    let mut mismatched_cells = 0usize;
    let mut samples = Vec::new();

    for (row_idx, (got_row, expected_row)) in
        candidate.rows().iter().zip(expected.rows()).enumerate()
    {
        for (col_idx, (got, want)) in got_row.iter().zip(expected_row).enumerate() {
            if cells_match(reference.kinds()[col_idx], got, want) {
                continue;
            }
            rows.insert(row_idx);
            mismatched_cells += 1;
            if samples.len() < sample_limit {
                samples.push(CellDiff {
                    row: row_idx,
                    column: expected.columns()[col_idx].clone(),
                    got: got.render(),
                    expected: want.render(),
                });
            }
        }
    }

    if mismatched_cells == 0 {
        return Verdict::Match;
    }
    Verdict::Mismatch(Diagnosis::ValueMismatch {
        rows: rows.into_iter().collect(),
        mismatched_cells,
        samples,
    })
}

fn cells_match(kind: ColumnKind, got: &Cell, want: &Cell) -> bool {
    match kind {
        ColumnKind::Numeric => match (coerce_numeric(got), coerce_numeric(want)) {
            (Numeric::Missing, Numeric::Missing) => true,
            (Numeric::Value(a), Numeric::Value(b)) => a == b,
            _ => false,
        },
        ColumnKind::Text => match (got, want) {
            (Cell::Missing, Cell::Missing) => true,
            (Cell::Text(a), Cell::Text(b)) => a == b,
            _ => false,
        },
    }
}
