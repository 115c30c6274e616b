//! Structured failure descriptions fed back into the next generation request.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::core::types::Shape;

/// One mismatching cell, rendered for prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDiff {
    pub row: usize,
    pub column: String,
    pub got: String,
    pub expected: String,
}

/// Why an attempt did not succeed.
///
/// Created once by the component that detected the failure and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnosis {
    GenerationFailed {
        reason: String,
    },
    GenerationEmpty,
    SyntaxError {
        detail: String,
    },
    RuntimeException {
        detail: String,
    },
    Timeout {
        limit_ms: u64,
    },
    ShapeMismatch {
        got: Shape,
        expected: Shape,
    },
    ColumnMismatch {
        got: Vec<String>,
        expected: Vec<String>,
    },
    ValueMismatch {
        /// Offending row indices (0-based), ascending and unique.
        rows: Vec<usize>,
        mismatched_cells: usize,
        samples: Vec<CellDiff>,
    },
}

impl Diagnosis {
    pub fn kind(&self) -> &'static str {
        match self {
            Diagnosis::GenerationFailed { .. } => "generation_failed",
            Diagnosis::GenerationEmpty => "generation_empty",
            Diagnosis::SyntaxError { .. } => "syntax_error",
            Diagnosis::RuntimeException { .. } => "runtime_exception",
            Diagnosis::Timeout { .. } => "timeout",
            Diagnosis::ShapeMismatch { .. } => "shape_mismatch",
            Diagnosis::ColumnMismatch { .. } => "column_mismatch",
            Diagnosis::ValueMismatch { .. } => "value_mismatch",
        }
    }

    /// One-line summary for terminal output.
    pub fn summary(&self) -> String {
        match self {
            Diagnosis::GenerationFailed { reason } => {
                format!("generation failed: {}", first_line(reason))
            }
            Diagnosis::GenerationEmpty => "response contained no code".to_string(),
            Diagnosis::SyntaxError { detail } => format!("syntax error: {}", first_line(detail)),
            Diagnosis::RuntimeException { detail } => {
                format!("runtime exception: {}", last_line(detail))
            }
            Diagnosis::Timeout { limit_ms } => format!("timed out after {limit_ms}ms"),
            Diagnosis::ShapeMismatch { got, expected } => {
                format!("shape mismatch: got {got}, expected {expected}")
            }
            Diagnosis::ColumnMismatch { got, expected } => {
                format!("column mismatch: got {got:?}, expected {expected:?}")
            }
            Diagnosis::ValueMismatch {
                rows,
                mismatched_cells,
                ..
            } => format!(
                "value mismatch: {mismatched_cells} cells in rows {}",
                format_rows(rows)
            ),
        }
    }

    /// Full rendering embedded verbatim in the next prompt.
    pub fn describe(&self) -> String {
        match self {
            Diagnosis::GenerationFailed { reason } => {
                format!("The generation request failed before any code was produced: {reason}")
            }
            Diagnosis::GenerationEmpty => {
                "The response contained no code. Return the complete program.".to_string()
            }
            Diagnosis::SyntaxError { detail } => {
                format!("The candidate was rejected before execution:\n{}", detail.trim())
            }
            Diagnosis::RuntimeException { detail } => {
                format!("The candidate failed while running:\n{}", detail.trim())
            }
            Diagnosis::Timeout { limit_ms } => format!(
                "The candidate did not finish within {limit_ms}ms and was killed. \
                 Avoid unbounded loops and blocking reads."
            ),
            Diagnosis::ShapeMismatch { got, expected } => {
                format!("Shape mismatch: the result had {got}, the reference has {expected}.")
            }
            Diagnosis::ColumnMismatch { got, expected } => format!(
                "Column mismatch: the result columns were {got:?}, \
                 the reference columns are {expected:?} (names and order must match exactly)."
            ),
            Diagnosis::ValueMismatch {
                rows,
                mismatched_cells,
                samples,
            } => {
                let mut buf = format!(
                    "Value mismatch: {mismatched_cells} cells differ from the reference \
                     in rows {}.",
                    format_rows(rows)
                );
                if !samples.is_empty() {
                    buf.push_str("\nSample differences:");
                    for diff in samples {
                        let _ = write!(
                            buf,
                            "\n- row {}, column {:?}: got {}, expected {}",
                            diff.row, diff.column, diff.got, diff.expected
                        );
                    }
                }
                buf
            }
        }
    }
}

/// Compress sorted row indices into ranges: `[0, 1, 2, 5]` → `0-2, 5`.
pub fn format_rows(rows: &[usize]) -> String {
    let mut parts = Vec::new();
    let mut iter = rows.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(", ")
}

fn first_line(s: &str) -> &str {
    s.trim().lines().next().unwrap_or("")
}

fn last_line(s: &str) -> &str {
    s.trim().lines().last().unwrap_or("")
}
