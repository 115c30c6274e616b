//! Test-only fakes and builders for sessions.

use std::cell::{Cell as Counter, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::types::{Cell, Table};
use crate::io::backend::{Backend, GenerationFailed, GenerationRequest};
use crate::io::config::{BackendKind, RuntimeKind, SynthConfig};
use crate::io::executor::{CandidateExecutor, ExecRequest, ExecutionOutcome};
use crate::session::SessionRequest;

/// Backend that replays a fixed script and records every prompt it receives.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: RefCell<VecDeque<Result<String, GenerationFailed>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(script: impl IntoIterator<Item = Result<String, GenerationFailed>>) -> Self {
        Self {
            script: RefCell::new(script.into_iter().collect()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Backend that always answers with the given responses, in order.
    pub fn replies<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self::new(replies.into_iter().map(|reply| Ok(reply.into())))
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Backend for ScriptedBackend {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationFailed> {
        self.prompts.borrow_mut().push(request.prompt.to_string());
        self.script
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationFailed::new("script exhausted")))
    }
}

/// Executor that returns scripted outcomes and records requests.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    outcomes: RefCell<VecDeque<ExecutionOutcome>>,
    requests: RefCell<Vec<ExecRequest>>,
    calls: Counter<usize>,
}

impl RecordingExecutor {
    pub fn new(outcomes: impl IntoIterator<Item = ExecutionOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.borrow().clone()
    }
}

impl CandidateExecutor for RecordingExecutor {
    fn execute(&self, request: &ExecRequest) -> Result<ExecutionOutcome> {
        self.calls.set(self.calls.get() + 1);
        self.requests.borrow_mut().push(request.clone());
        Ok(self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| ExecutionOutcome::Exception {
                detail: "no scripted outcome".to_string(),
            }))
    }
}

/// Build a table from string cells; empty strings become missing values.
pub fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
    Table::new(
        columns.iter().map(|c| c.to_string()).collect(),
        rows.iter()
            .map(|row| {
                row.iter()
                    .map(|cell| {
                        if cell.is_empty() {
                            Cell::Missing
                        } else {
                            Cell::Text(cell.to_string())
                        }
                    })
                    .collect()
            })
            .collect(),
    )
    .expect("rectangular table")
}

/// Render a table as CSV with a header row. Cells must not need quoting.
pub fn csv_text(columns: &[&str], rows: &[&[&str]]) -> String {
    let mut out = columns.join(",");
    out.push('\n');
    for row in rows {
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// JSON result document as a candidate driver writes it. Empty strings become `null`.
pub fn result_json(columns: &[&str], rows: &[&[&str]]) -> Value {
    let rows: Vec<Value> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| {
                    if cell.is_empty() {
                        Value::Null
                    } else {
                        Value::String(cell.to_string())
                    }
                })
                .collect()
        })
        .collect();
    json!({ "columns": columns, "rows": rows })
}

/// A backend response containing a shell candidate that prints `result`.
pub fn shell_candidate(result: &Value) -> String {
    shell_response(&format!(
        "parse() {{\n  cat <<'JSON'\n{result}\nJSON\n}}"
    ))
}

/// Wrap shell code in a fenced response with some prose around it.
pub fn shell_response(code: &str) -> String {
    fenced_response("sh", code)
}

/// Wrap Python code in a fenced response with some prose around it.
pub fn python_response(code: &str) -> String {
    fenced_response("python", code)
}

fn fenced_response(tag: &str, code: &str) -> String {
    format!("Here is the parser.\n\n```{tag}\n{code}\n```\n\nIt returns the table.\n")
}

/// A temporary working root with a reference CSV and a sample input for `target`.
pub struct Workspace {
    pub dir: TempDir,
    pub config: SynthConfig,
    pub target: String,
}

impl Workspace {
    /// Shell runtime, short timeouts, and `reference_csv` written to the configured path.
    pub fn new(target: &str, reference_csv: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = SynthConfig::default();
        config.runtime.kind = RuntimeKind::Shell;
        config.backend.kind = BackendKind::Command;
        config.backend.command = vec!["cat".to_string()];
        config.execution_timeout_secs = 10;
        config.syntax_check_timeout_secs = 10;

        let input = config.input_path(dir.path(), target);
        fs::create_dir_all(input.parent().expect("input parent")).expect("create data dir");
        fs::write(&input, "sample statement\n").expect("write input");
        fs::write(config.reference_path(dir.path(), target), reference_csv)
            .expect("write reference");

        Self {
            dir,
            config,
            target: target.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn request(&self) -> SessionRequest {
        SessionRequest::from_config(self.root(), &self.target, &self.config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.execution_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_runtime(mut self, kind: RuntimeKind) -> Self {
        self.config.runtime.kind = kind;
        self
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.config.artifact_root(self.root())
    }
}
