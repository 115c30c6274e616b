//! Isolated execution of candidate programs.
//!
//! The [`CandidateExecutor`] trait decouples the session loop from the actual
//! child-process runner. Tests use scripted executors that return predetermined
//! outcomes without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Cell, Table};
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::runtime::RuntimeProfile;

const RESULT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/candidate_result/v1.schema.json"
));

/// Lines of stderr kept as the exception detail.
const DETAIL_TAIL_LINES: usize = 30;

static RESULT_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(RESULT_SCHEMA).map_err(|e| e.to_string())?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| e.to_string())
});

/// Parameters for one candidate execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Persisted candidate artifact.
    pub candidate: PathBuf,
    /// Task input passed to the entry point.
    pub input: PathBuf,
    /// Working directory of the child process.
    pub workdir: PathBuf,
    /// Directory for the driver, result file and executor log.
    pub attempt_dir: PathBuf,
    pub timeout: Duration,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl ExecRequest {
    pub fn result_path(&self) -> PathBuf {
        self.attempt_dir.join("result.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.attempt_dir.join("executor.log")
    }
}

/// How a candidate run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(Table),
    Exception { detail: String },
    TimedOut { limit: Duration },
}

/// Abstraction over candidate execution backends.
pub trait CandidateExecutor {
    /// Run the candidate. `Err` means the executor itself failed (the
    /// interpreter could not be spawned, the attempt directory is not
    /// writable); anything the candidate does wrong is an outcome.
    fn execute(&self, request: &ExecRequest) -> Result<ExecutionOutcome>;
}

/// Executor that runs the runtime's driver in a child process.
pub struct ProcessExecutor<'a> {
    runtime: &'a RuntimeProfile,
}

impl<'a> ProcessExecutor<'a> {
    pub fn new(runtime: &'a RuntimeProfile) -> Self {
        Self { runtime }
    }
}

impl CandidateExecutor for ProcessExecutor<'_> {
    #[instrument(skip_all, fields(candidate = %request.candidate.display(), timeout_ms = request.timeout.as_millis() as u64))]
    fn execute(&self, request: &ExecRequest) -> Result<ExecutionOutcome> {
        fs::create_dir_all(&request.attempt_dir)
            .with_context(|| format!("create attempt dir {}", request.attempt_dir.display()))?;

        let driver = request
            .attempt_dir
            .join(format!("driver.{}", self.runtime.extension()));
        fs::write(&driver, self.runtime.render_driver()?)
            .with_context(|| format!("write driver {}", driver.display()))?;

        let result_path = request.result_path();
        let mut cmd = self.runtime.driver_command(
            &absolute(&driver)?,
            &absolute(&request.candidate)?,
            &absolute(&request.input)?,
            &absolute(&result_path)?,
        )?;
        cmd.current_dir(&request.workdir);

        info!("running candidate");
        let output = run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
            .context("run candidate driver")?;
        write_executor_log(&request.log_path(), &output, request.output_limit_bytes)?;

        if output.timed_out {
            warn!("candidate timed out");
            return Ok(ExecutionOutcome::TimedOut {
                limit: request.timeout,
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "candidate failed");
            return Ok(ExecutionOutcome::Exception {
                detail: failure_detail(&output),
            });
        }

        if !result_path.is_file() {
            return Ok(ExecutionOutcome::Exception {
                detail: "the candidate finished without producing a result".to_string(),
            });
        }
        let raw = fs::read_to_string(&result_path)
            .with_context(|| format!("read candidate result {}", result_path.display()))?;
        match decode_result(&raw) {
            Ok(table) => {
                debug!(shape = %table.shape(), "candidate completed");
                Ok(ExecutionOutcome::Completed(table))
            }
            Err(err) => Ok(ExecutionOutcome::Exception {
                detail: format!("the candidate returned a non-conforming result: {err:#}"),
            }),
        }
    }
}

/// Decode a driver result file into a table.
///
/// `null` is the missing sentinel and booleans are kept as text.
pub fn decode_result(raw: &str) -> Result<Table> {
    let value: Value = serde_json::from_str(raw).context("parse result json")?;
    let validator = RESULT_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid result schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "result schema validation failed: {}",
            messages.join("; ")
        ));
    }

    let columns = value["columns"]
        .as_array()
        .map(|cols| {
            cols.iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let rows = value["rows"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(json_cell).collect())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();
    Table::new(columns, rows)
}

fn json_cell(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Missing,
        Value::Bool(b) => Cell::Text(b.to_string()),
        Value::Number(n) => n.as_f64().map_or(Cell::Missing, Cell::Number),
        Value::String(s) => Cell::Text(s.clone()),
        other => Cell::Text(other.to_string()),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolve path {}", path.display()))
}

fn failure_detail(output: &CommandOutput) -> String {
    let stderr = output.stderr_lossy();
    let tail = tail_lines(stderr.trim_end(), DETAIL_TAIL_LINES);
    if tail.is_empty() {
        format!("the candidate exited with status {:?}", output.status.code())
    } else {
        tail.to_string()
    }
}

fn tail_lines(text: &str, max_lines: usize) -> &str {
    match text.rmatch_indices('\n').nth(max_lines.saturating_sub(1)) {
        Some((idx, _)) => &text[idx + 1..],
        None => text,
    }
}

fn write_executor_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_lossy());
    buf.push_str(&output.stdout_truncated_notice("candidate"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_lossy());
    buf.push_str(&output.stderr_truncated_notice("candidate"));
    if output.timed_out {
        buf.push_str("\n[candidate timed out]\n");
    }
    if let Some(code) = output.status.code() {
        buf.push_str(&format!("\n[exit status {code}]\n"));
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        return fs::write(path, truncated)
            .with_context(|| format!("write executor log {}", path.display()));
    }

    fs::write(path, buf).with_context(|| format!("write executor log {}", path.display()))
}
