//! Session-level tests driving the full generate → execute → compare loop.
//!
//! Candidates are real shell programs run through `sh` (and Python programs
//! when `python3` is installed); only the backend is scripted. Unix-only
//! because the shell runtime needs a POSIX `sh`.
#![cfg(unix)]

use std::ffi::OsStr;
use std::fs;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;
use synthloop::core::diagnosis::Diagnosis;
use synthloop::core::state::{ExecutionStatus, Phase};
use synthloop::io::backend::GenerationFailed;
use synthloop::io::config::RuntimeKind;
use synthloop::io::executor::ProcessExecutor;
use synthloop::io::reference::ReferenceUnavailable;
use synthloop::io::runtime::RuntimeProfile;
use synthloop::io::syntax::CommandSyntaxChecker;
use synthloop::session::{SessionReport, run_session};
use synthloop::test_support::{
    RecordingExecutor, ScriptedBackend, Workspace, csv_text, python_response, result_json,
    shell_candidate, shell_response,
};

const COLUMNS: &[&str] = &["Date", "Description", "Debit Amt", "Credit Amt", "Balance"];
const ROWS: &[&[&str]] = &[
    &["01-08-2024", "Salary Credit", "", "1935.3", "6864.58"],
    &["02-08-2024", "Rent", "1652.61", "", "5211.97"],
    &["03-08-2024", "Coffee", "4.5", "", "5207.47"],
];

fn workspace(max_attempts: u32) -> Workspace {
    let mut ws = Workspace::new("bank", &csv_text(COLUMNS, ROWS));
    ws.config.max_attempts = max_attempts;
    ws
}

fn correct_response() -> String {
    shell_candidate(&result_json(COLUMNS, ROWS))
}

fn response_with(rows: &[&[&str]]) -> String {
    shell_candidate(&result_json(COLUMNS, rows))
}

fn runtime(ws: &Workspace) -> RuntimeProfile {
    RuntimeProfile::from_config(&ws.config.runtime).expect("runtime")
}

/// Run a session with the real syntax checker and executor.
fn run_real(ws: &Workspace, backend: &ScriptedBackend) -> SessionReport {
    let runtime = runtime(ws);
    let checker = CommandSyntaxChecker::new(&runtime, Duration::from_secs(10), 100_000);
    let executor = ProcessExecutor::new(&runtime);
    run_session(&ws.request(), &runtime, backend, &checker, &executor, |_| {}).expect("session")
}

#[test]
fn succeeds_on_third_attempt_after_two_value_mismatches() {
    let ws = workspace(3);
    let backend = ScriptedBackend::replies([
        response_with(&[
            &["01-08-2024", "Salary Credit", "", "1935.3", "6864.50"],
            ROWS[1],
            ROWS[2],
        ]),
        response_with(&[
            ROWS[0],
            ROWS[1],
            &["03-08-2024", "Coffee", "0", "", "5207.47"],
        ]),
        correct_response(),
    ]);

    let report = run_real(&ws, &backend);

    assert!(report.success);
    assert_eq!(report.phase, Phase::Succeeded);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.history.len(), 2);
    match (&report.history[0], &report.history[1]) {
        (
            Diagnosis::ValueMismatch { rows: first, .. },
            Diagnosis::ValueMismatch { rows: second, .. },
        ) => {
            assert_eq!(first, &vec![0]);
            assert_eq!(second, &vec![2]);
        }
        other => panic!("expected two value mismatches, got {other:?}"),
    }

    let promoted = report.promoted.as_ref().expect("promoted parser");
    assert_eq!(promoted, &ws.artifact_dir().join("bank_parser.sh"));
    assert_eq!(
        fs::read_to_string(promoted).expect("read promoted"),
        fs::read_to_string(&report.artifacts[2]).expect("read winner")
    );
    assert_eq!(report.artifacts.len(), 3);
    for (idx, artifact) in report.artifacts.iter().enumerate() {
        assert!(artifact.ends_with(format!("bank_parser_attempt{}.sh", idx + 1)));
        assert!(artifact.is_file());
    }
}

#[test]
fn next_prompt_carries_previous_diagnosis_verbatim() {
    let ws = workspace(3);
    let backend = ScriptedBackend::replies([
        response_with(&[ROWS[0], ROWS[1]]),
        response_with(&[ROWS[0], ROWS[1], &["03-08-2024", "Tea", "4.5", "", "5207.47"]]),
        correct_response(),
    ]);

    let report = run_real(&ws, &backend);
    let prompts = backend.prompts();

    assert_eq!(prompts.len(), 3);
    assert!(matches!(report.history[0], Diagnosis::ShapeMismatch { .. }));
    assert!(prompts[1].contains(&report.history[0].describe()));
    assert!(prompts[2].contains(&report.history[1].describe()));
    assert!(!prompts[0].contains("Shape mismatch"));
}

#[test]
fn empty_generation_never_reaches_the_executor() {
    let ws = workspace(1);
    let runtime = runtime(&ws);
    let backend = ScriptedBackend::replies(["  \n\n"]);
    let checker = CommandSyntaxChecker::new(&runtime, Duration::from_secs(10), 100_000);
    let executor = RecordingExecutor::default();

    let report = run_session(&ws.request(), &runtime, &backend, &checker, &executor, |_| {})
        .expect("session");

    assert!(!report.success);
    assert_eq!(report.phase, Phase::Exhausted);
    assert_eq!(report.history, vec![Diagnosis::GenerationEmpty]);
    assert_eq!(executor.calls(), 0);
    assert!(report.artifacts.is_empty());
}

#[test]
fn syntax_error_is_persisted_but_not_executed() {
    let ws = workspace(1);
    let runtime = runtime(&ws);
    let backend = ScriptedBackend::replies([shell_response(
        "parse() {\n  echo \"unterminated\n}",
    )]);
    let checker = CommandSyntaxChecker::new(&runtime, Duration::from_secs(10), 100_000);
    let executor = RecordingExecutor::default();

    let report = run_session(&ws.request(), &runtime, &backend, &checker, &executor, |_| {})
        .expect("session");

    assert_eq!(executor.calls(), 0);
    assert!(matches!(report.history[0], Diagnosis::SyntaxError { .. }));
    assert_eq!(report.records[0].syntax_valid, Some(false));
    assert_eq!(report.artifacts.len(), 1);
    assert!(report.artifacts[0].is_file());
    assert!(report.promoted.is_none());
}

#[test]
fn exhausts_after_max_attempts() {
    let ws = workspace(3);
    let wrong_columns = shell_candidate(&result_json(
        &["date", "description", "debit", "credit", "balance"],
        ROWS,
    ));
    let backend = ScriptedBackend::replies([
        wrong_columns.clone(),
        wrong_columns.clone(),
        wrong_columns,
    ]);
    let mut seen = Vec::new();

    let runtime = runtime(&ws);
    let checker = CommandSyntaxChecker::new(&runtime, Duration::from_secs(10), 100_000);
    let executor = ProcessExecutor::new(&runtime);
    let report = run_session(&ws.request(), &runtime, &backend, &checker, &executor, |record| {
        seen.push(record.index);
    })
    .expect("session");

    assert!(!report.success);
    assert_eq!(report.phase, Phase::Exhausted);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.history.len(), 3);
    assert!(
        report
            .history
            .iter()
            .all(|d| matches!(d, Diagnosis::ColumnMismatch { .. }))
    );
    assert_eq!(seen, vec![1, 2, 3]);
    assert!(report.promoted.is_none());
    assert!(!ws.artifact_dir().join("bank_parser.sh").exists());

    let summary: Value = serde_json::from_str(
        &fs::read_to_string(report.log_dir.join("session.json")).expect("read summary"),
    )
    .expect("parse summary");
    assert_eq!(summary["success"], false);
    assert_eq!(summary["phase"], "exhausted");
    assert_eq!(summary["history"][2]["kind"], "column_mismatch");
}

#[test]
fn hanging_candidate_times_out_and_session_continues() {
    let ws = workspace(2).with_timeout(Duration::from_secs(1));
    let backend = ScriptedBackend::replies([
        shell_response("parse() {\n  sleep 5\n}"),
        correct_response(),
    ]);

    let report = run_real(&ws, &backend);

    assert!(report.success);
    assert_eq!(report.history, vec![Diagnosis::Timeout { limit_ms: 1000 }]);
    assert_eq!(report.records[0].execution, Some(ExecutionStatus::Timeout));
}

#[test]
fn missing_entry_point_is_a_runtime_exception() {
    let ws = workspace(1);
    let backend = ScriptedBackend::replies([shell_response("helper() {\n  echo '{}'\n}")]);

    let report = run_real(&ws, &backend);

    match &report.history[0] {
        Diagnosis::RuntimeException { detail } => {
            assert!(detail.contains("does not define a parse function"), "{detail}");
        }
        other => panic!("expected runtime exception, got {other:?}"),
    }
    assert_eq!(report.records[0].execution, Some(ExecutionStatus::Exception));
}

#[test]
fn non_conforming_result_is_a_runtime_exception() {
    let ws = workspace(1);
    let backend = ScriptedBackend::replies([shell_response("parse() {\n  echo 'not json'\n}")]);

    let report = run_real(&ws, &backend);

    assert!(matches!(
        report.history[0],
        Diagnosis::RuntimeException { .. }
    ));
}

#[test]
fn generation_failure_consumes_an_attempt() {
    let ws = workspace(2);
    let backend = ScriptedBackend::new([
        Err(GenerationFailed::new("backend returned 429 Too Many Requests")),
        Ok(correct_response()),
    ]);

    let report = run_real(&ws, &backend);

    assert!(report.success);
    assert_eq!(report.attempts, 2);
    assert_eq!(
        report.history,
        vec![Diagnosis::GenerationFailed {
            reason: "backend returned 429 Too Many Requests".to_string()
        }]
    );
    assert_eq!(report.artifacts.len(), 1);
}

#[test]
fn unreadable_reference_aborts_before_generation() {
    let ws = workspace(3);
    fs::remove_file(ws.config.reference_path(ws.root(), "bank")).expect("remove reference");
    let runtime = runtime(&ws);
    let backend = ScriptedBackend::replies([correct_response()]);
    let checker = CommandSyntaxChecker::new(&runtime, Duration::from_secs(10), 100_000);
    let executor = RecordingExecutor::default();

    let err = run_session(&ws.request(), &runtime, &backend, &checker, &executor, |_| {})
        .expect_err("missing reference");

    assert!(err.downcast_ref::<ReferenceUnavailable>().is_some());
    assert!(backend.prompts().is_empty());
    assert_eq!(executor.calls(), 0);
}

#[test]
fn attempt_logs_are_written() {
    let ws = workspace(1);
    let backend = ScriptedBackend::replies([correct_response()]);

    let report = run_real(&ws, &backend);
    let attempt_dir = report.log_dir.join("attempts").join("1");

    for name in [
        "meta.json",
        "prompt.md",
        "response.txt",
        "driver.sh",
        "result.json",
        "executor.log",
    ] {
        assert!(attempt_dir.join(name).is_file(), "missing {name}");
    }
    assert!(!attempt_dir.join("diagnosis.json").exists());

    let meta: Value = serde_json::from_str(
        &fs::read_to_string(attempt_dir.join("meta.json")).expect("read meta"),
    )
    .expect("parse meta");
    assert_eq!(meta["target"], "bank");
    assert_eq!(meta["result"]["outcome"], "exact_match");
    assert_eq!(meta["syntax_valid"], true);
}

#[test]
fn background_job_left_by_candidate_does_not_stall_the_session() {
    let ws = workspace(1);
    let backend = ScriptedBackend::replies([shell_response(&format!(
        "parse() {{\n  sleep 30 >&2 &\n  cat <<'JSON'\n{}\nJSON\n}}",
        result_json(COLUMNS, ROWS)
    ))]);

    let started = Instant::now();
    let report = run_real(&ws, &backend);

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.success, "{:?}", report.history);
}

fn python3_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

fn python_workspace(max_attempts: u32) -> Workspace {
    workspace(max_attempts).with_runtime(RuntimeKind::Python)
}

const PYTHON_DICT_PARSER: &str = r#"import math


def parse(input_path):
    return {
        "columns": ["Date", "Description", "Debit Amt", "Credit Amt", "Balance"],
        "rows": [
            ["01-08-2024", "Salary Credit", None, 1935.3, 6864.58],
            ["02-08-2024", "Rent", 1652.61, math.nan, 5211.97],
            ["03-08-2024", "Coffee", 4.5, None, 5207.47],
        ],
    }"#;

#[test]
fn python_candidate_failures_are_diagnosed_until_a_dict_result_matches() {
    if !python3_available() {
        return;
    }
    let ws = python_workspace(5);
    let backend = ScriptedBackend::replies([
        python_response("def parse(input_path):\n    raise ValueError(\"boom\")"),
        python_response("def helper(input_path):\n    return {}"),
        python_response("def parse(input_path):\n    return None"),
        python_response("def parse(input_path)\n    return {}"),
        python_response(PYTHON_DICT_PARSER),
    ]);

    let report = run_real(&ws, &backend);

    assert!(report.success, "{:?}", report.history);
    assert_eq!(report.attempts, 5);
    let kinds: Vec<_> = report.history.iter().map(Diagnosis::kind).collect();
    assert_eq!(
        kinds,
        vec![
            "runtime_exception",
            "runtime_exception",
            "runtime_exception",
            "syntax_error"
        ]
    );
    let details: Vec<String> = report.history[..3]
        .iter()
        .map(|diagnosis| match diagnosis {
            Diagnosis::RuntimeException { detail } => detail.clone(),
            other => panic!("expected runtime exception, got {other:?}"),
        })
        .collect();
    assert!(details[0].contains("ValueError: boom"), "{}", details[0]);
    assert!(details[1].contains("does not define a callable parse()"), "{}", details[1]);
    assert!(details[2].contains("parse() returned None"), "{}", details[2]);

    assert_eq!(report.records[3].syntax_valid, Some(false));
    assert_eq!(report.records[3].execution, None);
    assert_eq!(
        report.promoted.as_ref().and_then(|p| p.extension()),
        Some(OsStr::new("py"))
    );
}

#[test]
fn python_frame_like_result_with_scalar_items_matches() {
    if !python3_available() {
        return;
    }
    let ws = python_workspace(1);
    let backend = ScriptedBackend::replies([python_response(
        r#"class Scalar:
    def __init__(self, value):
        self.value = value

    def item(self):
        return self.value


class Frame:
    columns = ["Date", "Description", "Debit Amt", "Credit Amt", "Balance"]

    def itertuples(self, index=False, name=None):
        return iter([
            ("01-08-2024", "Salary Credit", None, Scalar(1935.3), Scalar(6864.58)),
            ("02-08-2024", "Rent", Scalar(1652.61), float("nan"), Scalar(5211.97)),
            ("03-08-2024", "Coffee", Scalar(4.5), None, Scalar(5207.47)),
        ])


def parse(input_path):
    return Frame()"#,
    )]);

    let report = run_real(&ws, &backend);

    assert!(report.success, "{:?}", report.history);
    assert_eq!(report.records[0].execution, Some(ExecutionStatus::Success));
}
