//! Orchestration of a synthesis session: the generate → persist → execute →
//! compare → diagnose → retry loop.
//!
//! Candidate failures become diagnoses and the loop moves on. Infrastructure
//! failures (unreadable reference, spawn errors, disk errors) abort the session
//! with an error; the attempt in flight is logged to `error.log`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::analysis::{ColumnProfile, analyze};
use crate::core::compare::{Verdict, compare};
use crate::core::diagnosis::Diagnosis;
use crate::core::extract::{Extraction, extract_code};
use crate::core::prompt::{OutputContract, PromptBuilder, PromptInputs, PromptPack};
use crate::core::state::{
    AttemptRecord, AttemptResult, ExecutionStatus, Phase, Session, SessionParams,
};
use crate::core::types::{Dataset, Schema};
use crate::io::artifacts::ArtifactStore;
use crate::io::attempt_log::{
    AttemptMeta, AttemptPaths, AttemptWriteRequest, SessionPaths, write_attempt, write_error,
    write_summary,
};
use crate::io::backend::{Backend, GenerationRequest};
use crate::io::config::{SynthConfig, validate_target};
use crate::io::executor::{CandidateExecutor, ExecRequest, ExecutionOutcome};
use crate::io::reference::load_reference;
use crate::io::runtime::RuntimeProfile;
use crate::io::syntax::{SyntaxChecker, SyntaxVerdict};

/// Knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_attempts: u32,
    pub execution_timeout: Duration,
    pub output_limit_bytes: usize,
    pub prompt_budget_bytes: usize,
    pub history_window: usize,
    pub sample_rows: usize,
    pub mismatch_sample_limit: usize,
    pub planning: bool,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub description: String,
    pub notes: Vec<String>,
}

impl SessionSettings {
    pub fn from_config(cfg: &SynthConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            execution_timeout: Duration::from_secs(cfg.execution_timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            prompt_budget_bytes: cfg.prompt_budget_bytes,
            history_window: cfg.history_window,
            sample_rows: cfg.sample_rows,
            mismatch_sample_limit: cfg.mismatch_sample_limit,
            planning: cfg.planning,
            max_output_tokens: cfg.backend.max_output_tokens,
            temperature: cfg.backend.temperature,
            description: cfg.task.description.clone(),
            notes: cfg.task.notes.clone(),
        }
    }
}

/// Where a session reads from and writes to.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Working root; logs go under `<root>/.synth/`.
    pub root: PathBuf,
    pub target: String,
    pub input: PathBuf,
    pub reference: PathBuf,
    pub artifact_dir: PathBuf,
    pub settings: SessionSettings,
}

impl SessionRequest {
    /// Resolve paths for `target` from the config patterns.
    pub fn from_config(root: &Path, target: &str, cfg: &SynthConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            target: target.to_string(),
            input: cfg.input_path(root, target),
            reference: cfg.reference_path(root, target),
            artifact_dir: cfg.artifact_root(root),
            settings: SessionSettings::from_config(cfg),
        }
    }
}

/// Final result of a session, also persisted as `session.json`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub target: String,
    pub success: bool,
    pub phase: Phase,
    pub attempts: u32,
    pub max_attempts: u32,
    pub history: Vec<Diagnosis>,
    pub records: Vec<AttemptRecord>,
    /// Persisted artifacts, in attempt order.
    pub artifacts: Vec<PathBuf>,
    /// Stable parser path, set only on success.
    pub promoted: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub started_at: String,
    pub ended_at: String,
}

/// Everything an attempt reads but never changes.
struct AttemptEnv<'a, B: ?Sized, C, X> {
    request: &'a SessionRequest,
    runtime: &'a RuntimeProfile,
    backend: &'a B,
    checker: &'a C,
    executor: &'a X,
    store: &'a ArtifactStore,
    builder: &'a PromptBuilder,
    dataset: &'a Dataset,
    schema: &'a Schema,
    analysis: &'a [ColumnProfile],
    contract: &'a OutputContract,
}

/// What an attempt produced along the way, for the record and the log.
#[derive(Debug, Default)]
struct AttemptTrace {
    plan: Option<String>,
    prompt: Option<PromptPack>,
    response: Option<String>,
    code: Option<String>,
    artifact: Option<PathBuf>,
    code_sha256: Option<String>,
    syntax_valid: Option<bool>,
    syntax_log: Option<String>,
    execution: Option<ExecutionStatus>,
}

/// Run attempts until one matches the reference or the ceiling is reached.
///
/// `on_attempt` is called after every completed attempt.
#[instrument(skip_all, fields(target_id = %request.target))]
pub fn run_session<B, C, X, F>(
    request: &SessionRequest,
    runtime: &RuntimeProfile,
    backend: &B,
    checker: &C,
    executor: &X,
    mut on_attempt: F,
) -> Result<SessionReport>
where
    B: Backend + ?Sized,
    C: SyntaxChecker,
    X: CandidateExecutor,
    F: FnMut(&AttemptRecord),
{
    validate_target(&request.target)?;
    let settings = &request.settings;
    let started_at = Utc::now();

    let dataset = load_reference(&request.reference)?;
    let schema = dataset.schema(settings.sample_rows);
    let analysis = analyze(&dataset);
    let contract = runtime.contract();

    let session_id = new_session_id(&request.target);
    let mut session = Session::new(SessionParams {
        id: session_id.clone(),
        target: request.target.clone(),
        input: request.input.clone(),
        reference: request.reference.clone(),
        artifact_dir: request.artifact_dir.clone(),
        max_attempts: settings.max_attempts,
    });
    let store = ArtifactStore::new(
        &request.artifact_dir,
        &session_id,
        &request.target,
        runtime.extension(),
    );
    let session_paths = SessionPaths::new(&request.root, &session_id);
    let builder = PromptBuilder::new(settings.prompt_budget_bytes, settings.history_window);
    let env = AttemptEnv {
        request,
        runtime,
        backend,
        checker,
        executor,
        store: &store,
        builder: &builder,
        dataset: &dataset,
        schema: &schema,
        analysis: &analysis,
        contract: &contract,
    };
    info!(%session_id, shape = %dataset.table().shape(), "session started");

    while session.can_begin() {
        let index = session.begin_attempt()?;
        let paths = session_paths.attempt(index);
        paths.create()?;
        let attempt_started = Utc::now();
        let clock = Instant::now();
        let mut trace = AttemptTrace::default();

        let result = match run_attempt(&env, &mut session, index, &paths, &mut trace) {
            Ok(result) => result,
            Err(err) => {
                if let Err(log_err) = write_error(&paths, &format!("{err:#}\n")) {
                    warn!(err = %log_err, "failed to write error log");
                }
                return Err(err.context(format!("attempt {index} aborted")));
            }
        };

        let record = AttemptRecord {
            index,
            raw_response: trace.response.clone(),
            code: trace.code.take(),
            artifact: trace.artifact.take(),
            code_sha256: trace.code_sha256.take(),
            syntax_valid: trace.syntax_valid,
            execution: trace.execution,
            result,
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        let prompt = trace.prompt.take();
        write_attempt(&AttemptWriteRequest {
            paths: &paths,
            meta: &AttemptMeta {
                session_id: &session_id,
                target: &request.target,
                record: &record,
                started_at: attempt_started.to_rfc3339(),
                ended_at: Utc::now().to_rfc3339(),
                prompt_bytes: prompt.as_ref().map_or(0, PromptPack::len),
                dropped_sections: prompt
                    .as_ref()
                    .map(|pack| pack.dropped.as_slice())
                    .unwrap_or_default(),
            },
            prompt: prompt.as_ref().map_or("", PromptPack::render),
            plan: trace.plan.as_deref(),
            response: trace.response.as_deref(),
            syntax_log: trace.syntax_log.as_deref(),
            diagnosis: record.result.diagnosis(),
        })?;

        match record.result.diagnosis() {
            Some(diagnosis) => info!(index, kind = diagnosis.kind(), "attempt failed"),
            None => info!(index, "attempt matched the reference"),
        }
        on_attempt(&record);
        session.complete_attempt(record)?;
    }

    let promoted = if session.success() {
        let winner = session
            .records()
            .last()
            .and_then(|record| record.artifact.as_deref());
        match winner {
            Some(artifact) => Some(store.promote(artifact)?),
            None => None,
        }
    } else {
        None
    };

    let report = SessionReport {
        session_id: session_id.clone(),
        target: request.target.clone(),
        success: session.success(),
        phase: session.phase(),
        attempts: session.attempts(),
        max_attempts: session.max_attempts(),
        history: session.history().to_vec(),
        records: session.records().to_vec(),
        artifacts: session
            .records()
            .iter()
            .filter_map(|record| record.artifact.clone())
            .collect(),
        promoted,
        log_dir: session_paths.dir.clone(),
        started_at: started_at.to_rfc3339(),
        ended_at: Utc::now().to_rfc3339(),
    };
    write_summary(&session_paths, &report)?;
    info!(
        %session_id,
        success = report.success,
        attempts = report.attempts,
        "session finished"
    );
    Ok(report)
}

fn run_attempt<B, C, X>(
    env: &AttemptEnv<'_, B, C, X>,
    session: &mut Session,
    index: u32,
    paths: &AttemptPaths,
    trace: &mut AttemptTrace,
) -> Result<AttemptResult>
where
    B: Backend + ?Sized,
    C: SyntaxChecker,
    X: CandidateExecutor,
{
    let settings = &env.request.settings;
    let history = session.history().to_vec();
    let base = PromptInputs {
        target: &env.request.target,
        description: &settings.description,
        notes: &settings.notes,
        contract: env.contract,
        schema: env.schema,
        analysis: env.analysis,
        plan: None,
        history: &history,
    };
    let generation = |prompt: &str| {
        env.backend.generate(&GenerationRequest {
            prompt,
            max_output_tokens: settings.max_output_tokens,
            temperature: settings.temperature,
        })
    };

    if settings.planning {
        let plan_pack = env.builder.build_plan(&base)?;
        match generation(plan_pack.render()) {
            Ok(plan) if !plan.trim().is_empty() => trace.plan = Some(plan),
            Ok(_) => warn!(index, "planning returned no text"),
            Err(failed) => warn!(index, reason = %failed.reason, "planning failed, continuing without a plan"),
        }
    }

    let pack = env.builder.build_generation(&PromptInputs {
        plan: trace.plan.as_deref(),
        ..base
    })?;
    let generated = generation(pack.render());
    trace.prompt = Some(pack);
    let raw = match generated {
        Ok(raw) => raw,
        Err(failed) => {
            return Ok(fail(Diagnosis::GenerationFailed {
                reason: failed.reason,
            }));
        }
    };
    trace.response = Some(raw.clone());

    let code = match extract_code(&raw, &env.runtime.extract_rules()) {
        Extraction::Code(code) => code,
        Extraction::Empty => return Ok(fail(Diagnosis::GenerationEmpty)),
        Extraction::Rejected { reason } => {
            return Ok(fail(Diagnosis::SyntaxError { detail: reason }));
        }
    };
    let stored = env.store.persist(index, &code)?;
    trace.code = Some(code);
    trace.artifact = Some(stored.path.clone());
    trace.code_sha256 = Some(stored.sha256);

    match env.checker.check(&stored.path)? {
        SyntaxVerdict::Valid => trace.syntax_valid = Some(true),
        SyntaxVerdict::Invalid { detail } => {
            trace.syntax_valid = Some(false);
            trace.syntax_log = Some(detail.clone());
            return Ok(fail(Diagnosis::SyntaxError { detail }));
        }
    }

    session.enter_executing()?;
    let outcome = env.executor.execute(&ExecRequest {
        candidate: stored.path,
        input: env.request.input.clone(),
        workdir: env.request.root.clone(),
        attempt_dir: paths.dir.clone(),
        timeout: settings.execution_timeout,
        output_limit_bytes: settings.output_limit_bytes,
    })?;

    let table = match outcome {
        ExecutionOutcome::Completed(table) => {
            trace.execution = Some(ExecutionStatus::Success);
            table
        }
        ExecutionOutcome::Exception { detail } => {
            trace.execution = Some(ExecutionStatus::Exception);
            return Ok(fail(Diagnosis::RuntimeException { detail }));
        }
        ExecutionOutcome::TimedOut { limit } => {
            trace.execution = Some(ExecutionStatus::Timeout);
            return Ok(fail(Diagnosis::Timeout {
                limit_ms: limit.as_millis() as u64,
            }));
        }
    };

    session.enter_comparing()?;
    match compare(&table, env.dataset, settings.mismatch_sample_limit) {
        Verdict::Match => Ok(AttemptResult::ExactMatch),
        Verdict::Mismatch(diagnosis) => Ok(fail(diagnosis)),
    }
}

fn fail(diagnosis: Diagnosis) -> AttemptResult {
    AttemptResult::Failed { diagnosis }
}

/// `<target>-<UTC timestamp with milliseconds>`.
pub fn new_session_id(target: &str) -> String {
    format!("{target}-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"))
}
