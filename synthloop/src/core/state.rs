//! Session state machine for the retry loop.
//!
//! The session is the only owner of the attempt counter and the diagnostic
//! history. Transitions are checked: an illegal move returns a
//! [`TransitionError`] instead of silently corrupting state.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::core::diagnosis::Diagnosis;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Generating,
    Executing,
    Comparing,
    Succeeded,
    Exhausted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Exhausted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Generating => "generating",
            Phase::Executing => "executing",
            Phase::Comparing => "comparing",
            Phase::Succeeded => "succeeded",
            Phase::Exhausted => "exhausted",
        }
    }
}

/// Returned when a transition is not allowed from the current phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub phase: Phase,
    pub action: &'static str,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} while session is {}",
            self.action,
            self.phase.as_str()
        )
    }
}

impl std::error::Error for TransitionError {}

/// How the candidate process ended, when it was run at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Exception,
    Timeout,
}

/// Final result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptResult {
    ExactMatch,
    Failed { diagnosis: Diagnosis },
}

impl AttemptResult {
    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        match self {
            AttemptResult::ExactMatch => None,
            AttemptResult::Failed { diagnosis } => Some(diagnosis),
        }
    }
}

/// Immutable record of a completed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub index: u32,
    #[serde(skip)]
    pub raw_response: Option<String>,
    #[serde(skip)]
    pub code: Option<String>,
    pub artifact: Option<PathBuf>,
    pub code_sha256: Option<String>,
    pub syntax_valid: Option<bool>,
    pub execution: Option<ExecutionStatus>,
    pub result: AttemptResult,
    pub duration_ms: u64,
}

/// Fixed inputs of a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub id: String,
    pub target: String,
    pub input: PathBuf,
    pub reference: PathBuf,
    pub artifact_dir: PathBuf,
    pub max_attempts: u32,
}

/// One bounded run for a target.
#[derive(Debug, Clone)]
pub struct Session {
    params: SessionParams,
    attempts: u32,
    history: Vec<Diagnosis>,
    records: Vec<AttemptRecord>,
    phase: Phase,
    active: Option<u32>,
    success: bool,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        let phase = if params.max_attempts == 0 {
            Phase::Exhausted
        } else {
            Phase::Idle
        };
        Self {
            params,
            attempts: 0,
            history: Vec::new(),
            records: Vec::new(),
            phase,
            active: None,
            success: false,
        }
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn id(&self) -> &str {
        &self.params.id
    }

    pub fn target(&self) -> &str {
        &self.params.target
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.params.max_attempts
    }

    pub fn history(&self) -> &[Diagnosis] {
        &self.history
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn active(&self) -> Option<u32> {
        self.active
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Whether another attempt may start.
    pub fn can_begin(&self) -> bool {
        matches!(self.phase, Phase::Idle | Phase::Generating)
            && self.active.is_none()
            && self.attempts < self.params.max_attempts
    }

    /// Idle/Generating → Generating with a new active attempt. Returns its 1-based index.
    pub fn begin_attempt(&mut self) -> Result<u32, TransitionError> {
        if !self.can_begin() {
            return Err(self.reject("begin an attempt"));
        }
        let index = self.attempts + 1;
        self.phase = Phase::Generating;
        self.active = Some(index);
        Ok(index)
    }

    /// Generating → Executing, once the candidate is sanitized and persisted.
    pub fn enter_executing(&mut self) -> Result<(), TransitionError> {
        if self.phase != Phase::Generating || self.active.is_none() {
            return Err(self.reject("start execution"));
        }
        self.phase = Phase::Executing;
        Ok(())
    }

    /// Executing → Comparing, once the candidate produced a result.
    pub fn enter_comparing(&mut self) -> Result<(), TransitionError> {
        if self.phase != Phase::Executing {
            return Err(self.reject("start comparison"));
        }
        self.phase = Phase::Comparing;
        Ok(())
    }

    /// Close the active attempt.
    ///
    /// A match is only accepted from `Comparing`. A failure appends its
    /// diagnosis to the history and moves to `Generating`, or to `Exhausted`
    /// once the ceiling is reached.
    pub fn complete_attempt(&mut self, record: AttemptRecord) -> Result<Phase, TransitionError> {
        if self.active != Some(record.index) {
            return Err(self.reject("complete an attempt that is not active"));
        }
        let next = match &record.result {
            AttemptResult::ExactMatch => {
                if self.phase != Phase::Comparing {
                    return Err(self.reject("record a match"));
                }
                self.success = true;
                Phase::Succeeded
            }
            AttemptResult::Failed { diagnosis } => {
                if !matches!(
                    self.phase,
                    Phase::Generating | Phase::Executing | Phase::Comparing
                ) {
                    return Err(self.reject("record a failure"));
                }
                self.history.push(diagnosis.clone());
                if self.attempts + 1 >= self.params.max_attempts {
                    Phase::Exhausted
                } else {
                    Phase::Generating
                }
            }
        };

        self.attempts += 1;
        self.records.push(record);
        self.active = None;
        self.phase = next;
        Ok(next)
    }

    fn reject(&self, action: &'static str) -> TransitionError {
        TransitionError {
            phase: self.phase,
            action,
        }
    }
}
