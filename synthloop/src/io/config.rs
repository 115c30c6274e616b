//! Loop configuration stored under `.synth/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default config location relative to the working root.
pub const CONFIG_PATH: &str = ".synth/config.toml";

static TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static target regex"));

/// Synthesis loop configuration (TOML).
///
/// Meant to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthConfig {
    /// Attempt ceiling per session.
    pub max_attempts: u32,

    /// Wall-clock budget for one candidate execution.
    pub execution_timeout_secs: u64,

    /// Wall-clock budget for the syntax check.
    pub syntax_check_timeout_secs: u64,

    /// Truncate captured child stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Byte budget for a rendered prompt.
    pub prompt_budget_bytes: usize,

    /// How many diagnoses (latest included) are shown to the backend.
    pub history_window: usize,

    /// Reference rows embedded in the prompt.
    pub sample_rows: usize,

    /// Cap on `(row, column, got, expected)` samples in a value mismatch.
    pub mismatch_sample_limit: usize,

    /// Ask the backend for a plan before each generation.
    pub planning: bool,

    pub artifact_dir: PathBuf,

    /// Input path with `{target}` placeholders.
    pub input_pattern: String,

    /// Reference CSV path with `{target}` placeholders.
    pub reference_pattern: String,

    pub task: TaskConfig,
    pub backend: BackendConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskConfig {
    pub description: String,
    pub notes: Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            description: "Write a parser for a bank statement PDF. It reads the statement at the \
                          given path and returns its transaction table."
                .to_string(),
            notes: vec![
                "Statements may span several pages; collect rows from every page.".to_string(),
                "Skip header rows repeated on later pages.".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Http,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
    /// Command for `kind = "command"`; the prompt is written to its stdin.
    pub command: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Http,
            endpoint: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            model: "llama3-70b-8192".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            max_output_tokens: 4000,
            temperature: 0.1,
            request_timeout_secs: 120,
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Python,
    Shell,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    /// Interpreter command; empty means the runtime's default.
    pub interpreter: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Python,
            interpreter: Vec::new(),
        }
    }
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            execution_timeout_secs: 60,
            syntax_check_timeout_secs: 30,
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 40_000,
            history_window: 3,
            sample_rows: 3,
            mismatch_sample_limit: 10,
            planning: false,
            artifact_dir: PathBuf::from("custom_parsers"),
            input_pattern: "data/{target}/{target} sample.pdf".to_string(),
            reference_pattern: "data/{target}/result.csv".to_string(),
            task: TaskConfig::default(),
            backend: BackendConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl SynthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.execution_timeout_secs == 0 {
            return Err(anyhow!("execution_timeout_secs must be > 0"));
        }
        if self.syntax_check_timeout_secs == 0 {
            return Err(anyhow!("syntax_check_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.history_window == 0 {
            return Err(anyhow!("history_window must be > 0"));
        }
        if self.backend.request_timeout_secs == 0 {
            return Err(anyhow!("backend.request_timeout_secs must be > 0"));
        }
        if self.backend.max_output_tokens == 0 {
            return Err(anyhow!("backend.max_output_tokens must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.backend.temperature) {
            return Err(anyhow!("backend.temperature must be within 0.0..=2.0"));
        }
        match self.backend.kind {
            BackendKind::Http => {
                if self.backend.endpoint.trim().is_empty() {
                    return Err(anyhow!("backend.endpoint must be set for http backends"));
                }
                if self.backend.model.trim().is_empty() {
                    return Err(anyhow!("backend.model must be set for http backends"));
                }
            }
            BackendKind::Command => {
                if non_empty_command(&self.backend.command).is_none() {
                    return Err(anyhow!("backend.command must be a non-empty array"));
                }
            }
        }
        if !self.runtime.interpreter.is_empty()
            && non_empty_command(&self.runtime.interpreter).is_none()
        {
            return Err(anyhow!("runtime.interpreter must not start with an empty string"));
        }
        Ok(())
    }

    pub fn input_path(&self, root: &Path, target: &str) -> PathBuf {
        root.join(expand_target(&self.input_pattern, target))
    }

    pub fn reference_path(&self, root: &Path, target: &str) -> PathBuf {
        root.join(expand_target(&self.reference_pattern, target))
    }

    pub fn artifact_root(&self, root: &Path) -> PathBuf {
        root.join(&self.artifact_dir)
    }
}

fn non_empty_command(command: &[String]) -> Option<&str> {
    command
        .first()
        .map(|program| program.trim())
        .filter(|program| !program.is_empty())
}

fn expand_target(pattern: &str, target: &str) -> String {
    pattern.replace("{target}", target)
}

/// Target identifiers end up in file names, so they are restricted.
pub fn validate_target(target: &str) -> Result<()> {
    if !TARGET_RE.is_match(target) {
        bail!("invalid target {target:?}: use only letters, digits, '_' and '-'");
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SynthConfig::default()`.
pub fn load_config(path: &Path) -> Result<SynthConfig> {
    if !path.exists() {
        let cfg = SynthConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SynthConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SynthConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
