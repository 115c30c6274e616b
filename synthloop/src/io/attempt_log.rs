//! Attempt logging helpers for `.synth/sessions/`.
//!
//! The executor writes its driver, result and log into the attempt directory
//! while it runs; everything else is written once the attempt is complete.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::diagnosis::Diagnosis;
use crate::core::state::AttemptRecord;

#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub summary_path: PathBuf,
}

impl SessionPaths {
    pub fn new(root: &Path, session_id: &str) -> Self {
        let dir = root.join(".synth").join("sessions").join(session_id);
        Self {
            summary_path: dir.join("session.json"),
            dir,
        }
    }

    pub fn attempt(&self, index: u32) -> AttemptPaths {
        AttemptPaths::new(&self.dir, index)
    }
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub plan_path: PathBuf,
    pub response_path: PathBuf,
    pub syntax_log_path: PathBuf,
    pub diagnosis_path: PathBuf,
    pub error_path: PathBuf,
}

impl AttemptPaths {
    fn new(session_dir: &Path, index: u32) -> Self {
        let dir = session_dir.join("attempts").join(index.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            plan_path: dir.join("plan.md"),
            response_path: dir.join("response.txt"),
            syntax_log_path: dir.join("syntax.log"),
            diagnosis_path: dir.join("diagnosis.json"),
            error_path: dir.join("error.log"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create attempt dir {}", self.dir.display()))
    }
}

/// Metadata written to `meta.json`.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta<'a> {
    pub session_id: &'a str,
    pub target: &'a str,
    #[serde(flatten)]
    pub record: &'a AttemptRecord,
    pub started_at: String,
    pub ended_at: String,
    pub prompt_bytes: usize,
    pub dropped_sections: &'a [String],
}

pub struct AttemptWriteRequest<'a> {
    pub paths: &'a AttemptPaths,
    pub meta: &'a AttemptMeta<'a>,
    pub prompt: &'a str,
    pub plan: Option<&'a str>,
    pub response: Option<&'a str>,
    pub syntax_log: Option<&'a str>,
    pub diagnosis: Option<&'a Diagnosis>,
}

pub fn write_attempt(request: &AttemptWriteRequest<'_>) -> Result<()> {
    let paths = request.paths;
    paths.create()?;

    // Write in deterministic order to keep logs stable.
    write_json(&paths.meta_path, request.meta)?;
    write_text(&paths.prompt_path, request.prompt)?;
    if let Some(plan) = request.plan {
        write_text(&paths.plan_path, plan)?;
    }
    if let Some(response) = request.response {
        write_text(&paths.response_path, response)?;
    }
    if let Some(log) = request.syntax_log {
        write_text(&paths.syntax_log_path, log)?;
    }
    if let Some(diagnosis) = request.diagnosis {
        write_json(&paths.diagnosis_path, diagnosis)?;
    }
    Ok(())
}

/// Record an infrastructure failure that aborted the attempt.
pub fn write_error(paths: &AttemptPaths, message: &str) -> Result<()> {
    paths.create()?;
    write_text(&paths.error_path, message)
}

pub fn write_summary<T: Serialize>(paths: &SessionPaths, summary: &T) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create session dir {}", paths.dir.display()))?;
    write_json(&paths.summary_path, summary)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{AttemptResult, ExecutionStatus};

    #[test]
    fn attempt_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(temp.path(), "icici-20240801T000000.000Z").attempt(3);

        assert!(paths.dir.ends_with(Path::new(
            ".synth/sessions/icici-20240801T000000.000Z/attempts/3"
        )));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.prompt_path.ends_with("prompt.md"));
        assert!(paths.response_path.ends_with("response.txt"));
        assert!(paths.diagnosis_path.ends_with("diagnosis.json"));
    }

    #[test]
    fn writes_attempt_with_diagnosis() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(temp.path(), "s1").attempt(1);
        let diagnosis = Diagnosis::Timeout { limit_ms: 500 };
        let record = AttemptRecord {
            index: 1,
            raw_response: Some("raw".to_string()),
            code: Some("code".to_string()),
            artifact: Some(PathBuf::from("custom_parsers/s1/t_parser_attempt1.sh")),
            code_sha256: Some("ab".repeat(32)),
            syntax_valid: Some(true),
            execution: Some(ExecutionStatus::Timeout),
            result: AttemptResult::Failed {
                diagnosis: diagnosis.clone(),
            },
            duration_ms: 12,
        };
        let meta = AttemptMeta {
            session_id: "s1",
            target: "t",
            record: &record,
            started_at: "start".to_string(),
            ended_at: "end".to_string(),
            prompt_bytes: 6,
            dropped_sections: &[],
        };

        write_attempt(&AttemptWriteRequest {
            paths: &paths,
            meta: &meta,
            prompt: "prompt",
            plan: None,
            response: Some("raw"),
            syntax_log: None,
            diagnosis: Some(&diagnosis),
        })
        .expect("write attempt");

        let meta_json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("read meta"))
                .expect("parse meta");
        assert_eq!(meta_json["index"], 1);
        assert_eq!(meta_json["execution"], "timeout");
        assert_eq!(meta_json["result"]["outcome"], "failed");
        assert_eq!(meta_json["result"]["diagnosis"]["kind"], "timeout");
        assert!(meta_json.get("raw_response").is_none());
        assert!(paths.response_path.is_file());
        assert!(!paths.plan_path.exists());
    }
}
