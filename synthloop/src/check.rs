//! Preflight checks for a target: inputs on disk, interpreter, backend credentials.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::instrument;

use crate::io::backend::{CommandBackend, HttpBackend};
use crate::io::config::{BackendKind, SynthConfig, validate_target};
use crate::io::process::run_command_with_timeout;
use crate::io::reference::load_reference;
use crate::io::runtime::RuntimeProfile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckItem {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl CheckItem {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub items: Vec<CheckItem>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.items.iter().all(|item| item.passed)
    }
}

/// Run every check; individual failures are reported, not returned as errors.
#[instrument(skip_all, fields(target_id = %target))]
pub fn run_checks(root: &Path, target: &str, cfg: &SynthConfig) -> Result<CheckReport> {
    validate_target(target)?;
    let mut report = CheckReport::default();

    let input = cfg.input_path(root, target);
    report.items.push(if input.is_file() {
        CheckItem::pass("input", input.display().to_string())
    } else {
        CheckItem::fail("input", format!("{} not found", input.display()))
    });

    let reference = cfg.reference_path(root, target);
    report.items.push(match load_reference(&reference) {
        Ok(dataset) => CheckItem::pass(
            "reference",
            format!("{} ({})", reference.display(), dataset.table().shape()),
        ),
        Err(err) => CheckItem::fail("reference", format!("{err:#}")),
    });

    report.items.push(check_interpreter(cfg));
    report.items.push(check_backend(cfg));
    Ok(report)
}

fn check_interpreter(cfg: &SynthConfig) -> CheckItem {
    let attempt = RuntimeProfile::from_config(&cfg.runtime).and_then(|runtime| {
        let program = runtime.interpreter().join(" ");
        let output = run_command_with_timeout(
            runtime.version_command()?,
            None,
            Duration::from_secs(cfg.syntax_check_timeout_secs),
            cfg.output_limit_bytes,
        )?;
        Ok((program, output))
    });
    match attempt {
        Ok((program, output)) if output.success() => {
            let version = first_line(&output.stdout_lossy())
                .or_else(|| first_line(&output.stderr_lossy()))
                .unwrap_or_default();
            CheckItem::pass("interpreter", format!("{program} {version}").trim().to_string())
        }
        Ok((program, output)) if output.timed_out => {
            CheckItem::fail("interpreter", format!("{program} timed out"))
        }
        Ok((program, output)) => CheckItem::fail(
            "interpreter",
            format!("{program} exited with {:?}", output.status.code()),
        ),
        Err(err) => CheckItem::fail("interpreter", format!("{err:#}")),
    }
}

fn check_backend(cfg: &SynthConfig) -> CheckItem {
    match cfg.backend.kind {
        BackendKind::Http => match HttpBackend::new(&cfg.backend) {
            Ok(_) => CheckItem::pass(
                "backend",
                format!("{} via {}", cfg.backend.model, cfg.backend.endpoint),
            ),
            Err(err) => CheckItem::fail("backend", format!("{err:#}")),
        },
        BackendKind::Command => match CommandBackend::new(&cfg.backend, cfg.output_limit_bytes) {
            Ok(_) => CheckItem::pass("backend", format!("command {}", cfg.backend.command.join(" "))),
            Err(err) => CheckItem::fail("backend", format!("{err:#}")),
        },
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use super::*;
    use crate::io::config::RuntimeKind;

    fn shell_config() -> SynthConfig {
        let mut cfg = SynthConfig::default();
        cfg.runtime.kind = RuntimeKind::Shell;
        cfg.backend.kind = BackendKind::Command;
        cfg.backend.command = vec!["cat".to_string()];
        cfg
    }

    #[test]
    fn reports_missing_input_and_reference() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = run_checks(temp.path(), "bank", &shell_config()).expect("checks");

        assert!(!report.passed());
        let names: Vec<_> = report.items.iter().map(|item| (item.name, item.passed)).collect();
        assert_eq!(
            names,
            vec![
                ("input", false),
                ("reference", false),
                ("interpreter", true),
                ("backend", true)
            ]
        );
    }

    #[test]
    fn passes_with_files_present() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = shell_config();
        let input = cfg.input_path(temp.path(), "bank");
        fs::create_dir_all(input.parent().expect("parent")).expect("mkdir");
        fs::write(&input, "statement").expect("write input");
        fs::write(cfg.reference_path(temp.path(), "bank"), "a,b\n1,2\n").expect("write ref");

        let report = run_checks(temp.path(), "bank", &cfg).expect("checks");
        assert!(report.passed(), "{report:?}");
        assert!(report.items[1].detail.contains("1 rows x 2 columns"));
    }

    #[test]
    fn rejects_unsafe_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(run_checks(temp.path(), "../etc", &shell_config()).is_err());
    }

    #[test]
    fn missing_credentials_fail_http_backend() {
        let mut cfg = shell_config();
        cfg.backend.kind = BackendKind::Http;
        cfg.backend.api_key_env = "SYNTHLOOP_CHECK_TEST_KEY_UNSET".to_string();
        let item = check_backend(&cfg);
        assert!(!item.passed);
        assert!(item.detail.contains("SYNTHLOOP_CHECK_TEST_KEY_UNSET"));
    }
}
