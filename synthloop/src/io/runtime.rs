//! Candidate runtime profiles.
//!
//! A profile knows how candidates in one language are stored, syntax-checked
//! and driven. The driver is a small program rendered next to the attempt log
//! that loads the candidate, binds its entry point and writes the result file.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use regex::Regex;

use crate::core::extract::ExtractRules;
use crate::core::prompt::OutputContract;
use crate::io::config::{RuntimeConfig, RuntimeKind};

const PYTHON_DRIVER: &str = include_str!("drivers/python.py.j2");
const SHELL_DRIVER: &str = include_str!("drivers/shell.sh.j2");

const ENTRY_POINT: &str = "parse";

const PYTHON_AST_CHECK: &str =
    "import ast, sys; ast.parse(open(sys.argv[1], encoding='utf-8').read(), sys.argv[1])";

/// How candidates for one language are persisted, checked and run.
#[derive(Debug, Clone)]
pub struct RuntimeProfile {
    kind: RuntimeKind,
    interpreter: Vec<String>,
    entry_pattern: Regex,
}

impl RuntimeProfile {
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let mut profile = Self::new(config.kind)?;
        if !config.interpreter.is_empty() {
            profile.interpreter = config.interpreter.clone();
        }
        Ok(profile)
    }

    pub fn new(kind: RuntimeKind) -> Result<Self> {
        let (interpreter, pattern) = match kind {
            RuntimeKind::Python => ("python3", r"(?m)^def\s+parse\s*\("),
            RuntimeKind::Shell => ("sh", r"(?m)^\s*(function\s+)?parse\s*\(\s*\)"),
        };
        Ok(Self {
            kind,
            interpreter: vec![interpreter.to_string()],
            entry_pattern: Regex::new(pattern).context("compile entry point pattern")?,
        })
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn interpreter(&self) -> &[String] {
        &self.interpreter
    }

    pub fn entry_point(&self) -> &'static str {
        ENTRY_POINT
    }

    /// File extension for artifacts and drivers.
    pub fn extension(&self) -> &'static str {
        match self.kind {
            RuntimeKind::Python => "py",
            RuntimeKind::Shell => "sh",
        }
    }

    pub fn fence_tags(&self) -> &'static [&'static str] {
        match self.kind {
            RuntimeKind::Python => &["python", "py", "python3"],
            RuntimeKind::Shell => &["sh", "bash", "shell"],
        }
    }

    pub fn extract_rules(&self) -> ExtractRules<'_> {
        ExtractRules {
            fence_tags: self.fence_tags(),
            entry_point: &self.entry_pattern,
        }
    }

    pub fn contract(&self) -> OutputContract {
        match self.kind {
            RuntimeKind::Python => OutputContract {
                language: "Python".to_string(),
                fence_tag: "python".to_string(),
                entry_signature: format!("def {ENTRY_POINT}(input_path: str)"),
                returns: "a pandas DataFrame (or a dict with \"columns\" and \"rows\" lists)"
                    .to_string(),
            },
            RuntimeKind::Shell => OutputContract {
                language: "POSIX shell".to_string(),
                fence_tag: "sh".to_string(),
                entry_signature: format!("{ENTRY_POINT}() {{ ... }}"),
                returns: "nothing; instead it writes one JSON object \
                          {\"columns\": [...], \"rows\": [[...], ...]} to stdout"
                    .to_string(),
            },
        }
    }

    /// Command that exits non-zero when `file` is not syntactically valid.
    pub fn syntax_command(&self, file: &Path) -> Result<Command> {
        let mut cmd = self.base_command()?;
        match self.kind {
            RuntimeKind::Python => {
                cmd.arg("-c").arg(PYTHON_AST_CHECK).arg(file);
            }
            RuntimeKind::Shell => {
                cmd.arg("-n").arg(file);
            }
        }
        Ok(cmd)
    }

    /// Render the driver program for this runtime.
    pub fn render_driver(&self) -> Result<String> {
        let (name, source) = match self.kind {
            RuntimeKind::Python => ("driver.py", PYTHON_DRIVER),
            RuntimeKind::Shell => ("driver.sh", SHELL_DRIVER),
        };
        let mut env = Environment::new();
        env.add_template(name, source)
            .with_context(|| format!("load {name} template"))?;
        env.get_template(name)?
            .render(context! { entry_point => ENTRY_POINT })
            .with_context(|| format!("render {name}"))
    }

    /// Command that runs `driver` against a candidate and input, writing `result`.
    pub fn driver_command(
        &self,
        driver: &Path,
        candidate: &Path,
        input: &Path,
        result: &Path,
    ) -> Result<Command> {
        let mut cmd = self.base_command()?;
        cmd.arg(driver).arg(candidate).arg(input).arg(result);
        Ok(cmd)
    }

    /// Command that succeeds when the interpreter is usable.
    pub fn version_command(&self) -> Result<Command> {
        let mut cmd = self.base_command()?;
        match self.kind {
            RuntimeKind::Python => {
                cmd.arg("--version");
            }
            RuntimeKind::Shell => {
                cmd.arg("-c").arg("exit 0");
            }
        }
        Ok(cmd)
    }

    fn base_command(&self) -> Result<Command> {
        let Some((program, args)) = self.interpreter.split_first() else {
            bail!("runtime interpreter is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}
