//! Autonomous parser synthesis loop.
//!
//! Asks a generative backend for a parser, runs it in a child process against a
//! sample input and compares the result with a reference CSV, feeding each
//! failure back into the next prompt until it matches or attempts run out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use synthloop::check::run_checks;
use synthloop::core::compare::{Verdict, compare};
use synthloop::core::state::{AttemptRecord, AttemptResult};
use synthloop::exit_codes;
use synthloop::io::backend::build_backend;
use synthloop::io::config::{CONFIG_PATH, SynthConfig, load_config, write_config};
use synthloop::io::executor::{ProcessExecutor, decode_result};
use synthloop::io::reference::load_reference;
use synthloop::io::runtime::RuntimeProfile;
use synthloop::io::syntax::CommandSyntaxChecker;
use synthloop::logging;
use synthloop::session::{SessionReport, SessionRequest, run_session};

#[derive(Parser)]
#[command(
    name = "synthloop",
    version,
    about = "Generate, run and verify parsers against a reference dataset"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.synth/config.toml` and create the artifact directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a synthesis session for a target.
    Run {
        /// Target identifier, e.g. `icici`.
        #[arg(short, long)]
        target: String,
        /// Sample input (defaults to the configured pattern).
        #[arg(long)]
        input: Option<PathBuf>,
        /// Reference CSV (defaults to the configured pattern).
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Override the attempt ceiling.
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Config file.
        #[arg(long, default_value = CONFIG_PATH)]
        config: PathBuf,
    },
    /// Compare a saved candidate result (JSON) against a reference CSV.
    Compare {
        #[arg(long)]
        reference: PathBuf,
        #[arg(long)]
        candidate: PathBuf,
        /// Maximum differing cells to report.
        #[arg(long, default_value_t = 10)]
        sample_limit: usize,
    },
    /// Verify inputs, interpreter and backend credentials for a target.
    Check {
        #[arg(short, long)]
        target: String,
        #[arg(long, default_value = CONFIG_PATH)]
        config: PathBuf,
    },
}

fn main() {
    dotenvy::dotenv().ok();
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run {
            target,
            input,
            reference,
            max_attempts,
            config,
        } => cmd_run(RunArgs {
            target,
            input,
            reference,
            max_attempts,
            config,
        }),
        Command::Compare {
            reference,
            candidate,
            sample_limit,
        } => cmd_compare(&reference, &candidate, sample_limit),
        Command::Check { target, config } => cmd_check(&target, &config),
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let root = current_root()?;
    let config_path = root.join(CONFIG_PATH);
    let cfg = if config_path.exists() && !force {
        println!("keeping existing {}", config_path.display());
        load_config(&config_path)?
    } else {
        let cfg = SynthConfig::default();
        write_config(&config_path, &cfg)?;
        println!("wrote {}", config_path.display());
        cfg
    };
    let artifacts = cfg.artifact_root(&root);
    fs::create_dir_all(&artifacts)
        .with_context(|| format!("create artifact dir {}", artifacts.display()))?;
    Ok(exit_codes::OK)
}

struct RunArgs {
    target: String,
    input: Option<PathBuf>,
    reference: Option<PathBuf>,
    max_attempts: Option<u32>,
    config: PathBuf,
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let root = current_root()?;
    let mut cfg = load_config(&root.join(&args.config))?;
    if let Some(max_attempts) = args.max_attempts {
        cfg.max_attempts = max_attempts;
    }
    cfg.validate()?;

    let mut request = SessionRequest::from_config(&root, &args.target, &cfg);
    if let Some(input) = args.input {
        request.input = input;
    }
    if let Some(reference) = args.reference {
        request.reference = reference;
    }

    let runtime = RuntimeProfile::from_config(&cfg.runtime)?;
    let backend = build_backend(&cfg.backend, cfg.output_limit_bytes)?;
    let checker = CommandSyntaxChecker::new(
        &runtime,
        Duration::from_secs(cfg.syntax_check_timeout_secs),
        cfg.output_limit_bytes,
    );
    let executor = ProcessExecutor::new(&runtime);

    let max_attempts = cfg.max_attempts;
    let report = run_session(&request, &runtime, &*backend, &checker, &executor, |record| {
        println!("{}", attempt_line(record, max_attempts));
    })?;
    print_report(&report);

    Ok(if report.success {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_compare(reference: &Path, candidate: &Path, sample_limit: usize) -> Result<i32> {
    let dataset = load_reference(reference)?;
    let raw = fs::read_to_string(candidate)
        .with_context(|| format!("read candidate {}", candidate.display()))?;
    let table = decode_result(&raw)
        .with_context(|| format!("decode candidate {}", candidate.display()))?;

    match compare(&table, &dataset, sample_limit) {
        Verdict::Match => {
            println!("exact match ({})", table.shape());
            Ok(exit_codes::OK)
        }
        Verdict::Mismatch(diagnosis) => {
            println!("{}", diagnosis.describe());
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_check(target: &str, config: &Path) -> Result<i32> {
    let root = current_root()?;
    let cfg = load_config(&root.join(config))?;
    cfg.validate()?;
    let report = run_checks(&root, target, &cfg)?;
    for item in &report.items {
        let mark = if item.passed { "ok" } else { "FAIL" };
        println!("[{mark}] {}: {}", item.name, item.detail);
    }
    Ok(if report.passed() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn attempt_line(record: &AttemptRecord, max_attempts: u32) -> String {
    let outcome = match &record.result {
        AttemptResult::ExactMatch => "exact match".to_string(),
        AttemptResult::Failed { diagnosis } => diagnosis.summary(),
    };
    format!(
        "attempt {}/{max_attempts}: {outcome} ({} ms)",
        record.index, record.duration_ms
    )
}

fn print_report(report: &SessionReport) {
    if report.success {
        println!(
            "succeeded after {} attempt(s) in session {}",
            report.attempts, report.session_id
        );
        if let Some(promoted) = &report.promoted {
            println!("parser: {}", promoted.display());
        }
    } else {
        println!(
            "exhausted {} attempt(s) in session {}",
            report.attempts, report.session_id
        );
        for (idx, diagnosis) in report.history.iter().enumerate() {
            println!("  {}. {}", idx + 1, diagnosis.summary());
        }
    }
    println!("logs: {}", report.log_dir.display());
}

fn current_root() -> Result<PathBuf> {
    std::env::current_dir().context("resolve current directory")
}
