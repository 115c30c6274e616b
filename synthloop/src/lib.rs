//! Autonomous parser synthesis.
//!
//! A session repeatedly asks a generative backend for a parser, persists each
//! candidate, runs it in an isolated child process and compares its output with
//! a reference table. Every failure becomes a structured diagnosis that is fed
//! back into the next prompt. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (extraction, comparison, diagnosis,
//!   prompt assembly, session state). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, child processes, HTTP).
//!   Behind traits where tests need fakes.
//!
//! Orchestration modules ([`session`], [`check`]) coordinate core logic with I/O
//! to implement CLI commands.

pub mod check;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
