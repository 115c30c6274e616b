//! Side-effecting helpers: filesystem, child processes, network.

pub mod artifacts;
pub mod attempt_log;
pub mod backend;
pub mod config;
pub mod executor;
pub mod process;
pub mod reference;
pub mod runtime;
pub mod syntax;
