//! Deterministic, pure logic shared by the synthesis loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod analysis;
pub mod compare;
pub mod diagnosis;
pub mod extract;
pub mod prompt;
pub mod state;
pub mod types;
