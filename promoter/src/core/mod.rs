//! Deterministic, pure logic shared by the promotion engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod alias;
pub mod duration;
pub mod freight;
pub mod glob;
pub mod merge;
pub mod policy;
pub mod state;
pub mod types;
