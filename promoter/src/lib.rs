//! Promotion engine: runs the steps that move freight into a stage.
//!
//! A promotion is an ordered list of steps. Each pass of the engine resumes at
//! the step where the previous pass stopped, runs steps until one must wait or
//! fail, and returns the state the caller persists for the next pass. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (aliases, retry policy, state,
//!   merging). No I/O, fully testable in isolation.
//! - **[`io`]**: Configuration, collaborator contracts, schema validation and
//!   expression resolution.
//!
//! Orchestration modules ([`promote`], [`health`], [`validate`]) drive core
//! logic through the step runners in a [`registry`]. [`argocd`] provides the
//! built-in `argocd-update` step.

pub mod argocd;
pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod health;
pub mod io;
pub mod logging;
pub mod promote;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
