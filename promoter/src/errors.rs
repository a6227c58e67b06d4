//! Typed errors for conditions callers and the engine must tell apart.
//!
//! Everything else travels as `anyhow::Error`.

use thiserror::Error;

use crate::core::alias::RESERVED_ALIAS_PATTERN;

/// Configuration errors: fatal to a promotion pass and never retried.
#[derive(Debug, Error)]
pub enum PromotionError {
    #[error(
        "step alias {alias:?} is forbidden: aliases matching {} are reserved",
        RESERVED_ALIAS_PATTERN
    )]
    ForbiddenAlias { alias: String },

    #[error("step alias {alias:?} is used by more than one step")]
    DuplicateAlias { alias: String },

    #[error("no runner registered for step kind {kind:?}")]
    UnknownStepKind { kind: String },

    #[error("invalid {kind} config: {}", problems.join("; "))]
    InvalidConfig { kind: String, problems: Vec<String> },

    #[error("failed to resolve {kind} config: {reason}")]
    ConfigResolution { kind: String, reason: String },

    #[error("promotion cancelled")]
    Cancelled,
}

/// A step failure that retrying cannot fix.
///
/// Step runners return this (through `anyhow`) to abort the promotion
/// regardless of the step's remaining error budget.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TerminalError {
    message: String,
}

impl TerminalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failures while populating a step runner registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a {role} runner is already registered for step kind {kind:?}")]
    AlreadyRegistered { role: &'static str, kind: String },

    #[error("invalid config schema for step kind {kind:?}: {reason}")]
    InvalidSchema { kind: String, reason: String },
}

/// True when `err` (or anything it wraps) asks for the promotion to stop now.
pub fn is_terminal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<TerminalError>().is_some()
            || cause.downcast_ref::<PromotionError>().is_some()
    })
}
