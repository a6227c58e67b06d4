//! Static checks of a step list before it is handed to the engine.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::alias::resolve_aliases;
use crate::core::types::Step;
use crate::errors::PromotionError;
use crate::io::expressions::contains_expression;
use crate::registry::Registry;

/// What validation could say about one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigCheck {
    /// Config matches the kind's schema.
    Valid,
    /// Config holds expressions; it can only be checked once they are resolved.
    Deferred,
    /// The kind declares no schema.
    Unchecked,
}

/// Validation result for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub index: usize,
    pub alias: String,
    pub kind: String,
    pub config: ConfigCheck,
}

/// Check aliases, step kinds and (expression-free) configs.
///
/// Stops at the first problem, reporting it the way the engine would.
pub fn validate_steps(registry: &Registry, steps: &[Step]) -> Result<Vec<StepReport>, PromotionError> {
    let aliases = resolve_aliases(steps)?;
    steps
        .iter()
        .zip(aliases)
        .enumerate()
        .map(|(index, (step, alias))| {
            let registration = registry.promotion_step_runner(&step.kind).ok_or_else(|| {
                PromotionError::UnknownStepKind {
                    kind: step.kind.clone(),
                }
            })?;
            let config = match &registration.schema {
                None => ConfigCheck::Unchecked,
                Some(_) if contains_expression(&step.config) => ConfigCheck::Deferred,
                Some(schema) => {
                    let raw = match &step.config {
                        serde_json::Value::Null => serde_json::json!({}),
                        other => other.clone(),
                    };
                    let problems = schema.problems(&raw);
                    if !problems.is_empty() {
                        return Err(PromotionError::InvalidConfig {
                            kind: step.kind.clone(),
                            problems,
                        });
                    }
                    ConfigCheck::Valid
                }
            };
            Ok(StepReport {
                index,
                alias,
                kind: step.kind.clone(),
                config,
            })
        })
        .collect()
}

/// Read a JSON array of steps.
pub fn load_steps(path: &Path) -> Result<Vec<Step>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse steps from {}", path.display()))
}
