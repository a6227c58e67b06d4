//! Step alias resolution.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Step;
use crate::errors::PromotionError;

/// Aliases of this shape are generated by the system and may not be chosen by users.
pub const RESERVED_ALIAS_PATTERN: &str = r"^(step|task)-\d+$";

static RESERVED_ALIAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(RESERVED_ALIAS_PATTERN).unwrap());

/// Alias assigned to a step that has none.
pub fn default_alias(index: usize) -> String {
    format!("step-{index}")
}

pub fn is_reserved(alias: &str) -> bool {
    RESERVED_ALIAS_RE.is_match(alias)
}

/// Return the effective alias of the step at `index`.
pub fn resolve_alias(step: &Step, index: usize) -> Result<String, PromotionError> {
    match step.alias.as_deref().map(str::trim) {
        None | Some("") => Ok(default_alias(index)),
        Some(alias) if is_reserved(alias) => Err(PromotionError::ForbiddenAlias {
            alias: alias.to_string(),
        }),
        Some(alias) => Ok(alias.to_string()),
    }
}

/// Resolve every alias of a step list, rejecting reserved and duplicate aliases.
pub fn resolve_aliases(steps: &[Step]) -> Result<Vec<String>, PromotionError> {
    let mut seen = HashSet::new();
    let mut aliases = Vec::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        let alias = resolve_alias(step, index)?;
        if !seen.insert(alias.clone()) {
            return Err(PromotionError::DuplicateAlias { alias });
        }
        aliases.push(alias);
    }
    Ok(aliases)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_alias_defaults_to_index() {
        let step = Step::new("noop");
        assert_eq!(resolve_alias(&step, 4).expect("alias"), "step-4");
    }

    #[test]
    fn reserved_aliases_are_forbidden() {
        for alias in ["step-3", "task-12"] {
            let step = Step::new("noop").with_alias(alias);
            let err = resolve_alias(&step, 0).expect_err("reserved");
            assert!(err.to_string().contains("forbidden"), "{err}");
        }
    }

    #[test]
    fn similar_aliases_are_allowed() {
        for alias in ["step-x", "steps-1", "my-step-1", "task"] {
            let step = Step::new("noop").with_alias(alias);
            assert_eq!(resolve_alias(&step, 0).expect("alias"), alias);
        }
    }

    #[test]
    fn duplicate_aliases_are_rejected() {
        let steps = vec![
            Step::new("noop").with_alias("clone"),
            Step::new("noop").with_alias("clone"),
        ];
        let err = resolve_aliases(&steps).expect_err("duplicate");
        assert!(matches!(err, PromotionError::DuplicateAlias { .. }));
    }
}
