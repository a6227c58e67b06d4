//! Wildcard matching for names in annotations and sync windows.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// A compiled list of patterns; matches when any pattern does.
#[derive(Debug, Clone)]
pub struct GlobList(GlobSet);

impl GlobList {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern).with_context(|| format!("invalid glob pattern {pattern:?}"))?);
        }
        Ok(Self(builder.build()?))
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

/// True when `value` matches `pattern`, where `*` matches any run of characters.
pub fn glob_match(pattern: &str, value: &str) -> Result<bool> {
    let matcher = Glob::new(pattern)
        .with_context(|| format!("invalid glob pattern {pattern:?}"))?
        .compile_matcher();
    Ok(matcher.is_match(value))
}
