//! Engine configuration loaded from TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Promotion engine configuration (TOML).
///
/// Missing fields default to the values used by a stock installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromoterConfig {
    /// Error threshold for steps whose runner and configuration set none.
    pub default_error_threshold: u32,

    pub argocd: ArgoCdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArgoCdConfig {
    /// Namespace assumed for Application references that omit one.
    pub default_namespace: String,

    /// Identity stamped on operations started by the promotion engine.
    pub operation_initiator: String,

    /// Seconds after an operation finishes before its revisions are trusted.
    pub health_cooldown_secs: u64,
}

impl Default for ArgoCdConfig {
    fn default() -> Self {
        Self {
            default_namespace: "argocd".to_string(),
            operation_initiator: "kargo-controller".to_string(),
            health_cooldown_secs: 10,
        }
    }
}

impl ArgoCdConfig {
    pub fn health_cooldown(&self) -> Duration {
        Duration::from_secs(self.health_cooldown_secs)
    }
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            default_error_threshold: 1,
            argocd: ArgoCdConfig::default(),
        }
    }
}

impl PromoterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_error_threshold == 0 {
            return Err(anyhow!("default_error_threshold must be > 0"));
        }
        if self.argocd.default_namespace.trim().is_empty() {
            return Err(anyhow!("argocd.default_namespace must be non-empty"));
        }
        if self.argocd.operation_initiator.trim().is_empty() {
            return Err(anyhow!("argocd.operation_initiator must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PromoterConfig::default()`.
pub fn load_config(path: &Path) -> Result<PromoterConfig> {
    if !path.exists() {
        let cfg = PromoterConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PromoterConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PromoterConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("promoter.toml");
        fs::write(&path, "[argocd]\nhealth_cooldown_secs = 3\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.argocd.health_cooldown(), Duration::from_secs(3));
        assert_eq!(cfg.argocd.default_namespace, "argocd");
        assert_eq!(cfg.default_error_threshold, 1);
    }

    #[test]
    fn zero_error_threshold_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("promoter.toml");
        fs::write(&path, "default_error_threshold = 0\n").expect("write");

        let err = load_config(&path).expect_err("invalid");
        assert!(err.to_string().contains("default_error_threshold"));
    }
}
