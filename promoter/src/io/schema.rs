//! JSON Schema validation of step configuration.

use anyhow::{Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;

/// Compiled configuration schema for one step kind.
pub struct ConfigSchema {
    raw: Value,
    compiled: Validator,
}

impl std::fmt::Debug for ConfigSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSchema").field("raw", &self.raw).finish()
    }
}

impl ConfigSchema {
    pub fn compile(schema: Value) -> Result<Self> {
        let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
        Ok(Self {
            raw: schema,
            compiled,
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Every violation of the schema, as `dotted.path: message`.
    pub fn problems(&self, config: &Value) -> Vec<String> {
        self.compiled
            .iter_errors(config)
            .map(|err| format!("{}: {}", dotted_path(&err.instance_path().to_string()), err))
            .collect()
    }
}

/// Convert a JSON pointer (`/apps/0/name`) into a dotted path (`apps.0.name`).
fn dotted_path(pointer: &str) -> String {
    if pointer.is_empty() || pointer == "/" {
        return "(root)".to_string();
    }
    pointer
        .trim_start_matches('/')
        .split('/')
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect::<Vec<_>>()
        .join(".")
}
