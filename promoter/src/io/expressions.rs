//! Resolution of `{{ ... }}` expressions in step configuration.
//!
//! String leaves of a config document are rendered with minijinja against
//! the promotion's outputs, project secrets, variables and identity. A leaf
//! that is exactly one expression keeps the expression's type, so
//! `"{{ vars.replicas }}"` can yield a number.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value, json};

use crate::core::state::State;

/// Secret name to key/value data for one project.
pub type ProjectSecrets = BTreeMap<String, BTreeMap<String, String>>;

/// Everything an expression may reference.
#[derive(Debug, Clone, Copy)]
pub struct ExpressionContext<'a> {
    pub project: &'a str,
    pub stage: &'a str,
    pub promotion: &'a str,
    pub outputs: &'a State,
    pub secrets: &'a ProjectSecrets,
    pub vars: &'a Map<String, Value>,
}

impl ExpressionContext<'_> {
    fn to_value(self) -> Value {
        json!({
            "ctx": {
                "project": self.project,
                "stage": self.stage,
                "promotion": self.promotion,
            },
            "outputs": self.outputs,
            "secrets": self.secrets,
            "vars": self.vars,
        })
    }
}

/// Resolve every expression in `config`. Object keys are left untouched.
pub fn resolve_config(config: &Value, ctx: ExpressionContext<'_>) -> Result<Value> {
    if !contains_expression(config) {
        return Ok(config.clone());
    }
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let root = minijinja::Value::from_serialize(ctx.to_value());
    resolve_value(&env, config, &root)
}

fn resolve_value(env: &Environment<'_>, value: &Value, root: &minijinja::Value) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(env, s, root),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(env, item, root))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve_value(env, item, root)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(env: &Environment<'_>, s: &str, root: &minijinja::Value) -> Result<Value> {
    if !is_template(s) {
        return Ok(Value::String(s.to_string()));
    }
    if let Some(expr) = single_expression(s) {
        let compiled = env
            .compile_expression(expr)
            .with_context(|| format!("compile expression {s:?}"))?;
        let result = compiled
            .eval(root)
            .with_context(|| format!("evaluate expression {s:?}"))?;
        return serde_json::to_value(&result).with_context(|| format!("convert result of {s:?}"));
    }
    let rendered = env
        .render_str(s, root)
        .with_context(|| format!("render template {s:?}"))?;
    Ok(Value::String(rendered))
}

fn is_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

/// The inner expression of a string that is exactly `{{ expr }}`.
fn single_expression(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// True when any string leaf of `value` is a template.
pub fn contains_expression(value: &Value) -> bool {
    match value {
        Value::String(s) => is_template(s),
        Value::Array(items) => items.iter().any(contains_expression),
        Value::Object(map) => map.values().any(contains_expression),
        _ => false,
    }
}
