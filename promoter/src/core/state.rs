//! Shared state carried between the steps of one promotion attempt.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Step outputs keyed by step alias.
///
/// Reads are keyed lookups; iteration order is the alias order of the
/// underlying map and carries no meaning. Values are plain JSON trees, so a
/// [`State::deep_copy`] never shares structure with the original.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Map<String, Value>);

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the state that handlers may mutate freely.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    pub fn get(&self, alias: &str) -> Option<&Value> {
        self.0.get(alias)
    }

    /// Record (or replace) the output of the step with the given alias.
    pub fn set(&mut self, alias: impl Into<String>, output: Value) {
        self.0.insert(alias.into(), output);
    }

    /// Look up `key` inside the object recorded for `alias`.
    pub fn get_field(&self, alias: &str, key: &str) -> Option<&Value> {
        self.0.get(alias).and_then(|output| output.get(key))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for State {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
