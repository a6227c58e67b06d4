//! Artifact metadata ("freight") a promotion moves into a stage.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a piece of freight came from (e.g. `Warehouse/images`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FreightOrigin {
    pub kind: String,
    pub name: String,
}

impl FreightOrigin {
    pub fn warehouse(name: impl Into<String>) -> Self {
        Self {
            kind: "Warehouse".to_string(),
            name: name.into(),
        }
    }

    /// Stable key used to index a [`FreightCollection`].
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

impl fmt::Display for FreightOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.kind, self.name)
    }
}

/// A stage's request for freight from one origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreightRequest {
    pub origin: FreightOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCommit {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chart {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// One piece of freight: the artifacts produced together by an origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreightReference {
    pub name: String,
    pub origin: FreightOrigin,
    #[serde(default)]
    pub commits: Vec<GitCommit>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub charts: Vec<Chart>,
}

/// Freight being promoted, at most one piece per origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreightCollection {
    #[serde(default)]
    pub items: BTreeMap<String, FreightReference>,
}

impl FreightCollection {
    pub fn insert(&mut self, freight: FreightReference) {
        self.items.insert(freight.origin.key(), freight);
    }

    pub fn from_origin(&self, origin: &FreightOrigin) -> Option<&FreightReference> {
        self.items.get(&origin.key())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FreightReference> {
        self.items.values()
    }
}
