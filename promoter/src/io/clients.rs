//! Contracts for the privileged collaborators a step runner may receive.
//!
//! Implementations live outside this crate (Kubernetes API, credential
//! stores). Tests use the in-memory versions in `test_support`.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::argocd::types::{AppKey, AppProject, AuditEvent};
use crate::io::expressions::ProjectSecrets;

/// Access to the platform's own resources.
pub trait KargoClient: Send + Sync {
    /// Secrets a project exposes to step configuration.
    fn project_secrets(&self, project: &str) -> Result<ProjectSecrets>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Git,
    Helm,
    Image,
    Generic,
}

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub ssh_private_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Repository credential lookup.
pub trait CredentialsDatabase: Send + Sync {
    fn get(
        &self,
        project: &str,
        credential_type: CredentialType,
        repo_url: &str,
    ) -> Result<Option<Credentials>>;
}

/// Access to Argo CD resources.
///
/// Applications are exchanged as raw objects so that fields unknown to this
/// crate survive a read-modify-write cycle.
pub trait ArgoCdClient: Send + Sync {
    fn get_application(&self, key: &AppKey) -> Result<Option<Value>>;

    fn get_app_project(&self, namespace: &str, name: &str) -> Result<Option<AppProject>>;

    /// Write `modified` over the live object. `original` is the object as it
    /// was read, so implementations can send only the difference.
    fn patch_application(&self, key: &AppKey, original: &Value, modified: &Value) -> Result<()>;

    fn record_event(&self, event: &AuditEvent) -> Result<()>;
}
