//! Test-only collaborators and builders.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::argocd::types::{AUTHORIZED_STAGE_ANNOTATION, AppKey, AppProject, AuditEvent};
use crate::core::merge::merge_values;
use crate::core::types::StepResult;
use crate::errors::TerminalError;
use crate::io::clients::{ArgoCdClient, KargoClient};
use crate::io::expressions::ProjectSecrets;
use crate::promote::Promotion;
use crate::registry::{PromotionStepRunner, StepContext};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One scripted reply of a [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(StepResult),
    /// Return an ordinary (retryable) error.
    Fail(String),
    /// Return a [`TerminalError`].
    Terminal(String),
}

/// Step runner replaying a fixed script. The last entry repeats forever.
pub struct ScriptedRunner {
    kind: String,
    script: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<StepContext>>,
    default_timeout: Option<Duration>,
    default_error_threshold: Option<u32>,
}

impl ScriptedRunner {
    pub fn new(kind: &str, script: Vec<Scripted>) -> Self {
        Self {
            kind: kind.to_string(),
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
            default_timeout: None,
            default_error_threshold: None,
        }
    }

    /// Runner that always succeeds with `output`.
    pub fn succeeding(kind: &str, output: Value) -> Self {
        Self::new(kind, vec![Scripted::Reply(StepResult::succeeded().with_output(output))])
    }

    /// Runner that always returns an error.
    pub fn erroring(kind: &str, message: &str) -> Self {
        Self::new(kind, vec![Scripted::Fail(message.to_string())])
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_default_error_threshold(mut self, threshold: u32) -> Self {
        self.default_error_threshold = Some(threshold);
        self
    }

    /// Number of times the runner was invoked.
    pub fn calls(&self) -> usize {
        lock(&self.seen).len()
    }

    /// Contexts of every invocation, in order.
    pub fn contexts(&self) -> Vec<StepContext> {
        lock(&self.seen).clone()
    }
}

impl PromotionStepRunner for ScriptedRunner {
    fn name(&self) -> &str {
        &self.kind
    }

    fn run(&self, ctx: &StepContext) -> Result<StepResult> {
        lock(&self.seen).push(ctx.clone());
        let next = {
            let mut script = lock(&self.script);
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match next {
            Some(Scripted::Reply(result)) => Ok(result),
            Some(Scripted::Fail(message)) => Err(anyhow!(message)),
            Some(Scripted::Terminal(message)) => Err(TerminalError::new(message).into()),
            None => Err(anyhow!("script for {} is empty", self.kind)),
        }
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    fn default_error_threshold(&self) -> Option<u32> {
        self.default_error_threshold
    }
}

/// Kargo client serving fixed project secrets.
#[derive(Debug, Default)]
pub struct FakeKargo {
    pub secrets: BTreeMap<String, ProjectSecrets>,
}

impl FakeKargo {
    pub fn with_secret(mut self, project: &str, secret: &str, key: &str, value: &str) -> Self {
        self.secrets
            .entry(project.to_string())
            .or_default()
            .entry(secret.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }
}

impl KargoClient for FakeKargo {
    fn project_secrets(&self, project: &str) -> Result<ProjectSecrets> {
        Ok(self.secrets.get(project).cloned().unwrap_or_default())
    }
}

/// In-memory Argo CD holding Applications as raw JSON.
#[derive(Debug, Default)]
pub struct FakeArgoCd {
    applications: Mutex<BTreeMap<AppKey, Value>>,
    projects: Mutex<BTreeMap<(String, String), AppProject>>,
    patches: Mutex<Vec<(AppKey, Value, Value)>>,
    events: Mutex<Vec<AuditEvent>>,
    fail_events: bool,
}

impl FakeArgoCd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `record_event` fail, to exercise best-effort event emission.
    pub fn failing_events(mut self) -> Self {
        self.fail_events = true;
        self
    }

    pub fn insert_application(&self, app: Value) {
        let key = AppKey::new(
            app["metadata"]["namespace"].as_str().unwrap_or_default(),
            app["metadata"]["name"].as_str().unwrap_or_default(),
        );
        lock(&self.applications).insert(key, app);
    }

    pub fn insert_project(&self, project: AppProject) {
        let key = (project.metadata.namespace.clone(), project.metadata.name.clone());
        lock(&self.projects).insert(key, project);
    }

    pub fn application(&self, key: &AppKey) -> Option<Value> {
        lock(&self.applications).get(key).cloned()
    }

    /// Merge `changes` into a stored Application, the way a controller would.
    pub fn update_application(&self, key: &AppKey, changes: Value) {
        if let Some(app) = lock(&self.applications).get_mut(key) {
            *app = merge_values(app, &changes);
        }
    }

    /// Every patch as `(key, original, modified)`.
    pub fn patches(&self) -> Vec<(AppKey, Value, Value)> {
        lock(&self.patches).clone()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }
}

impl ArgoCdClient for FakeArgoCd {
    fn get_application(&self, key: &AppKey) -> Result<Option<Value>> {
        Ok(self.application(key))
    }

    fn get_app_project(&self, namespace: &str, name: &str) -> Result<Option<AppProject>> {
        Ok(lock(&self.projects)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    fn patch_application(&self, key: &AppKey, original: &Value, modified: &Value) -> Result<()> {
        let mut applications = lock(&self.applications);
        let live = applications
            .get_mut(key)
            .ok_or_else(|| anyhow!("Application {key} not found"))?;
        *live = modified.clone();
        lock(&self.patches).push((key.clone(), original.clone(), modified.clone()));
        Ok(())
    }

    fn record_event(&self, event: &AuditEvent) -> Result<()> {
        if self.fail_events {
            return Err(anyhow!("event sink unavailable"));
        }
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Single-source Application authorized for `project:stage`.
pub fn application(namespace: &str, name: &str, authorized_stage: &str, repo_url: &str) -> Value {
    json!({
        "metadata": {
            "namespace": namespace,
            "name": name,
            "annotations": {AUTHORIZED_STAGE_ANNOTATION: authorized_stage},
        },
        "spec": {
            "project": "default",
            "source": {"repoURL": repo_url, "path": "deploy", "targetRevision": "main"},
            "destination": {"server": "https://kubernetes.default.svc", "namespace": name},
            "syncPolicy": {"syncOptions": ["CreateNamespace=true"]},
        },
        "status": {
            "sync": {"status": "Synced", "revision": "old"},
            "health": {"status": "Healthy"},
        },
    })
}

/// Empty AppProject named `name` in `namespace`.
pub fn app_project(namespace: &str, name: &str) -> AppProject {
    let mut project = AppProject::default();
    project.metadata.namespace = namespace.to_string();
    project.metadata.name = name.to_string();
    project
}

/// Promotion with deterministic identity and no prior state.
pub fn promotion(project: &str, stage: &str, id: &str) -> Promotion {
    Promotion {
        project: project.to_string(),
        stage: stage.to_string(),
        promotion_id: id.to_string(),
        ..Promotion::default()
    }
}
