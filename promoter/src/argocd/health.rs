//! Health of Argo CD Applications updated by a promotion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::argocd::types::Application;
use crate::core::types::HealthState;

/// Configuration of the `argocd-update` health check, produced by the step itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub apps: Vec<AppHealthCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppHealthCheck {
    pub name: String,
    pub namespace: String,
    /// Desired revision per source; `""` means no opinion.
    #[serde(default)]
    pub desired_revisions: Vec<String>,
}

/// Health of one Application, with the reasons it is not healthy.
#[derive(Debug, Clone, PartialEq)]
pub struct AppHealth {
    pub state: HealthState,
    pub issues: Vec<String>,
}

impl AppHealth {
    fn new(state: HealthState) -> Self {
        Self {
            state,
            issues: Vec::new(),
        }
    }

    fn with_issue(state: HealthState, issue: String) -> Self {
        Self {
            state,
            issues: vec![issue],
        }
    }
}

/// Map Argo CD's health status word to the platform's vocabulary.
pub fn map_health_status(status: &str) -> HealthState {
    match status {
        "" | "Progressing" | "Suspended" => HealthState::Progressing,
        "Healthy" => HealthState::Healthy,
        _ => HealthState::Unhealthy,
    }
}

/// Evaluate an Application's health against the revisions it should be at.
///
/// Error conditions win. When revisions are expected, an operation that is
/// still running, or finished less than `cooldown` ago, reports Progressing so
/// the caller looks again once Argo CD has caught up.
pub fn evaluate_app_health(
    app: &Application,
    desired_revisions: &[String],
    cooldown: Duration,
    now: DateTime<Utc>,
) -> AppHealth {
    let key = app.key();
    let errors: Vec<String> = app
        .status
        .conditions
        .iter()
        .filter(|condition| condition.is_error())
        .map(|condition| format!("{}: {}", condition.kind, condition.message))
        .collect();
    if !errors.is_empty() {
        return AppHealth::with_issue(
            HealthState::Unhealthy,
            format!("Argo CD Application {key} has errors: {}", errors.join("; ")),
        );
    }

    if desired_revisions.iter().any(|revision| !revision.is_empty()) {
        if let Some(operation) = &app.status.operation_state {
            let settled = match (operation.phase.is_completed(), operation.finished_at) {
                (false, _) => false,
                (true, Some(finished)) => now
                    .signed_duration_since(finished)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed >= cooldown),
                (true, None) => true,
            };
            if !settled {
                return AppHealth::with_issue(
                    HealthState::Progressing,
                    format!(
                        "waiting for Argo CD to settle after the last operation on Application {key}"
                    ),
                );
            }
        }

        let sync = &app.status.sync;
        let observed: Vec<&str> = if sync.revisions.is_empty() {
            vec![sync.revision.as_str()]
        } else {
            sync.revisions.iter().map(String::as_str).collect()
        };
        for (position, desired) in desired_revisions.iter().enumerate() {
            if desired.is_empty() {
                continue;
            }
            let seen = observed.get(position).copied().unwrap_or_default();
            if seen != desired.as_str() {
                return AppHealth::with_issue(
                    HealthState::Unhealthy,
                    format!(
                        "sync status revision {seen:?} of source {position} of Argo CD Application {key} does not match desired revision {desired:?}"
                    ),
                );
            }
        }
    }

    let health = &app.status.health;
    let state = map_health_status(&health.status);
    match state {
        HealthState::Healthy => AppHealth::new(state),
        _ if health.message.is_empty() => AppHealth::with_issue(
            state,
            format!("Argo CD Application {key} health is {:?}", health.status),
        ),
        _ => AppHealth::with_issue(
            state,
            format!(
                "Argo CD Application {key} health is {:?}: {}",
                health.status, health.message
            ),
        ),
    }
}

/// Status summary recorded in health-check output.
pub fn status_summary(app: &Application) -> Value {
    json!({
        "namespace": app.metadata.namespace,
        "name": app.metadata.name,
        "health": app.status.health,
        "sync": app.status.sync,
    })
}
