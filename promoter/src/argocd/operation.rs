//! Deciding whether an Application needs a new sync operation, and starting one.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::argocd::types::{
    AUTHORIZED_STAGE_ANNOTATION, AppKey, Application, ApplicationSource, AuditEvent, Info,
    Operation, OperationInitiator, OperationPhase, PROMOTION_INFO_KEY, REFRESH_ANNOTATION,
    SyncOperation,
};
use crate::core::glob::glob_match;
use crate::core::merge::merge_values;
use crate::core::types::StepStatus;
use crate::errors::TerminalError;
use crate::io::clients::ArgoCdClient;

const WAITING_FOR_OPERATION: &str = "waiting for operation to complete";
const SYNC_REASON: &str = "Promotion triggered a sync of this Application resource.";

/// Identity of the promotion asking for an update.
#[derive(Debug, Clone, Copy)]
pub struct Initiator<'a> {
    /// Username stamped on operations this engine starts.
    pub username: &'a str,
    pub project: &'a str,
    pub stage: &'a str,
    pub promotion: &'a str,
}

/// Outcome of inspecting an Application's current operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Start a new operation. `reason` explains why an existing one is not reused.
    Update { reason: Option<String> },
    /// Someone else's operation is still running.
    Wait { phase: OperationPhase, reason: String },
    /// This promotion's operation is still running.
    InProgress(OperationPhase),
    /// This promotion's operation finished at the desired revisions.
    Complete(OperationPhase),
}

impl UpdateDecision {
    pub fn phase(&self) -> Option<OperationPhase> {
        match self {
            UpdateDecision::Update { .. } => None,
            UpdateDecision::Wait { phase, .. }
            | UpdateDecision::InProgress(phase)
            | UpdateDecision::Complete(phase) => Some(*phase),
        }
    }

    pub fn must_update(&self) -> bool {
        matches!(self, UpdateDecision::Update { .. })
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            UpdateDecision::Update { reason } => reason.as_deref(),
            UpdateDecision::Wait { reason, .. } => Some(reason),
            UpdateDecision::InProgress(_) | UpdateDecision::Complete(_) => None,
        }
    }
}

/// Decide whether `app` needs a new operation to reach `desired_revisions`.
pub fn must_perform_update(
    app: &Application,
    desired_revisions: &[String],
    initiator: Initiator<'_>,
) -> UpdateDecision {
    let Some(state) = &app.status.operation_state else {
        return UpdateDecision::Update { reason: None };
    };
    let phase = state.phase;
    let operation = &state.operation;

    let foreign = if operation.initiated_by.username != initiator.username {
        Some(format!(
            "current operation was initiated by {:?} and not by {:?}",
            operation.initiated_by.username, initiator.username
        ))
    } else if operation.info_value(PROMOTION_INFO_KEY) != Some(initiator.promotion) {
        Some(format!(
            "current operation was not initiated for promotion {:?}",
            initiator.promotion
        ))
    } else {
        None
    };
    if let Some(owner) = foreign {
        if !phase.is_completed() {
            return UpdateDecision::Wait {
                phase,
                reason: format!("{owner}: {WAITING_FOR_OPERATION}"),
            };
        }
        return UpdateDecision::Update {
            reason: Some(format!("{owner} and has finished")),
        };
    }

    if !phase.is_completed() {
        return UpdateDecision::InProgress(phase);
    }

    let Some(result) = &state.sync_result else {
        return UpdateDecision::Update {
            reason: Some("operation completed without a sync result".to_string()),
        };
    };

    if desired_revisions.is_empty() {
        return UpdateDecision::Complete(phase);
    }

    let observed: Vec<&str> = if result.revisions.is_empty() {
        vec![result.revision.as_str()]
    } else {
        result.revisions.iter().map(String::as_str).collect()
    };
    for (position, desired) in desired_revisions.iter().enumerate() {
        if desired.is_empty() {
            continue;
        }
        let seen = observed.get(position).copied().unwrap_or_default();
        if seen != desired.as_str() {
            return UpdateDecision::Update {
                reason: Some(format!(
                    "sync result revision {seen:?} of source {position} does not match desired revision {desired:?}"
                )),
            };
        }
    }
    UpdateDecision::Complete(phase)
}

/// Map the worst phase among several Applications to a step status.
///
/// `Succeeded < Running/Terminating < Failed/Error`.
pub fn aggregate_phases(phases: &[OperationPhase]) -> Result<StepStatus> {
    let Some(worst) = phases.iter().copied().max_by_key(|phase| phase.severity()) else {
        bail!("no Argo CD operation phases to aggregate");
    };
    Ok(match worst {
        OperationPhase::Succeeded => StepStatus::Succeeded,
        OperationPhase::Running | OperationPhase::Terminating => StepStatus::Running,
        OperationPhase::Failed | OperationPhase::Error => StepStatus::Failed,
    })
}

/// Fail unless the Application names `<project>:<stage>` as allowed to mutate it.
pub fn authorize(app: &Application, project: &str, stage: &str) -> Result<()> {
    let key = app.key();
    let Some(allowed) = app.metadata.annotations.get(AUTHORIZED_STAGE_ANNOTATION) else {
        return Err(TerminalError::new(format!(
            "Argo CD Application {key} does not permit mutation by any stage: annotation {AUTHORIZED_STAGE_ANNOTATION} is missing"
        ))
        .into());
    };
    let Some((allowed_project, allowed_stage)) = allowed.split_once(':') else {
        return Err(TerminalError::new(format!(
            "Argo CD Application {key} has malformed annotation {AUTHORIZED_STAGE_ANNOTATION}: {allowed:?}"
        ))
        .into());
    };
    let permitted = glob_match(allowed_project, project)
        .and_then(|project_ok| Ok(project_ok && glob_match(allowed_stage, stage)?))
        .map_err(|err| {
            TerminalError::new(format!(
                "Argo CD Application {key} has malformed annotation {AUTHORIZED_STAGE_ANNOTATION}: {err:#}"
            ))
        })?;
    if !permitted {
        return Err(TerminalError::new(format!(
            "Argo CD Application {key} does not permit mutation by stage {project}:{stage}"
        ))
        .into());
    }
    Ok(())
}

/// Revisions a new operation syncs to, one per desired source.
fn sync_revisions(desired_sources: &[ApplicationSource], desired_revisions: &[String]) -> Vec<String> {
    desired_sources
        .iter()
        .enumerate()
        .map(|(position, source)| {
            desired_revisions
                .get(position)
                .filter(|revision| !revision.is_empty())
                .cloned()
                .unwrap_or_else(|| source.target_revision.clone())
        })
        .collect()
}

/// Sync operation stamped with the engine's identity and the promotion.
pub fn build_sync_operation(
    app: &Application,
    desired_sources: &[ApplicationSource],
    desired_revisions: &[String],
    initiator: Initiator<'_>,
) -> Operation {
    let revisions = sync_revisions(desired_sources, desired_revisions);
    let mut sync = SyncOperation::default();
    if app.spec.has_multiple_sources() {
        sync.revisions = revisions;
    } else {
        sync.revision = revisions.into_iter().next().unwrap_or_default();
    }
    let policy = app.spec.sync_policy.as_ref();
    sync.sync_options = policy.map(|p| p.sync_options.clone()).unwrap_or_default();

    Operation {
        sync: Some(sync),
        initiated_by: OperationInitiator {
            username: initiator.username.to_string(),
            automated: false,
        },
        info: vec![
            Info {
                name: "Reason".to_string(),
                value: SYNC_REASON.to_string(),
            },
            Info {
                name: PROMOTION_INFO_KEY.to_string(),
                value: initiator.promotion.to_string(),
            },
        ],
        retry: policy.and_then(|p| p.retry.clone()),
    }
}

/// Changes written to the live Application to start `operation`.
///
/// `status.operationState` is cleared so a stale state left by a previous
/// operation cannot hide the new one.
pub fn build_patch(
    app: &Application,
    desired_sources: &[ApplicationSource],
    operation: &Operation,
) -> Result<Value> {
    let sources = if app.spec.has_multiple_sources() {
        json!({ "sources": serde_json::to_value(desired_sources)? })
    } else {
        let source = desired_sources.first().cloned().unwrap_or_default();
        json!({ "source": serde_json::to_value(source)? })
    };
    Ok(json!({
        "metadata": {"annotations": {REFRESH_ANNOTATION: "hard"}},
        "spec": sources,
        "operation": serde_json::to_value(operation)?,
        "status": {"operationState": null},
    }))
}

/// Start a sync: merge the patch into the live object, write it, and record an event.
#[instrument(skip_all, fields(app = %key))]
pub fn sync_application(
    client: &dyn ArgoCdClient,
    key: &AppKey,
    live: &Value,
    app: &Application,
    desired_sources: &[ApplicationSource],
    desired_revisions: &[String],
    initiator: Initiator<'_>,
) -> Result<()> {
    let operation = build_sync_operation(app, desired_sources, desired_revisions, initiator);
    let patch = build_patch(app, desired_sources, &operation)?;
    let modified = merge_values(live, &patch);
    client
        .patch_application(key, live, &modified)
        .with_context(|| format!("patch Argo CD Application {key}"))?;

    let revisions = operation
        .sync
        .as_ref()
        .map(|sync| {
            if sync.revisions.is_empty() {
                sync.revision.clone()
            } else {
                sync.revisions.join(", ")
            }
        })
        .unwrap_or_default();
    info!(%revisions, "started sync operation");

    let event = AuditEvent {
        application: key.clone(),
        reason: "OperationStarted".to_string(),
        message: format!("initiated sync to {revisions}"),
        annotations: BTreeMap::from([
            ("kargo.akuity.io/project".to_string(), initiator.project.to_string()),
            ("kargo.akuity.io/stage".to_string(), initiator.stage.to_string()),
            (PROMOTION_INFO_KEY.to_string(), initiator.promotion.to_string()),
            ("kargo.akuity.io/initiator".to_string(), initiator.username.to_string()),
        ]),
    };
    if let Err(err) = client.record_event(&event) {
        warn!(error = ?err, "failed to record sync event");
    }
    Ok(())
}
