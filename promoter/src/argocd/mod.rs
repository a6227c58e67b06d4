//! The `argocd-update` step: point Argo CD Applications at new revisions,
//! sync them, and report their health afterwards.
//!
//! Each pass reconciles every configured Application:
//!
//! 1. Load the Application and check that this stage may mutate it.
//! 2. Work out the desired revision of each source.
//! 3. Inspect the current operation. Someone else's running operation is
//!    waited on; this promotion's own operation is followed to completion.
//! 4. When a new operation is needed and the project's sync windows allow a
//!    manual sync, patch the Application with the new sources and operation.
//!
//! The worst operation phase across Applications decides the step's status.

pub mod config;
pub mod health;
pub mod operation;
pub mod revisions;
pub mod sources;
pub mod sync_windows;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::argocd::config::{AppUpdate, ArgoCdUpdateConfig};
use crate::argocd::health::{AppHealthCheck, HealthCheckConfig, evaluate_app_health, status_summary};
use crate::argocd::operation::{
    Initiator, UpdateDecision, aggregate_phases, authorize, must_perform_update, sync_application,
};
use crate::argocd::revisions::determine_desired_revisions;
use crate::argocd::sources::{FreightView, build_desired_sources};
use crate::argocd::sync_windows::manual_sync_permitted;
use crate::argocd::types::{AppKey, Application, OperationPhase};
use crate::core::types::{
    HealthCheckStep, HealthCheckStepResult, HealthState, StepResult, StepStatus,
};
use crate::errors::RegistryError;
use crate::io::clients::ArgoCdClient;
use crate::io::config::ArgoCdConfig;
use crate::registry::{
    HealthCheckContext, HealthCheckStepRunner, Permissions, PromotionStepRunner, Registry,
    StepContext,
};

pub const STEP_KIND: &str = "argocd-update";

const CONFIG_SCHEMA: &str = include_str!("../../schemas/argocd-update.json");
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Register the `argocd-update` promotion step and health check.
pub fn register(registry: &mut Registry, config: &ArgoCdConfig) -> Result<(), RegistryError> {
    let updater = Arc::new(ArgoCdUpdater::new(config.clone()));
    let permissions = Permissions {
        allow_argocd_client: true,
        ..Permissions::default()
    };
    registry.register_promotion_step_runner(updater.clone(), permissions)?;
    registry.register_health_check_step_runner(updater, permissions)
}

pub struct ArgoCdUpdater {
    config: ArgoCdConfig,
}

/// Where one Application stands after a pass.
struct AppOutcome {
    phase: OperationPhase,
    message: Option<String>,
    health_check: AppHealthCheck,
}

impl ArgoCdUpdater {
    pub fn new(config: ArgoCdConfig) -> Self {
        Self { config }
    }

    fn app_key(&self, update: &AppUpdate) -> AppKey {
        let namespace = update
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(self.config.default_namespace.as_str());
        AppKey::new(namespace, &update.name)
    }

    #[instrument(skip_all, fields(app = %key))]
    fn reconcile_app(
        &self,
        ctx: &StepContext,
        client: &dyn ArgoCdClient,
        key: &AppKey,
        update: &AppUpdate,
    ) -> Result<AppOutcome> {
        let (live, app) = load_application(client, key)?;
        authorize(&app, &ctx.project, &ctx.stage)?;

        let desired = determine_desired_revisions(&app, &update.sources, &ctx.shared_state)
            .with_context(|| format!("determine desired revisions for Argo CD Application {key}"))?;
        let health_check = AppHealthCheck {
            name: key.name.clone(),
            namespace: key.namespace.clone(),
            desired_revisions: desired.clone(),
        };
        let outcome = |phase, message| AppOutcome {
            phase,
            message,
            health_check: health_check.clone(),
        };

        let initiator = Initiator {
            username: &self.config.operation_initiator,
            project: &ctx.project,
            stage: &ctx.stage,
            promotion: &ctx.promotion,
        };
        match must_perform_update(&app, &desired, initiator) {
            UpdateDecision::Wait { phase, reason } => {
                debug!(%phase, %reason, "waiting on foreign operation");
                Ok(outcome(phase, Some(format!("Argo CD Application {key}: {reason}"))))
            }
            UpdateDecision::InProgress(phase) => Ok(outcome(
                phase,
                Some(format!("waiting for operation on Argo CD Application {key} to complete")),
            )),
            UpdateDecision::Complete(phase) => {
                let message = match phase {
                    OperationPhase::Failed | OperationPhase::Error => {
                        let detail = app
                            .status
                            .operation_state
                            .as_ref()
                            .map(|state| state.message.as_str())
                            .unwrap_or_default();
                        Some(format!("operation on Argo CD Application {key} ended with phase {phase}: {detail}"))
                    }
                    _ => None,
                };
                Ok(outcome(phase, message))
            }
            UpdateDecision::Update { reason } => {
                if let Some(reason) = &reason {
                    debug!(%reason, "existing operation cannot be reused");
                }
                if !self.sync_permitted(client, &app)? {
                    info!("sync window blocks manual sync");
                    return Ok(outcome(
                        OperationPhase::Running,
                        Some(format!(
                            "waiting for a sync window to allow manual sync of Argo CD Application {key}"
                        )),
                    ));
                }
                let desired_sources = build_desired_sources(
                    &app,
                    &update.sources,
                    &desired,
                    FreightView {
                        requests: &ctx.freight_requests,
                        collection: &ctx.freight,
                    },
                )?;
                sync_application(client, key, &live, &app, &desired_sources, &desired, initiator)?;
                Ok(outcome(
                    OperationPhase::Running,
                    Some(format!("initiated sync of Argo CD Application {key}")),
                ))
            }
        }
    }

    fn sync_permitted(&self, client: &dyn ArgoCdClient, app: &Application) -> Result<bool> {
        let project = if app.spec.project.is_empty() {
            "default"
        } else {
            app.spec.project.as_str()
        };
        let namespace = &app.metadata.namespace;
        let app_project = client
            .get_app_project(namespace, project)
            .with_context(|| format!("get Argo CD AppProject {namespace}/{project}"))?
            .ok_or_else(|| anyhow!("Argo CD AppProject {namespace}/{project} not found"))?;
        manual_sync_permitted(&app_project.spec.sync_windows, app, Utc::now())
            .with_context(|| format!("evaluate sync windows of AppProject {namespace}/{project}"))
    }
}

fn load_application(client: &dyn ArgoCdClient, key: &AppKey) -> Result<(Value, Application)> {
    let live = client
        .get_application(key)
        .with_context(|| format!("get Argo CD Application {key}"))?
        .ok_or_else(|| anyhow!("Argo CD Application {key} not found"))?;
    let mut app: Application = serde_json::from_value(live.clone())
        .with_context(|| format!("decode Argo CD Application {key}"))?;
    if app.metadata.namespace.is_empty() {
        app.metadata.namespace = key.namespace.clone();
    }
    if app.metadata.name.is_empty() {
        app.metadata.name = key.name.clone();
    }
    Ok((live, app))
}

impl PromotionStepRunner for ArgoCdUpdater {
    fn name(&self) -> &str {
        STEP_KIND
    }

    #[instrument(skip_all, fields(step = %ctx.alias, promotion = %ctx.promotion))]
    fn run(&self, ctx: &StepContext) -> Result<StepResult> {
        let config: ArgoCdUpdateConfig =
            serde_json::from_value(ctx.config.clone()).context("decode argocd-update config")?;
        let client = ctx.clients.argocd()?;

        let mut phases = Vec::with_capacity(config.apps.len());
        let mut messages = Vec::new();
        let mut health_checks = Vec::with_capacity(config.apps.len());
        for update in &config.apps {
            let key = self.app_key(update);
            let outcome = self.reconcile_app(ctx, client, &key, update)?;
            phases.push(outcome.phase);
            messages.extend(outcome.message);
            health_checks.push(outcome.health_check);
        }

        match aggregate_phases(&phases)? {
            StepStatus::Succeeded => {
                let health_check = HealthCheckStep {
                    kind: STEP_KIND.to_string(),
                    config: serde_json::to_value(HealthCheckConfig {
                        apps: health_checks,
                    })?,
                };
                Ok(StepResult::succeeded().with_health_check(health_check))
            }
            StepStatus::Running => Ok(StepResult::running(if messages.is_empty() {
                "waiting for Argo CD operations to complete".to_string()
            } else {
                messages.join("; ")
            })),
            status => Ok(StepResult::new(status).with_message(messages.join("; "))),
        }
    }

    fn config_schema(&self) -> Option<Value> {
        serde_json::from_str(CONFIG_SCHEMA).ok()
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(DEFAULT_TIMEOUT)
    }
}

impl HealthCheckStepRunner for ArgoCdUpdater {
    fn name(&self) -> &str {
        STEP_KIND
    }

    #[instrument(skip_all, fields(stage = %ctx.stage))]
    fn check(&self, ctx: &HealthCheckContext) -> HealthCheckStepResult {
        let config: HealthCheckConfig = match serde_json::from_value(ctx.config.clone()) {
            Ok(config) => config,
            Err(err) => {
                return HealthCheckStepResult::new(HealthState::Unhealthy)
                    .with_issue(format!("invalid argocd-update health check config: {err}"));
            }
        };
        let client = match ctx.clients.argocd() {
            Ok(client) => client,
            Err(err) => return HealthCheckStepResult::new(HealthState::Unknown).with_issue(err.to_string()),
        };

        let now = Utc::now();
        let mut result = HealthCheckStepResult::new(HealthState::Healthy);
        let mut summaries = Vec::with_capacity(config.apps.len());
        for check in &config.apps {
            let key = AppKey::new(&check.namespace, &check.name);
            let app = match load_application(client, &key) {
                Ok((_, app)) => app,
                Err(err) => {
                    result.status = result.status.merge(HealthState::Unknown);
                    result.issues.push(format!("{err:#}"));
                    continue;
                }
            };
            let health = evaluate_app_health(
                &app,
                &check.desired_revisions,
                self.config.health_cooldown(),
                now,
            );
            result.status = result.status.merge(health.state);
            result.issues.extend(health.issues);
            summaries.push(status_summary(&app));
        }
        result.with_output(json!({ "applicationStatuses": summaries }))
    }
}
