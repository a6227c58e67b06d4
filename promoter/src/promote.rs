//! Orchestration of one reconciliation pass over a promotion's steps.
//!
//! A pass starts at `start_from_step`, runs each step through its registered
//! runner and folds the result into shared state and execution metadata. It
//! ends when every step succeeded, when a step must be resumed on a later
//! pass, or when a step fails for good.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::alias::{default_alias, resolve_alias};
use crate::core::duration::format_duration;
use crate::core::freight::{FreightCollection, FreightRequest};
use crate::core::policy::{
    Cancellation, FailureVerdict, effective_error_threshold, effective_timeout, evaluate_failure,
    timed_out,
};
use crate::core::state::State;
use crate::core::types::{
    HealthCheckStep, PromotionPhase, PromotionResult, Step, StepExecutionMetadata, StepResult,
    StepStatus,
};
use crate::errors::{PromotionError, is_terminal};
use crate::io::config::PromoterConfig;
use crate::io::expressions::{ExpressionContext, ProjectSecrets, resolve_config};
use crate::registry::{Clients, PromotionRegistration, Registry, StepContext};

/// One promotion attempt, re-supplied by the caller on every pass.
#[derive(Debug, Clone, Default)]
pub struct Promotion {
    /// Working directory shared by the steps. A temporary one is created
    /// (and removed at the end of the pass) when absent.
    pub work_dir: Option<PathBuf>,
    pub project: String,
    pub stage: String,
    pub promotion_id: String,
    pub freight_requests: Vec<FreightRequest>,
    pub freight: FreightCollection,
    pub vars: Map<String, Value>,
    pub start_from_step: usize,
    pub state: State,
    pub step_execution_metadata: Vec<StepExecutionMetadata>,
}

/// Runs promotion passes and health checks against a registry.
pub struct Engine {
    registry: Arc<Registry>,
    clients: Clients,
    config: PromoterConfig,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, clients: Clients, config: PromoterConfig) -> Self {
        Self {
            registry,
            clients,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn clients(&self) -> &Clients {
        &self.clients
    }

    /// Execute one pass over `steps`.
    ///
    /// Step failures are reported through the returned result. `Err` is
    /// reserved for failures to set up the pass itself (working directory,
    /// project secrets).
    #[instrument(skip_all, fields(project = %promotion.project, stage = %promotion.stage, promotion = %promotion.promotion_id))]
    pub fn promote(
        &self,
        cancellation: &Cancellation,
        promotion: Promotion,
        steps: &[Step],
    ) -> Result<PromotionResult> {
        let Promotion {
            work_dir,
            project,
            stage,
            promotion_id,
            freight_requests,
            freight,
            vars,
            start_from_step,
            state,
            step_execution_metadata,
        } = promotion;

        let mut temp_dir = None;
        let work_dir = match work_dir {
            Some(dir) => dir,
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("promotion-")
                    .tempdir()
                    .context("create promotion working directory")?;
                let path = dir.path().to_path_buf();
                temp_dir = Some(dir);
                path
            }
        };

        let secrets = match &self.clients.kargo {
            Some(client) => client
                .project_secrets(&project)
                .with_context(|| format!("load secrets for project {project:?}"))?,
            None => ProjectSecrets::new(),
        };

        let mut pass = Pass {
            state: state.deep_copy(),
            metadata: step_execution_metadata,
            health_checks: Vec::new(),
        };

        info!(
            start_from_step,
            steps = steps.len(),
            work_dir = %work_dir.display(),
            "starting promotion pass"
        );

        for (index, step) in steps.iter().enumerate().skip(start_from_step) {
            if cancellation.is_cancelled() {
                warn!(step = index, "promotion cancelled");
                return Ok(pass.finish(
                    PromotionPhase::Errored,
                    index,
                    Some(PromotionError::Cancelled.to_string()),
                ));
            }

            let alias = match resolve_alias(step, index) {
                Ok(alias) => alias,
                Err(err) => return Ok(pass.fatal(index, None, err.to_string())),
            };
            let Some(registration) = self.registry.promotion_step_runner(&step.kind) else {
                let err = PromotionError::UnknownStepKind {
                    kind: step.kind.clone(),
                };
                return Ok(pass.fatal(index, None, err.to_string()));
            };

            pass.ensure_metadata(steps, index, &alias);

            let config = match self.prepare_config(
                step,
                registration,
                ExpressionContext {
                    project: &project,
                    stage: &stage,
                    promotion: &promotion_id,
                    outputs: &pass.state,
                    secrets: &secrets,
                    vars: &vars,
                },
            ) {
                Ok(config) => config,
                Err(err) => return Ok(pass.fatal(index, Some(&alias), err.to_string())),
            };

            let ctx = StepContext {
                work_dir: work_dir.clone(),
                project: project.clone(),
                stage: stage.clone(),
                promotion: promotion_id.clone(),
                alias: alias.clone(),
                config,
                shared_state: pass.state.deep_copy(),
                freight_requests: freight_requests.clone(),
                freight: freight.clone(),
                clients: self.clients.authorized(registration.permissions),
                cancellation: cancellation.clone(),
            };

            debug!(step = index, %alias, kind = %step.kind, "running step");
            let (result, run_error) = match registration.runner.run(&ctx) {
                Ok(result) => (result, None),
                Err(err) => {
                    let message = format!("step {index} ({}) errored: {err:#}", step.kind);
                    (StepResult::new(StepStatus::Errored).with_message(message), Some(err))
                }
            };

            if let Some(output) = &result.output {
                pass.state.set(alias.clone(), output.clone());
            }

            let threshold = effective_error_threshold(
                step.retry.as_ref().and_then(|r| r.error_threshold),
                registration.runner.default_error_threshold(),
                self.config.default_error_threshold,
            );
            let timeout = effective_timeout(
                step.retry.as_ref().and_then(|r| r.timeout),
                registration.runner.default_timeout(),
            );

            let now = Utc::now();
            let meta = &mut pass.metadata[index];
            let started_at = *meta.started_at.get_or_insert(now);
            meta.status = Some(result.status);

            match result.status {
                StepStatus::Succeeded => {
                    meta.error_count = 0;
                    meta.finished_at = Some(now);
                    meta.message = result.message.clone();
                    if let Some(health_check) = result.health_check {
                        pass.health_checks.push(health_check);
                    }
                    debug!(step = index, %alias, "step succeeded");
                }
                StepStatus::Running => {
                    meta.error_count = 0;
                    if timed_out(started_at, timeout, now) {
                        let message = timeout_message(&alias, timeout);
                        meta.finished_at = Some(now);
                        meta.message = Some(message.clone());
                        warn!(step = index, %alias, "step timed out while waiting");
                        return Ok(pass.finish(PromotionPhase::Errored, index, Some(message)));
                    }
                    meta.message = result.message.clone();
                    info!(step = index, %alias, message = ?result.message, "step is waiting");
                    return Ok(pass.finish(PromotionPhase::Running, index, result.message));
                }
                StepStatus::Failed | StepStatus::Errored => {
                    meta.error_count += 1;
                    let message = result
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("step {alias:?} failed"));

                    let verdict = if run_error.as_ref().is_some_and(is_terminal) {
                        FailureVerdict::ThresholdReached
                    } else {
                        evaluate_failure(meta.error_count, threshold, started_at, timeout, now)
                    };
                    match verdict {
                        FailureVerdict::ThresholdReached => {
                            meta.finished_at = Some(now);
                            meta.message = Some(message.clone());
                            warn!(step = index, %alias, error_count = meta.error_count, threshold, %message, "step failed");
                            return Ok(pass.finish(PromotionPhase::Errored, index, Some(message)));
                        }
                        FailureVerdict::TimedOut => {
                            let message = timeout_message(&alias, timeout);
                            meta.finished_at = Some(now);
                            meta.message = Some(message.clone());
                            warn!(step = index, %alias, "step timed out");
                            return Ok(pass.finish(PromotionPhase::Errored, index, Some(message)));
                        }
                        FailureVerdict::Retry => {
                            let message = format!("{message}; step will be retried");
                            meta.message = Some(message.clone());
                            warn!(step = index, %alias, error_count = meta.error_count, threshold, "step failed; will retry");
                            return Ok(pass.finish(PromotionPhase::Running, index, Some(message)));
                        }
                    }
                }
            }
        }

        let last = steps.len().saturating_sub(1);
        info!(steps = steps.len(), "promotion pass succeeded");
        let result = pass.finish(PromotionPhase::Succeeded, last, None);
        drop(temp_dir);
        Ok(result)
    }

    /// Resolve expressions in a step's config and validate it against the kind's schema.
    fn prepare_config(
        &self,
        step: &Step,
        registration: &PromotionRegistration,
        ctx: ExpressionContext<'_>,
    ) -> Result<Value, PromotionError> {
        let raw = match &step.config {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        let config = resolve_config(&raw, ctx).map_err(|err| PromotionError::ConfigResolution {
            kind: step.kind.clone(),
            reason: format!("{err:#}"),
        })?;
        if let Some(schema) = &registration.schema {
            let problems = schema.problems(&config);
            if !problems.is_empty() {
                return Err(PromotionError::InvalidConfig {
                    kind: step.kind.clone(),
                    problems,
                });
            }
        }
        Ok(config)
    }
}

fn timeout_message(alias: &str, timeout: Option<std::time::Duration>) -> String {
    match timeout {
        Some(timeout) => format!("step {alias:?} timed out after {}", format_duration(timeout)),
        None => format!("step {alias:?} timed out"),
    }
}

/// Mutable bookkeeping of a pass in progress.
struct Pass {
    state: State,
    metadata: Vec<StepExecutionMetadata>,
    health_checks: Vec<HealthCheckStep>,
}

impl Pass {
    /// Make sure metadata exists for every step up to and including `index`.
    fn ensure_metadata(&mut self, steps: &[Step], index: usize, alias: &str) {
        let now = Utc::now();
        while self.metadata.len() <= index {
            let position = self.metadata.len();
            let entry_alias = if position == index {
                alias.to_string()
            } else {
                resolve_alias(&steps[position], position).unwrap_or_else(|_| default_alias(position))
            };
            self.metadata
                .push(StepExecutionMetadata::started(entry_alias, now));
        }
        self.metadata[index].alias = alias.to_string();
    }

    /// Abort on a configuration error, recording it against the step when possible.
    fn fatal(&mut self, index: usize, alias: Option<&str>, message: String) -> PromotionResult {
        warn!(step = index, %message, "promotion aborted");
        if let Some(alias) = alias
            && let Some(meta) = self.metadata.get_mut(index)
        {
            meta.alias = alias.to_string();
            meta.status = Some(StepStatus::Errored);
            meta.message = Some(message.clone());
            meta.finished_at = Some(Utc::now());
        }
        self.finish(PromotionPhase::Errored, index, Some(message))
    }

    fn finish(
        &mut self,
        status: PromotionPhase,
        current_step: usize,
        message: Option<String>,
    ) -> PromotionResult {
        PromotionResult {
            status,
            message,
            current_step,
            step_execution_metadata: std::mem::take(&mut self.metadata),
            state: std::mem::take(&mut self.state),
            health_check_steps: std::mem::take(&mut self.health_checks),
        }
    }
}
