//! Shared deterministic types for promotion and health-check execution.
//!
//! These types define stable contracts between the engine, step runners and
//! callers. They carry no I/O handles and serialize to the same shape callers
//! persist between reconciliation passes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::duration;
use crate::core::state::State;

/// One entry of a user-defined promotion step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Registered step kind that executes this step.
    #[serde(rename = "uses")]
    pub kind: String,
    /// User-supplied alias; `step-<index>` when absent.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Kind-specific configuration, validated against the kind's schema.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<StepRetry>,
}

impl Step {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            alias: None,
            config: Value::Null,
            retry: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry(mut self, retry: StepRetry) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Per-step overrides of the runner's retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRetry {
    /// Wall-clock budget measured from the step's first start. Zero means unlimited.
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Consecutive failures tolerated before the promotion errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_threshold: Option<u32>,
}

/// Outcome reported by a step runner for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// The step finished; continue with the next one.
    Succeeded,
    /// The step is waiting on external state; resume this step next pass.
    Running,
    /// The step completed its work but the outcome was negative.
    Failed,
    /// The step could not complete its work.
    Errored,
}

/// Health-check work a step asks to be performed after promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckStep {
    #[serde(rename = "uses")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

/// Result of one step runner invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub status: StepStatus,
    pub message: Option<String>,
    /// Output recorded in shared state under the step's alias.
    pub output: Option<Value>,
    pub health_check: Option<HealthCheckStep>,
}

impl StepResult {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            message: None,
            output: None,
            health_check: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::new(StepStatus::Succeeded)
    }

    pub fn running(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Running).with_message(message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(StepStatus::Failed).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheckStep) -> Self {
        self.health_check = Some(health_check);
        self
    }
}

/// Execution bookkeeping for one step, persisted by the caller between passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionMetadata {
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
}

impl StepExecutionMetadata {
    pub fn started(alias: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            alias: alias.into(),
            status: None,
            message: None,
            started_at: Some(at),
            finished_at: None,
            error_count: 0,
        }
    }
}

/// Phase of a promotion pass as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionPhase {
    Succeeded,
    Running,
    Errored,
}

/// Outcome of one reconciliation pass over a step list.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionResult {
    pub status: PromotionPhase,
    /// Last diagnostic of the pass, if any.
    pub message: Option<String>,
    /// Index to resume from on the next pass (or the last step on success).
    pub current_step: usize,
    pub step_execution_metadata: Vec<StepExecutionMetadata>,
    pub state: State,
    /// Health checks collected from succeeded steps.
    pub health_check_steps: Vec<HealthCheckStep>,
}

/// Health vocabulary of the platform.
///
/// Variant order is the merge order: merging two states keeps the later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthState {
    NotApplicable,
    Healthy,
    Progressing,
    Unknown,
    Unhealthy,
}

impl HealthState {
    /// Keep the worse of two states.
    pub fn merge(self, other: HealthState) -> HealthState {
        self.max(other)
    }
}

/// Result of one health-check step.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckStepResult {
    pub status: HealthState,
    pub output: Option<Value>,
    pub issues: Vec<String>,
}

impl HealthCheckStepResult {
    pub fn new(status: HealthState) -> Self {
        Self {
            status,
            output: None,
            issues: Vec::new(),
        }
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Aggregated health of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    /// Per-step outputs, present only when at least one step produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<Value>>,
}
