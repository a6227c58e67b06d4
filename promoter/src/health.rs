//! Aggregating the health checks collected from a promotion's steps.

use tracing::{debug, instrument, warn};

use crate::core::policy::Cancellation;
use crate::core::types::{Health, HealthCheckStep, HealthState};
use crate::promote::Engine;
use crate::registry::HealthCheckContext;

/// The stage whose health is being checked.
#[derive(Debug, Clone, Copy)]
pub struct HealthTarget<'a> {
    pub project: &'a str,
    pub stage: &'a str,
}

impl Engine {
    /// Run `steps` in order and merge their results into one [`Health`].
    ///
    /// An empty list is `NotApplicable`. Unknown step kinds degrade the result
    /// to `Unknown` instead of aborting. Cancellation stops the pass and merges
    /// `Unknown` into whatever was already observed.
    #[instrument(skip_all, fields(project = %target.project, stage = %target.stage))]
    pub fn check_health(
        &self,
        cancellation: &Cancellation,
        target: HealthTarget<'_>,
        steps: &[HealthCheckStep],
    ) -> Health {
        let mut status = HealthState::NotApplicable;
        let mut issues = Vec::new();
        let mut outputs = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            if cancellation.is_cancelled() {
                warn!(step = index, "health check cancelled");
                status = status.merge(HealthState::Unknown);
                issues.push("health check cancelled".to_string());
                break;
            }

            let Some(registration) = self.registry().health_check_step_runner(&step.kind) else {
                status = status.merge(HealthState::Unknown);
                issues.push(format!(
                    "no health check runner registered for step kind {:?}",
                    step.kind
                ));
                continue;
            };

            let ctx = HealthCheckContext {
                project: target.project.to_string(),
                stage: target.stage.to_string(),
                config: step.config.clone(),
                clients: self.clients().authorized(registration.permissions),
            };
            let result = registration.runner.check(&ctx);
            debug!(step = index, kind = %step.kind, status = ?result.status, "health check finished");

            status = status.merge(result.status);
            issues.extend(result.issues.into_iter().filter(|issue| !issue.is_empty()));
            if let Some(output) = result.output.filter(|output| !output.is_null()) {
                outputs.push(output);
            }
        }

        Health {
            status,
            issues,
            output: (!outputs.is_empty()).then_some(outputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::{Value, json};

    use crate::core::types::HealthCheckStepResult;
    use crate::io::config::PromoterConfig;
    use crate::registry::{Clients, HealthCheckStepRunner, Permissions, Registry};

    /// Reports the state named in its config.
    struct Reporter;

    impl HealthCheckStepRunner for Reporter {
        fn name(&self) -> &str {
            "report"
        }

        fn check(&self, ctx: &HealthCheckContext) -> HealthCheckStepResult {
            let state: HealthState =
                serde_json::from_value(ctx.config["state"].clone()).unwrap_or(HealthState::Unknown);
            let mut result = HealthCheckStepResult::new(state);
            if let Some(issue) = ctx.config.get("issue").and_then(Value::as_str) {
                result = result.with_issue(issue);
            }
            if let Some(output) = ctx.config.get("output") {
                result = result.with_output(output.clone());
            }
            result
        }
    }

    fn engine() -> Engine {
        let mut registry = Registry::new();
        registry
            .register_health_check_step_runner(Arc::new(Reporter), Permissions::default())
            .expect("register");
        Engine::new(Arc::new(registry), Clients::default(), PromoterConfig::default())
    }

    fn report(config: Value) -> HealthCheckStep {
        HealthCheckStep {
            kind: "report".to_string(),
            config,
        }
    }

    const TARGET: HealthTarget<'static> = HealthTarget {
        project: "demo",
        stage: "prod",
    };

    #[test]
    fn empty_list_is_not_applicable() {
        let health = engine().check_health(&Cancellation::new(), TARGET, &[]);
        assert_eq!(health.status, HealthState::NotApplicable);
        assert!(health.output.is_none());
    }

    #[test]
    fn worst_state_wins_and_issues_accumulate() {
        let steps = vec![
            report(json!({"state": "Healthy", "output": {"a": 1}})),
            report(json!({"state": "Progressing", "issue": "rolling out"})),
            report(json!({"state": "Healthy", "issue": ""})),
        ];
        let health = engine().check_health(&Cancellation::new(), TARGET, &steps);
        assert_eq!(health.status, HealthState::Progressing);
        assert_eq!(health.issues, vec!["rolling out".to_string()]);
        assert_eq!(health.output, Some(vec![json!({"a": 1})]));
    }

    #[test]
    fn unknown_kinds_degrade_to_unknown() {
        let steps = vec![
            HealthCheckStep {
                kind: "mystery".to_string(),
                config: Value::Null,
            },
            report(json!({"state": "Healthy"})),
        ];
        let health = engine().check_health(&Cancellation::new(), TARGET, &steps);
        assert_eq!(health.status, HealthState::Unknown);
        assert!(health.issues[0].contains("mystery"));
    }

    #[test]
    fn cancellation_merges_unknown_and_stops() {
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let steps = vec![report(json!({"state": "Unhealthy"}))];
        let health = engine().check_health(&cancellation, TARGET, &steps);
        assert_eq!(health.status, HealthState::Unknown);
        assert_eq!(health.issues, vec!["health check cancelled".to_string()]);
    }
}
