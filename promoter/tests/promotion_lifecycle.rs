//! Multi-pass promotion scenarios driven through the public engine API.
//!
//! Each pass feeds the previous result (resume index, state and step
//! metadata) back in, the way a controller persists promotions between
//! reconciliations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use promoter::core::policy::Cancellation;
use promoter::core::types::{
    HealthCheckStep, PromotionPhase, PromotionResult, Step, StepExecutionMetadata, StepResult,
    StepRetry, StepStatus,
};
use promoter::io::config::PromoterConfig;
use promoter::promote::{Engine, Promotion};
use promoter::registry::{Clients, Permissions, Registry};
use promoter::test_support::{FakeKargo, Scripted, ScriptedRunner, promotion};
use serde_json::json;

fn engine(runners: &[Arc<ScriptedRunner>], clients: Clients) -> Engine {
    let mut registry = Registry::new();
    for runner in runners {
        registry
            .register_promotion_step_runner(runner.clone(), Permissions::default())
            .expect("register");
    }
    Engine::new(Arc::new(registry), clients, PromoterConfig::default())
}

fn resume(previous: &PromotionResult) -> Promotion {
    Promotion {
        start_from_step: previous.current_step,
        state: previous.state.clone(),
        step_execution_metadata: previous.step_execution_metadata.clone(),
        ..promotion("demo", "prod", "prod.01")
    }
}

fn with_threshold(step: Step, threshold: u32) -> Step {
    step.with_retry(StepRetry {
        timeout: None,
        error_threshold: Some(threshold),
    })
}

#[test]
fn all_successful_steps_succeed() {
    let runner = Arc::new(ScriptedRunner::succeeding("success-step", json!({"ok": true})));
    let engine = engine(&[runner.clone()], Clients::default());
    let steps = vec![
        Step::new("success-step"),
        Step::new("success-step").with_alias("middle"),
        Step::new("success-step"),
    ];

    let result = engine
        .promote(&Cancellation::new(), promotion("demo", "prod", "prod.01"), &steps)
        .expect("promote");

    assert_eq!(result.status, PromotionPhase::Succeeded);
    assert_eq!(result.current_step, 2);
    assert_eq!(result.state.get("step-0"), Some(&json!({"ok": true})));
    assert_eq!(result.state.get("middle"), Some(&json!({"ok": true})));
    assert_eq!(runner.calls(), 3);
    for meta in &result.step_execution_metadata {
        assert_eq!(meta.status, Some(StepStatus::Succeeded));
        assert_eq!(meta.error_count, 0);
        assert!(meta.finished_at.is_some());
    }
}

#[test]
fn error_step_with_threshold_one_errors_after_one_attempt() {
    let runner = Arc::new(ScriptedRunner::erroring("error-step", "boom"));
    let engine = engine(&[runner.clone()], Clients::default());

    let result = engine
        .promote(
            &Cancellation::new(),
            promotion("demo", "prod", "prod.01"),
            &[Step::new("error-step")],
        )
        .expect("promote");

    assert_eq!(result.status, PromotionPhase::Errored);
    assert_eq!(result.current_step, 0);
    assert_eq!(runner.calls(), 1);
    assert_eq!(result.step_execution_metadata[0].error_count, 1);
    let message = result.message.expect("message");
    assert!(message.contains("boom"), "{message}");
    assert!(!message.contains("will be retried"), "{message}");
}

#[test]
fn failures_below_threshold_are_retried_on_later_passes() {
    let runner = Arc::new(ScriptedRunner::new(
        "flaky",
        vec![
            Scripted::Fail("connection reset".to_string()),
            Scripted::Fail("connection reset".to_string()),
            Scripted::Reply(StepResult::succeeded()),
        ],
    ));
    let engine = engine(&[runner.clone()], Clients::default());
    let steps = vec![with_threshold(Step::new("flaky"), 3)];
    let cancellation = Cancellation::new();

    let first = engine
        .promote(&cancellation, promotion("demo", "prod", "prod.01"), &steps)
        .expect("first pass");
    assert_eq!(first.status, PromotionPhase::Running);
    assert!(
        first
            .message
            .as_deref()
            .expect("message")
            .ends_with("; step will be retried")
    );
    assert_eq!(first.step_execution_metadata[0].error_count, 1);

    let second = engine
        .promote(&cancellation, resume(&first), &steps)
        .expect("second pass");
    assert_eq!(second.status, PromotionPhase::Running);
    assert_eq!(second.step_execution_metadata[0].error_count, 2);
    assert_eq!(
        second.step_execution_metadata[0].started_at,
        first.step_execution_metadata[0].started_at
    );

    let third = engine
        .promote(&cancellation, resume(&second), &steps)
        .expect("third pass");
    assert_eq!(third.status, PromotionPhase::Succeeded);
    assert_eq!(third.step_execution_metadata[0].error_count, 0);
    assert_eq!(runner.calls(), 3);
}

#[test]
fn suspension_resets_the_error_counter() {
    let runner = Arc::new(ScriptedRunner::new(
        "wait-for-pr",
        vec![
            Scripted::Fail("api unavailable".to_string()),
            Scripted::Reply(StepResult::running("waiting for pull request to be merged")),
            Scripted::Fail("api unavailable".to_string()),
            Scripted::Reply(StepResult::succeeded()),
        ],
    ));
    let engine = engine(&[runner.clone()], Clients::default());
    let steps = vec![with_threshold(Step::new("wait-for-pr"), 2)];
    let cancellation = Cancellation::new();

    let failed = engine
        .promote(&cancellation, promotion("demo", "prod", "prod.01"), &steps)
        .expect("pass");
    assert_eq!(failed.step_execution_metadata[0].error_count, 1);

    let waiting = engine
        .promote(&cancellation, resume(&failed), &steps)
        .expect("pass");
    assert_eq!(waiting.status, PromotionPhase::Running);
    assert_eq!(
        waiting.message.as_deref(),
        Some("waiting for pull request to be merged")
    );
    assert_eq!(waiting.step_execution_metadata[0].error_count, 0);

    // Without the reset this second failure would reach the threshold.
    let failed_again = engine
        .promote(&cancellation, resume(&waiting), &steps)
        .expect("pass");
    assert_eq!(failed_again.status, PromotionPhase::Running);
    assert_eq!(failed_again.step_execution_metadata[0].error_count, 1);

    let done = engine
        .promote(&cancellation, resume(&failed_again), &steps)
        .expect("pass");
    assert_eq!(done.status, PromotionPhase::Succeeded);
}

#[test]
fn terminal_errors_ignore_the_remaining_budget() {
    let runner = Arc::new(ScriptedRunner::new(
        "wait-for-pr",
        vec![Scripted::Terminal("pull request was closed without merging".to_string())],
    ));
    let engine = engine(&[runner.clone()], Clients::default());
    let steps = vec![with_threshold(Step::new("wait-for-pr"), 5)];

    let result = engine
        .promote(&Cancellation::new(), promotion("demo", "prod", "prod.01"), &steps)
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Errored);
    assert!(
        result
            .message
            .as_deref()
            .expect("message")
            .contains("closed without merging")
    );
}

#[test]
fn failed_results_still_record_their_output() {
    let runner = Arc::new(ScriptedRunner::new(
        "counter",
        vec![Scripted::Reply(
            StepResult::failed("not yet").with_output(json!({"attempts": 1})),
        )],
    ));
    let engine = engine(&[runner], Clients::default());
    let steps = vec![with_threshold(Step::new("counter").with_alias("count"), 2)];

    let result = engine
        .promote(&Cancellation::new(), promotion("demo", "prod", "prod.01"), &steps)
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Running);
    assert_eq!(result.state.get("count"), Some(&json!({"attempts": 1})));
    assert_eq!(
        result.step_execution_metadata[0].status,
        Some(StepStatus::Failed)
    );
}

#[test]
fn reserved_alias_aborts_before_any_runner() {
    let runner = Arc::new(ScriptedRunner::succeeding("success-step", json!({})));
    let engine = engine(&[runner.clone()], Clients::default());
    let steps = vec![
        Step::new("success-step").with_alias("step-3"),
        Step::new("success-step"),
    ];

    let result = engine
        .promote(&Cancellation::new(), promotion("demo", "prod", "prod.01"), &steps)
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Errored);
    assert!(result.message.as_deref().expect("message").contains("forbidden"));
    assert_eq!(runner.calls(), 0);
}

#[test]
fn unknown_step_kind_is_fatal() {
    let engine = engine(&[], Clients::default());
    let result = engine
        .promote(
            &Cancellation::new(),
            promotion("demo", "prod", "prod.01"),
            &[Step::new("git-clone")],
        )
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Errored);
    assert!(result.message.as_deref().expect("message").contains("git-clone"));
}

#[test]
fn timeouts_bound_retried_failures() {
    let runner = Arc::new(
        ScriptedRunner::erroring("flaky", "still broken")
            .with_default_timeout(Duration::from_secs(60))
            .with_default_error_threshold(10),
    );
    let engine = engine(&[runner], Clients::default());
    let started = Utc::now() - TimeDelta::minutes(10);
    let input = Promotion {
        step_execution_metadata: vec![StepExecutionMetadata::started("step-0", started)],
        ..promotion("demo", "prod", "prod.01")
    };

    let result = engine
        .promote(&Cancellation::new(), input, &[Step::new("flaky")])
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Errored);
    assert!(result.message.as_deref().expect("message").contains("timed out after 1m"));
}

#[test]
fn timeouts_bound_waiting_steps() {
    let runner = Arc::new(ScriptedRunner::new(
        "wait",
        vec![Scripted::Reply(StepResult::running("waiting"))],
    ));
    let engine = engine(&[runner], Clients::default());
    let step = Step::new("wait").with_retry(StepRetry {
        timeout: Some(Duration::from_secs(60)),
        error_threshold: None,
    });
    let input = Promotion {
        step_execution_metadata: vec![StepExecutionMetadata::started(
            "step-0",
            Utc::now() - TimeDelta::minutes(5),
        )],
        ..promotion("demo", "prod", "prod.01")
    };

    let result = engine
        .promote(&Cancellation::new(), input, &[step])
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Errored);
}

#[test]
fn cancellation_is_observed_between_steps() {
    let runner = Arc::new(ScriptedRunner::succeeding("success-step", json!({})));
    let engine = engine(&[runner.clone()], Clients::default());
    let cancellation = Cancellation::new();
    cancellation.cancel();

    let result = engine
        .promote(
            &cancellation,
            promotion("demo", "prod", "prod.01"),
            &[Step::new("success-step")],
        )
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Errored);
    assert_eq!(result.message.as_deref(), Some("promotion cancelled"));
    assert_eq!(runner.calls(), 0);
}

#[test]
fn resumed_passes_skip_finished_steps() {
    let runner = Arc::new(ScriptedRunner::succeeding("success-step", json!({"n": 2})));
    let engine = engine(&[runner.clone()], Clients::default());
    let mut input = promotion("demo", "prod", "prod.01");
    input.start_from_step = 1;
    input.state.set("step-0", json!({"n": 1}));

    let result = engine
        .promote(
            &Cancellation::new(),
            input,
            &[Step::new("success-step"), Step::new("success-step")],
        )
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Succeeded);
    assert_eq!(runner.calls(), 1);
    assert_eq!(result.state.get("step-0"), Some(&json!({"n": 1})));
    assert_eq!(result.state.get("step-1"), Some(&json!({"n": 2})));
}

#[test]
fn configs_see_outputs_secrets_and_vars() {
    let producer = Arc::new(ScriptedRunner::succeeding("produce", json!({"count": 3})));
    let consumer = Arc::new(ScriptedRunner::succeeding("consume", json!({})));
    let clients = Clients {
        kargo: Some(Arc::new(
            FakeKargo::default().with_secret("demo", "creds", "token", "s3cret"),
        )),
        ..Clients::default()
    };
    let engine = engine(&[producer, consumer.clone()], clients);
    let steps = vec![
        Step::new("produce").with_alias("first"),
        Step::new("consume").with_config(json!({
            "count": "{{ outputs.first.count }}",
            "token": "{{ secrets.creds.token }}",
            "target": "{{ vars.env }}-{{ ctx.stage }}",
        })),
    ];
    let mut input = promotion("demo", "prod", "prod.01");
    input.vars.insert("env".to_string(), json!("eu"));

    let result = engine
        .promote(&Cancellation::new(), input, &steps)
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Succeeded);

    let ctx = &consumer.contexts()[0];
    assert_eq!(
        ctx.config,
        json!({"count": 3, "token": "s3cret", "target": "eu-prod"})
    );
    assert_eq!(ctx.shared_state.get("first"), Some(&json!({"count": 3})));
    // Registered without permissions: no privileged clients.
    assert!(ctx.clients.kargo.is_none());
}

#[test]
fn unresolvable_expressions_are_fatal() {
    let runner = Arc::new(ScriptedRunner::succeeding("consume", json!({})));
    let engine = engine(&[runner.clone()], Clients::default());
    let steps = vec![with_threshold(
        Step::new("consume").with_config(json!({"value": "{{ outputs.missing.value }}"})),
        5,
    )];

    let result = engine
        .promote(&Cancellation::new(), promotion("demo", "prod", "prod.01"), &steps)
        .expect("promote");
    assert_eq!(result.status, PromotionPhase::Errored);
    assert_eq!(runner.calls(), 0);
}

#[test]
fn health_checks_are_collected_from_succeeded_steps() {
    let check = HealthCheckStep {
        kind: "argocd-update".to_string(),
        config: json!({"apps": []}),
    };
    let runner = Arc::new(ScriptedRunner::new(
        "sync",
        vec![Scripted::Reply(
            StepResult::succeeded().with_health_check(check.clone()),
        )],
    ));
    let engine = engine(&[runner], Clients::default());

    let result = engine
        .promote(
            &Cancellation::new(),
            promotion("demo", "prod", "prod.01"),
            &[Step::new("sync"), Step::new("sync")],
        )
        .expect("promote");
    assert_eq!(result.health_check_steps, vec![check.clone(), check]);
}
