use super::*;
use crate::operator::builtin::{register_builtins, CORE_LIBRARY};
use crate::operator::{FnOperator, OperatorSpec};
use crate::workflow::{
    ConditionKind, ErrorHandling, LoopConfig, OnError, OperatorRef, ParameterDecl, RetryPolicy,
};
use maplit::btreemap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

/* ===================== Fixtures ===================== */

struct Fixture {
    engine: WorkflowEngine,
    bus: Arc<EventBus>,
    ticks: Arc<AtomicU32>,
}

/// Engine with the built-ins plus `Tick` (counts calls) and `Fail` (always fails)
fn fixture() -> Fixture {
    let bus = Arc::new(EventBus::new(500));
    let registry = Arc::new(OperatorRegistry::new());
    register_builtins(&registry, bus.clone());

    let ticks = Arc::new(AtomicU32::new(0));
    let counter = ticks.clone();
    registry.register_fn("Tick", move |spec: OperatorSpec| {
        let counter = counter.clone();
        async move {
            let op = FnOperator::new(spec.identity, move |_, _| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    OperationResult::ok(json!({ "ticks": n }))
                }
            });
            Ok(Arc::new(op) as Arc<dyn Operator>)
        }
    });

    registry.register_fn("Fail", |spec: OperatorSpec| async move {
        let op = FnOperator::new(spec.identity, |_, _| async {
            OperationResult::failure("target unreachable")
        });
        Ok(Arc::new(op) as Arc<dyn Operator>)
    });

    let engine = WorkflowEngine::new(registry, bus.clone(), EngineConfig::default());
    Fixture { engine, bus, ticks }
}

fn set(id: &str, params: JsonValue) -> WorkflowStep {
    WorkflowStep::new(id, OperatorRef::new(CORE_LIBRARY, "set")).with_parameters(params)
}

fn tick(id: &str) -> WorkflowStep {
    WorkflowStep::new(id, OperatorRef::new("test", "Tick"))
}

fn fail(id: &str) -> WorkflowStep {
    WorkflowStep::new(id, OperatorRef::new("test", "Fail"))
}

fn event_names(bus: &EventBus) -> Vec<String> {
    bus.history().into_iter().map(|e| e.name).collect()
}

async fn run(fx: &Fixture, def: &WorkflowDefinition) -> RunOutcome {
    fx.engine
        .execute_workflow(def, WorkflowContext::new(&def.id))
        .await
}

/* ===================== Sequencing ===================== */

#[tokio::test]
async fn test_steps_run_in_declared_order() {
    let fx = fixture();
    let def = WorkflowDefinition::new(
        "seq",
        vec![
            set("a", json!({"x": 1})),
            set("b", json!({"y": "${x}"})),
            set("c", json!({"z": "${a.x}-${y}"})),
        ],
    );

    let outcome = run(&fx, &def).await;

    assert!(outcome.success);
    assert_eq!(outcome.context.state, RunState::Completed);
    assert_eq!(outcome.context.executed_step_ids(), vec!["a", "b", "c"]);
    assert_eq!(outcome.context.variable("y"), Some(&json!(1)));
    assert_eq!(outcome.context.variable("z"), Some(&json!("1-1")));
    assert_eq!(
        outcome.context.definition_fingerprint.as_deref(),
        Some(def.fingerprint().as_str())
    );
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let fx = fixture();
    let def = WorkflowDefinition::new("events", vec![set("a", json!({})), set("b", json!({}))]);

    run(&fx, &def).await;

    assert_eq!(
        event_names(&fx.bus),
        vec![
            names::WORKFLOW_STARTED,
            names::STEP_STARTED,
            names::STEP_COMPLETED,
            names::STEP_STARTED,
            names::STEP_COMPLETED,
            names::WORKFLOW_COMPLETED,
        ]
    );
    let completed = &fx.bus.history()[2];
    assert_eq!(completed.payload["step"], json!("a"));
    assert_eq!(completed.payload["attemptCount"], json!(1));
}

#[tokio::test]
async fn test_counter_condition_jumps_to_finish() {
    let fx = fixture();
    fx.engine.register_predicate("counter_positive", |_, vars| {
        vars.get("counter").and_then(JsonValue::as_i64).unwrap_or(0) > 0
    });

    let def = WorkflowDefinition::new(
        "counter",
        vec![
            set("init", json!({"counter": 0})),
            set("bump", json!({"counter": 1})).with_condition(
                ConditionKind::Custom {
                    name: "counter_positive".into(),
                },
                "finish",
            ),
            set("skipped", json!({"status": "wrong"})),
            set("finish", json!({"status": "success"})),
        ],
    );
    fx.engine.register_workflow(def).unwrap();

    let outcome = fx.engine.run("counter", Variables::new()).await;

    assert!(outcome.success);
    assert_eq!(outcome.context.state, RunState::Completed);
    assert_eq!(outcome.context.variable("status"), Some(&json!("success")));
    assert_eq!(outcome.context.executed_step_ids(), vec!["init", "bump", "finish"]);
}

#[tokio::test]
async fn test_unknown_operator_type_fails_before_any_step() {
    let fx = fixture();
    let def = WorkflowDefinition::new(
        "bogus",
        vec![
            set("a", json!({})),
            WorkflowStep::new("b", OperatorRef::new("test", "Bogus")),
        ],
    );

    let outcome = run(&fx, &def).await;

    assert!(!outcome.success);
    assert_eq!(
        outcome.error,
        Some(WorkflowError::UnknownOperatorType {
            operator_type: "Bogus".into()
        })
    );
    assert!(outcome.context.history.is_empty());
    assert_eq!(outcome.context.state, RunState::Error);
    assert!(!event_names(&fx.bus).contains(&names::STEP_STARTED.to_string()));
}

/* ===================== Loops ===================== */

#[tokio::test]
async fn test_loop_runs_exactly_k_times() {
    for k in 1..=4u32 {
        let fx = fixture();
        let def = WorkflowDefinition::new(
            "loop",
            vec![tick("t").with_loop(LoopConfig::times(k)), set("after", json!({"done": true}))],
        );

        let outcome = run(&fx, &def).await;

        assert!(outcome.success);
        assert_eq!(fx.ticks.load(Ordering::SeqCst), k);
        assert_eq!(outcome.context.variable("done"), Some(&json!(true)));
        assert!(outcome.context.loop_iterations.is_empty());
    }
}

#[tokio::test]
async fn test_zero_iteration_loop_skips_step() {
    let fx = fixture();
    let def = WorkflowDefinition::new(
        "skip",
        vec![tick("t").with_loop(LoopConfig::times(0)), set("after", json!({}))],
    );

    let outcome = run(&fx, &def).await;

    assert!(outcome.success);
    assert_eq!(fx.ticks.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.context.executed_step_ids(), vec!["after"]);
    assert!(event_names(&fx.bus).contains(&names::STEP_SKIPPED.to_string()));
}

#[tokio::test]
async fn test_loop_until_and_iteration_variable() {
    let fx = fixture();
    let looped = LoopConfig {
        max_iterations: 10,
        until: Some(ConditionKind::ResultEquals {
            value: json!(3),
            path: Some("ticks".into()),
        }),
        iteration_variable: Some("i".into()),
    };
    let def = WorkflowDefinition::new("until", vec![tick("t").with_loop(looped)]);

    let outcome = run(&fx, &def).await;

    assert!(outcome.success);
    assert_eq!(fx.ticks.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.context.variable("i"), Some(&json!(2)));
}

#[tokio::test]
async fn test_step_cap_stops_runaway_jumps() {
    let fx = fixture();
    let def = WorkflowDefinition::new(
        "runaway",
        vec![tick("spin").with_condition(ConditionKind::Success, "spin")],
    );

    let outcome = run(&fx, &def).await;

    assert!(!outcome.success);
    assert_eq!(
        outcome.error,
        Some(WorkflowError::ControlFlow(ControlFlowError::StepCapExceeded { cap: 10 }))
    );
    assert_eq!(outcome.failed_at.as_deref(), Some("spin"));
    assert_eq!(fx.ticks.load(Ordering::SeqCst), 10);
}

/* ===================== Failures ===================== */

#[tokio::test]
async fn test_abort_is_the_default_strategy() {
    let fx = fixture();
    let def = WorkflowDefinition::new("abort", vec![fail("f"), set("never", json!({}))]);

    let outcome = run(&fx, &def).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failed_at.as_deref(), Some("f"));
    assert_eq!(
        outcome.error.as_ref().map(WorkflowError::kind),
        Some("ExecutionError")
    );
    assert_eq!(outcome.context.executed_step_ids(), vec!["f"]);

    let seen = event_names(&fx.bus);
    assert!(seen.contains(&names::STEP_ERROR.to_string()));
    assert_eq!(seen.last().map(String::as_str), Some(names::WORKFLOW_ERROR));
}

#[tokio::test]
async fn test_continue_takes_failure_route_or_falls_through() {
    let fx = fixture();
    let mut def = WorkflowDefinition::new(
        "continue",
        vec![
            fail("f1"),
            fail("f2").with_condition(ConditionKind::Failure, "recover"),
            set("skipped", json!({})),
            set("recover", json!({"recovered": true})),
        ],
    );
    def.error_handling = ErrorHandling {
        strategy: ErrorStrategy::Continue,
        ..ErrorHandling::default()
    };

    let outcome = run(&fx, &def).await;

    assert!(outcome.success);
    assert_eq!(outcome.context.executed_step_ids(), vec!["f1", "f2", "recover"]);
    assert!(outcome.context.history[0].error.is_some());
    assert_eq!(outcome.context.variable("recovered"), Some(&json!(true)));
}

#[tokio::test]
async fn test_step_strategy_overrides_workflow_strategy() {
    let fx = fixture();
    let def = WorkflowDefinition::new(
        "override",
        vec![
            fail("tolerated").with_on_error(OnError {
                strategy: Some(ErrorStrategy::Continue),
                target_step: None,
            }),
            set("after", json!({})),
        ],
    );

    let outcome = run(&fx, &def).await;

    assert!(outcome.success);
    assert_eq!(outcome.context.executed_step_ids(), vec!["tolerated", "after"]);
}

#[tokio::test]
async fn test_on_error_target_jumps_after_retries() {
    let fx = fixture();
    let def = WorkflowDefinition::new(
        "handler",
        vec![
            fail("f")
                .with_retry(RetryPolicy {
                    max_retries: 2,
                    delay: 1,
                    backoff_factor: 1.0,
                })
                .with_on_error(OnError {
                    strategy: None,
                    target_step: Some("cleanup".into()),
                }),
            set("skipped", json!({})),
            set("cleanup", json!({"cleaned": true})),
        ],
    );

    let outcome = run(&fx, &def).await;

    assert!(outcome.success);
    assert_eq!(outcome.context.executed_step_ids(), vec!["f", "cleanup"]);
    assert_eq!(outcome.context.history[0].attempt_count, 3);
}

#[tokio::test]
async fn test_invalid_definition_is_rejected() {
    let fx = fixture();
    let def = WorkflowDefinition::new(
        "broken",
        vec![set("a", json!({})).with_condition(ConditionKind::Success, "ghost")],
    );

    assert!(fx.engine.register_workflow(def.clone()).is_err());

    let outcome = run(&fx, &def).await;
    assert!(matches!(outcome.error, Some(WorkflowError::Definition { .. })));
    assert!(outcome.context.history.is_empty());
}

#[tokio::test]
async fn test_unknown_workflow_id() {
    let fx = fixture();
    let outcome = fx.engine.run("nope", Variables::new()).await;
    assert_eq!(
        outcome.error,
        Some(WorkflowError::UnknownWorkflow {
            workflow_id: "nope".into()
        })
    );
}

/* ===================== Inputs ===================== */

#[tokio::test]
async fn test_globals_and_initial_state_seed_variables() {
    let fx = fixture();
    let mut def = WorkflowDefinition::new("inputs", vec![set("greet", json!({"msg": "${greeting} ${name}"}))]);
    def.initial_state.insert("greeting".into(), json!("hello"));
    def.global_parameters = btreemap! {
        "name".to_string() => ParameterDecl {
            default: Some(json!("world")),
            ..ParameterDecl::default()
        },
    };
    fx.engine.register_workflow(def).unwrap();

    let outcome = fx.engine.run("inputs", Variables::new()).await;
    assert_eq!(outcome.context.variable("msg"), Some(&json!("hello world")));

    let mut vars = Variables::new();
    vars.insert("greeting".into(), json!("hi"));
    vars.insert("name".into(), json!("ada"));
    let outcome = fx.engine.run("inputs", vars).await;
    assert_eq!(outcome.context.variable("msg"), Some(&json!("hi ada")));
}

#[tokio::test]
async fn test_missing_required_global_fails_before_steps() {
    let fx = fixture();
    let mut def = WorkflowDefinition::new("required", vec![tick("t")]);
    def.global_parameters = btreemap! {
        "apiKey".to_string() => ParameterDecl {
            required: true,
            ..ParameterDecl::default()
        },
    };

    let outcome = run(&fx, &def).await;

    assert_eq!(
        outcome.error,
        Some(WorkflowError::MissingParameter {
            name: "apiKey".into()
        })
    );
    assert_eq!(outcome.error.as_ref().map(WorkflowError::kind), Some("ValidationError"));
    assert_eq!(fx.ticks.load(Ordering::SeqCst), 0);
}

/* ===================== Cancellation & Concurrency ===================== */

#[tokio::test]
async fn test_cancellation_is_observed_between_steps() {
    let fx = fixture();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    fx.engine.registry().register_fn("CancelRun", move |spec: OperatorSpec| {
        let trigger = trigger.clone();
        async move {
            let op = FnOperator::new(spec.identity, move |_, _| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    OperationResult::ok_empty()
                }
            });
            Ok(Arc::new(op) as Arc<dyn Operator>)
        }
    });

    let def = WorkflowDefinition::new(
        "cancel",
        vec![
            WorkflowStep::new("stop", OperatorRef::new("test", "CancelRun")),
            tick("never"),
        ],
    );

    let outcome = fx
        .engine
        .execute_with_cancel(&def, WorkflowContext::new("cancel"), cancel)
        .await;

    assert_eq!(outcome.context.state, RunState::Cancelled);
    assert_eq!(outcome.error, Some(WorkflowError::Cancelled));
    assert_eq!(outcome.failed_at.as_deref(), Some("never"));
    assert_eq!(outcome.context.executed_step_ids(), vec!["stop"]);
    assert_eq!(fx.ticks.load(Ordering::SeqCst), 0);
    assert!(event_names(&fx.bus).contains(&names::WORKFLOW_CANCELLED.to_string()));
}

#[tokio::test]
async fn test_cancel_during_retry_wait_ends_run_cancelled() {
    let fx = fixture();
    let def = WorkflowDefinition::new(
        "cancel-retry",
        vec![fail("f").with_retry(RetryPolicy {
            max_retries: 5,
            delay: 200,
            backoff_factor: 1.0,
        })],
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = fx
        .engine
        .execute_with_cancel(&def, WorkflowContext::new("cancel-retry"), cancel)
        .await;

    assert_eq!(outcome.context.state, RunState::Cancelled);
    assert_eq!(outcome.error, Some(WorkflowError::Cancelled));
    assert_eq!(outcome.failed_at.as_deref(), Some("f"));
    assert_eq!(outcome.context.history[0].attempt_count, 1);
    let seen = event_names(&fx.bus);
    assert!(!seen.contains(&names::WORKFLOW_ERROR.to_string()));
    assert_eq!(seen.last().map(String::as_str), Some(names::WORKFLOW_CANCELLED));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_share_operator_instances() {
    let fx = Arc::new(fixture());
    let def = Arc::new(WorkflowDefinition::new(
        "shared",
        vec![
            WorkflowStep::new("wait", OperatorRef::new(CORE_LIBRARY, "delay"))
                .with_parameters(json!({"ms": 50})),
            set("a", json!({"n": 1})),
            set("b", json!({"m": "${n}"})),
        ],
    ));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let fx = fx.clone();
            let def = def.clone();
            tokio::spawn(async move { run(&fx, &def).await })
        })
        .collect();

    let mut contexts = HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.context.variable("m"), Some(&json!(1)));
        contexts.insert(outcome.context.id);
    }

    assert_eq!(contexts.len(), 4);
    assert_eq!(fx.engine.registry().constructions(), 2);
}

/* ===================== Faults ===================== */

#[tokio::test]
async fn test_panicking_operator_fails_the_run_cleanly() {
    let fx = fixture();
    fx.engine.registry().register_fn("Explode", |spec: OperatorSpec| async move {
        let op = FnOperator::new(spec.identity, |_, _| async move {
            if true {
                panic!("fuse blown");
            }
            OperationResult::ok_empty()
        });
        Ok(Arc::new(op) as Arc<dyn Operator>)
    });
    let def = WorkflowDefinition::new(
        "boom",
        vec![WorkflowStep::new("blow", OperatorRef::new("test", "Explode")), tick("after")],
    );

    let outcome = run(&fx, &def).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failed_at.as_deref(), Some("blow"));
    assert_eq!(outcome.error.as_ref().map(WorkflowError::kind), Some("ExecutionError"));
    assert_eq!(outcome.context.state, RunState::Error);
    assert_eq!(fx.ticks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_zero_step_cap_factor_still_runs_each_step_once() {
    let bus = Arc::new(EventBus::new(0));
    let registry = Arc::new(OperatorRegistry::new());
    register_builtins(&registry, bus.clone());
    let config = EngineConfig {
        step_cap_factor: 0,
        ..EngineConfig::default()
    };
    let engine = WorkflowEngine::new(registry, bus, config);
    let def = WorkflowDefinition::new("tiny", vec![set("a", json!({})), set("b", json!({}))]);

    let outcome = engine.execute_workflow(&def, WorkflowContext::new("tiny")).await;

    assert!(outcome.success, "{:?}", outcome.error);
}
