//! End-to-end tests of the executor driving real runs.

use super::*;
use crate::config::{CircuitBreakerConfig, RecoveryConfig, RunConfigOverrides};
use crate::core::{
    ExecutionStatus, ResourceRequirements, RetryStrategy, WorkOutput, WorkUnitSpec,
};
use crate::errors::{ExecutionFault, HandlerError};
use crate::events::CollectingEventSink;
use crate::handlers::{MockWorkUnitHandler, WorkUnitHandler};
use crate::recovery::{CircuitState, RecoveryStrategy};
use crate::scheduler::StrategyKind;
use crate::testing::{
    init_test_tracing, ExecutionRecorder, FailingHandler, FlakyHandler, RecordingHandler,
    SlowHandler, SuccessHandler,
};
use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn fast_config() -> OrchestrationConfig {
    OrchestrationConfig::default()
        .with_poll_interval_ms(10)
        .with_monitoring_interval(0.05)
        .with_retry_base_delay_ms(5)
        .with_recovery(RecoveryConfig {
            apply_recovery_estimates: false,
            ..RecoveryConfig::default()
        })
}

struct Harness {
    executor: PipelineExecutor,
    events: Arc<CollectingEventSink>,
}

fn harness(config: OrchestrationConfig, registry: HandlerRegistry) -> Harness {
    init_test_tracing();
    let events = Arc::new(CollectingEventSink::new());
    let executor = PipelineExecutor::builder(config)
        .with_handlers(Arc::new(registry))
        .with_event_sink(Arc::clone(&events) as Arc<dyn EventSink>)
        .build()
        .unwrap();
    Harness { executor, events }
}

fn recording(recorder: &Arc<ExecutionRecorder>, kinds: &[&str], delay_ms: u64) -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    for kind in kinds {
        registry.register_instance(
            *kind,
            Arc::new(RecordingHandler::new(Arc::clone(recorder)).with_delay_ms(delay_ms)),
        );
    }
    registry
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn execution_status(executor: &PipelineExecutor, run_id: Uuid, kind: &str) -> ExecutionStatus {
    executor
        .status(run_id)
        .unwrap()
        .execution_by_kind(kind)
        .map(|e| e.status)
        .unwrap()
}

#[tokio::test]
async fn test_independent_units_respect_parallel_limit() {
    let recorder = ExecutionRecorder::new();
    let h = harness(
        fast_config().with_max_parallel(2),
        recording(&recorder, &["a", "b", "c"], 100),
    );
    let submission = PipelineSubmission::new("parallel", "three independent units")
        .unit(WorkUnitSpec::new("a"))
        .unit(WorkUnitSpec::new("b"))
        .unit(WorkUnitSpec::new("c"));

    let result = h.executor.run(submission).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(recorder.max_concurrency(), 2);
    let calls = recorder.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[2].finished_before >= 1);
    assert_eq!(result.successful_kinds.len(), 3);
}

#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let recorder = ExecutionRecorder::new();
    let h = harness(fast_config(), recording(&recorder, &["a", "b", "c"], 10));
    let submission = PipelineSubmission::sequence("chain", "a then b then c", ["a", "b", "c"]);

    let result = h.executor.run(submission).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(recorder.started_kinds(), vec!["a", "b", "c"]);
    let calls = recorder.calls();
    assert_eq!(calls[1].dependency_kinds, vec!["a".to_string()]);
    assert_eq!(calls[1].finished_before, 1);
    assert_eq!(calls[2].finished_before, 2);
    assert_eq!(calls[2].context.get("b_done"), Some(&serde_json::json!(true)));
    assert_eq!(result.outputs["c"].result["inputs"], serde_json::json!(["b"]));
}

#[tokio::test]
async fn test_transient_failure_exhausts_attempts() {
    let handler = Arc::new(FailingHandler::new("network unreachable"));
    let registry = HandlerRegistry::new().with_handler("fetch", Arc::clone(&handler) as Arc<dyn WorkUnitHandler>);
    let h = harness(fast_config(), registry);

    let result = h
        .executor
        .run(PipelineSubmission::sequence("retry", "always fails", ["fetch"]))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Failure);
    let summary = result.execution("fetch").unwrap();
    assert_eq!(summary.status, ExecutionStatus::Failure);
    assert_eq!(summary.attempts, 3);
    assert_eq!(handler.call_count(), 3);
    assert_eq!(result.retry_count, 2);
    assert_eq!(h.events.events_of_type("execution.retrying").len(), 2);
    assert_eq!(h.events.events_of_type("execution.failed").len(), 1);
}

#[tokio::test]
async fn test_flaky_unit_recovers_on_retry() {
    let handler = Arc::new(FlakyHandler::new(2, "connection reset"));
    let registry = HandlerRegistry::new().with_handler("sync", Arc::clone(&handler) as Arc<dyn WorkUnitHandler>);
    let h = harness(fast_config(), registry);

    let result = h
        .executor
        .run(PipelineSubmission::sequence("flaky", "recovers", ["sync"]))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(result.execution("sync").unwrap().attempts, 3);
    assert_eq!(result.outputs["sync"].metadata["attempt"], serde_json::json!(3));
    assert_eq!(h.executor.recovery().stats().successful_recoveries, 2);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_scheduling() {
    let recorder = ExecutionRecorder::new();
    let h = harness(fast_config(), recording(&recorder, &["a", "b"], 0));
    let submission = PipelineSubmission::new("cyclic", "a and b need each other")
        .unit(WorkUnitSpec::new("a").depends_on("b"))
        .unit(WorkUnitSpec::new("b").depends_on("a"));

    let err = assert_err!(h.executor.create_run(submission));

    match err {
        OrchestrationError::Dependency(dep) => {
            assert_eq!(dep.cycles.len(), 1);
            assert_eq!(dep.cycles[0].first(), dep.cycles[0].last());
            assert_eq!(dep.error_info.code, "DEP-001-CYCLE");
        }
        other => panic!("expected a dependency error, got {other:?}"),
    }
    assert!(h.executor.list_active().is_empty());
    assert!(recorder.calls().is_empty());
    assert_eq!(h.executor.executor_metrics().validation.validation_errors, 1);
}

#[tokio::test]
async fn test_missing_dependency_is_rejected() {
    let h = harness(fast_config(), HandlerRegistry::new());
    let submission =
        PipelineSubmission::new("dangling", "b needs ghost").unit(WorkUnitSpec::new("b").depends_on("ghost"));

    let err = assert_err!(h.executor.create_run(submission));
    assert!(matches!(err, OrchestrationError::Dependency(ref dep) if dep.missing.len() == 1));
}

#[tokio::test]
async fn test_pause_holds_new_launches_until_resume() {
    let recorder = ExecutionRecorder::new();
    let h = harness(
        fast_config().with_max_parallel(1),
        recording(&recorder, &["a", "b", "c"], 150),
    );
    let submission = PipelineSubmission::new("pausable", "three units, one slot")
        .unit(WorkUnitSpec::new("a"))
        .unit(WorkUnitSpec::new("b"))
        .unit(WorkUnitSpec::new("c"));
    let run_id = h.executor.create_run(submission).unwrap();
    h.executor.start(run_id).unwrap();

    wait_until("first launch", || recorder.calls().len() == 1).await;
    assert_ok!(h.executor.pause(run_id));
    wait_until("first unit to drain", || recorder.finished_kinds().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(recorder.calls().len(), 1);
    assert_eq!(h.executor.status(run_id).unwrap().status, PipelineStatus::Paused);
    assert!(h.executor.pause(run_id).is_err());

    assert_ok!(h.executor.resume(run_id));
    let result = h.executor.wait(run_id).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(recorder.calls().len(), 3);
    assert_eq!(recorder.max_concurrency(), 1);
    assert_eq!(h.events.events_of_type("run.paused").len(), 1);
    assert_eq!(h.events.events_of_type("run.resumed").len(), 1);
}

#[tokio::test]
async fn test_fallback_handler_substitutes_output() {
    let registry = HandlerRegistry::new()
        .with_handler("coder", Arc::new(FailingHandler::new("module not found: left-pad")))
        .with_handler("coder_backup", Arc::new(SuccessHandler::new(serde_json::json!("backup"))));
    let config = fast_config().with_recovery(
        RecoveryConfig {
            apply_recovery_estimates: false,
            ..RecoveryConfig::default()
        }
        .with_fallback("coder", "coder_backup"),
    );
    let h = harness(config, registry);

    let result = h
        .executor
        .run(PipelineSubmission::sequence("fallback", "coder falls back", ["coder", "review"]))
        .await
        .unwrap();

    // "review" has no handler, so only the fallback succeeds.
    assert_eq!(result.status, PipelineStatus::PartialSuccess);
    let output = &result.outputs["coder"];
    assert_eq!(output.result, serde_json::json!("backup"));
    assert_eq!(output.confidence, 0.5);
    assert_eq!(output.metadata["fallback_kind"], serde_json::json!("coder_backup"));
    assert_eq!(
        result.execution("coder").unwrap().recovery_strategy,
        Some(RecoveryStrategy::Fallback)
    );
    let started = h.events.events_of_type("execution.started");
    assert!(started
        .iter()
        .any(|e| e.payload["fallback_kind"] == serde_json::json!("coder_backup")));
}

#[tokio::test]
async fn test_validation_failure_is_skipped_and_dependents_run() {
    let recorder = ExecutionRecorder::new();
    let registry = recording(&recorder, &["deploy"], 0)
        .with_handler("lint", Arc::new(FailingHandler::new("invalid schema in manifest")));
    let h = harness(fast_config(), registry);

    let result = h
        .executor
        .run(PipelineSubmission::sequence("skip", "lint then deploy", ["lint", "deploy"]))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Success);
    let lint = &result.outputs["lint"];
    assert!(lint.is_skip_placeholder());
    assert_eq!(lint.confidence, 0.0);
    assert_eq!(recorder.started_kinds(), vec!["deploy"]);
    assert_eq!(
        result.execution("lint").unwrap().recovery_strategy,
        Some(RecoveryStrategy::Skip)
    );
}

#[tokio::test]
async fn test_missing_handler_requires_intervention_and_blocks_dependents() {
    let recorder = ExecutionRecorder::new();
    let h = harness(fast_config(), recording(&recorder, &["after"], 0));

    let result = h
        .executor
        .run(PipelineSubmission::sequence("ghost", "no handler", ["ghost", "after"]))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Failure);
    let ghost = result.execution("ghost").unwrap();
    assert_eq!(ghost.status, ExecutionStatus::Failure);
    assert_eq!(ghost.recovery_strategy, Some(RecoveryStrategy::ManualIntervention));
    let after = result.execution("after").unwrap();
    assert_eq!(after.status, ExecutionStatus::Cancelled);
    assert!(after.last_error.as_deref().unwrap_or_default().contains("Blocked"));
    assert!(recorder.calls().is_empty());

    let interventions = h.events.events_of_type("intervention.required");
    assert_eq!(interventions.len(), 1);
    assert_eq!(interventions[0].payload["kind"], serde_json::json!("ghost"));
}

#[tokio::test]
async fn test_open_circuit_holds_retries_until_pipeline_timeout() {
    let handler = Arc::new(FailingHandler::new("connection refused"));
    let registry = HandlerRegistry::new().with_handler("api", Arc::clone(&handler) as Arc<dyn WorkUnitHandler>);
    let config = fast_config()
        .with_max_attempts(5)
        .with_pipeline_timeout(0.5)
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_secs: 60.0,
            half_open_max_calls: 1,
        });
    let h = harness(config, registry);

    let result = h
        .executor
        .run(PipelineSubmission::sequence("breaker", "api keeps refusing", ["api"]))
        .await
        .unwrap();

    assert_eq!(handler.call_count(), 2);
    assert_eq!(h.executor.recovery().circuit_state("api"), CircuitState::Open);
    let api = result.execution("api").unwrap();
    assert_eq!(api.status, ExecutionStatus::Cancelled);
    assert!(api.last_error.as_deref().unwrap_or_default().contains("timeout"));
    assert_eq!(result.status, PipelineStatus::Failure);

    assert!(h.executor.reset_circuit_breaker("api"));
    assert_eq!(h.executor.circuit_status()["api"].state, CircuitState::Closed);
}

#[tokio::test]
async fn test_cancelled_trial_does_not_jam_circuit() {
    let registry = HandlerRegistry::new().with_handler("api", Arc::new(FailingHandler::new("connection refused")));
    let config = fast_config()
        .with_max_attempts(1)
        .with_pipeline_timeout(2.0)
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 0.05,
            half_open_max_calls: 1,
        });
    let h = harness(config, registry);

    h.executor
        .run(PipelineSubmission::sequence("first", "api refuses", ["api"]))
        .await
        .unwrap();
    assert_eq!(h.executor.recovery().circuit_state("api"), CircuitState::Open);

    h.executor
        .registry()
        .register_instance("api", Arc::new(SlowHandler::with_delay_ms(10_000)));
    let stalled = h
        .executor
        .create_run(PipelineSubmission::sequence("second", "api hangs", ["api"]))
        .unwrap();
    h.executor.start(stalled).unwrap();
    wait_until("the trial attempt to start", || {
        execution_status(&h.executor, stalled, "api") == ExecutionStatus::Running
    })
    .await;
    assert_eq!(h.executor.circuit_status()["api"].half_open_calls, 1);
    h.executor.cancel(stalled).unwrap();
    h.executor.wait(stalled).await.unwrap();

    let status = &h.executor.circuit_status()["api"];
    assert_eq!(status.state, CircuitState::HalfOpen);
    assert_eq!(status.half_open_calls, 0);

    let healthy = Arc::new(SuccessHandler::new(serde_json::json!("ok")));
    h.executor
        .registry()
        .register_instance("api", Arc::clone(&healthy) as Arc<dyn WorkUnitHandler>);
    let result = h
        .executor
        .run(PipelineSubmission::sequence("third", "api is back", ["api"]))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(healthy.call_count(), 1);
    assert_eq!(h.executor.recovery().circuit_state("api"), CircuitState::Closed);
}

#[tokio::test]
async fn test_execution_timeout_is_retried_then_fails() {
    let handler = Arc::new(SlowHandler::with_delay_ms(5_000));
    let registry = HandlerRegistry::new().with_handler("build", Arc::clone(&handler) as Arc<dyn WorkUnitHandler>);
    let h = harness(fast_config().with_execution_timeout(0.1).with_max_attempts(2), registry);

    let run_id = h
        .executor
        .create_run(PipelineSubmission::sequence("slow", "always too slow", ["build"]))
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(3), h.executor.execute(run_id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Failure);
    assert_eq!(handler.call_count(), 2);
    let run = h.executor.status(run_id).unwrap();
    let build = run.execution_by_kind("build").unwrap();
    assert_eq!(build.attempt_number, 2);
    assert_eq!(build.failure_history[0].status, ExecutionStatus::Timeout);
    assert!(build.last_error.as_deref().unwrap_or_default().contains("timeout"));
}

#[tokio::test]
async fn test_cancel_stops_in_flight_and_pending_work() {
    let registry = HandlerRegistry::new()
        .with_handler("long", Arc::new(SlowHandler::with_delay_ms(10_000)))
        .with_handler("next", Arc::new(SuccessHandler::new(serde_json::json!(1))));
    let h = harness(fast_config(), registry);
    let run_id = h
        .executor
        .create_run(PipelineSubmission::sequence("cancel", "long then next", ["long", "next"]))
        .unwrap();
    h.executor.start(run_id).unwrap();
    wait_until("long to start", || {
        execution_status(&h.executor, run_id, "long") == ExecutionStatus::Running
    })
    .await;

    assert_ok!(h.executor.cancel(run_id));
    let result = tokio::time::timeout(Duration::from_secs(2), h.executor.wait(run_id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Cancelled);
    assert!(result
        .executions
        .iter()
        .all(|e| e.status == ExecutionStatus::Cancelled));
    assert_eq!(h.executor.metrics(run_id).unwrap().scheduler.pool.active, 0);
    assert!(h.executor.cancel(run_id).is_err());
    assert_eq!(h.events.events_of_type("run.cancelled").len(), 1);
    assert_eq!(h.executor.executor_metrics().cancelled_pipelines, 1);
}

#[tokio::test]
async fn test_cancel_before_start_finishes_run() {
    let h = harness(fast_config(), HandlerRegistry::new());
    let run_id = h
        .executor
        .create_run(PipelineSubmission::sequence("idle", "never started", ["a"]))
        .unwrap();

    h.executor.cancel(run_id).unwrap();

    let result = h.executor.result(run_id).unwrap().unwrap();
    assert_eq!(result.status, PipelineStatus::Cancelled);
    assert!(matches!(
        h.executor.start(run_id),
        Err(OrchestrationError::InvalidRunState { action: "start", .. })
    ));
}

#[tokio::test]
async fn test_fail_fast_cancels_waiting_units() {
    let recorder = ExecutionRecorder::new();
    let registry = recording(&recorder, &["x", "y"], 0)
        .with_handler("bad", Arc::new(FailingHandler::new("network down")));
    let config = fast_config()
        .with_max_parallel(1)
        .with_fail_fast(true)
        .with_scheduling_strategy(StrategyKind::Priority)
        .with_pipeline_optimization(false);
    let h = harness(config, registry);
    let submission = PipelineSubmission::new("fail-fast", "bad runs first")
        .unit(WorkUnitSpec::new("bad").with_priority(100).with_max_attempts(1))
        .unit(WorkUnitSpec::new("x").with_priority(10))
        .unit(WorkUnitSpec::new("y").with_priority(10));

    let result = h.executor.run(submission).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Failure);
    assert!(recorder.calls().is_empty());
    for kind in ["x", "y"] {
        let summary = result.execution(kind).unwrap();
        assert_eq!(summary.status, ExecutionStatus::Cancelled);
        assert!(summary.last_error.as_deref().unwrap_or_default().contains("fail-fast"));
    }
}

#[tokio::test]
async fn test_oversized_unit_fails_with_resource_exhaustion() {
    let recorder = ExecutionRecorder::new();
    let h = harness(
        fast_config().with_resource_limits(Some(50.0), None),
        recording(&recorder, &["small", "huge"], 0),
    );
    let submission = PipelineSubmission::new("limits", "one unit cannot fit")
        .unit(WorkUnitSpec::new("small").with_resources(ResourceRequirements::new(10.0, 64.0)))
        .unit(WorkUnitSpec::new("huge").with_resources(ResourceRequirements::new(80.0, 64.0)));

    let result = h.executor.run(submission).await.unwrap();

    assert_eq!(result.status, PipelineStatus::PartialSuccess);
    assert_eq!(recorder.started_kinds(), vec!["small"]);
    let huge = result.execution("huge").unwrap();
    assert_eq!(huge.status, ExecutionStatus::Failure);
    assert!(huge.last_error.is_some());
}

#[tokio::test]
async fn test_cpu_ceiling_bounds_concurrency() {
    let recorder = ExecutionRecorder::new();
    let h = harness(
        fast_config()
            .with_max_parallel(4)
            .with_resource_limits(Some(100.0), None),
        recording(&recorder, &["a", "b", "c", "d"], 50),
    );
    let mut submission = PipelineSubmission::new("cpu", "four heavy units");
    for kind in ["a", "b", "c", "d"] {
        submission = submission
            .unit(WorkUnitSpec::new(kind).with_resources(ResourceRequirements::new(40.0, 10.0)));
    }

    let result = h.executor.run(submission).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(recorder.max_concurrency(), 2);
}

#[tokio::test]
async fn test_invalidation_rolls_back_consumers() {
    let recorder = ExecutionRecorder::new();
    let registry = recording(&recorder, &["a", "b"], 0)
        .with_handler("c", Arc::new(SlowHandler::with_delay_ms(300)));
    let h = harness(fast_config(), registry);
    let run_id = h
        .executor
        .create_run(PipelineSubmission::sequence("rollback", "a feeds b feeds c", ["a", "b", "c"]))
        .unwrap();
    h.executor.start(run_id).unwrap();
    wait_until("c to start", || {
        execution_status(&h.executor, run_id, "c") == ExecutionStatus::Running
    })
    .await;

    let outcome = h
        .executor
        .invalidate_execution(run_id, "a", "stale network data")
        .unwrap();
    assert!(matches!(outcome, RecoveryOutcome::Retry { .. }));
    assert!(matches!(
        h.executor.invalidate_execution(run_id, "nope", "x"),
        Err(OrchestrationError::ExecutionNotFound { .. })
    ));

    let result = h.executor.wait(run_id).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(recorder.started_kinds(), vec!["a", "b", "a", "b"]);
    let a = result.execution("a").unwrap();
    assert_eq!(a.attempts, 2);
    assert_eq!(a.recovery_strategy, Some(RecoveryStrategy::Rollback));
    assert!(h.executor.invalidate_execution(run_id, "a", "late").is_err());
}

#[tokio::test]
async fn test_invalidated_unit_waits_out_its_backoff() {
    let recorder = ExecutionRecorder::new();
    let registry = recording(&recorder, &["a"], 0)
        .with_handler("c", Arc::new(SlowHandler::with_delay_ms(1_000)));
    let config = fast_config()
        .with_retry_base_delay_ms(400)
        .with_retry_strategy(RetryStrategy::FixedDelay);
    let h = harness(config, registry);
    let run_id = h
        .executor
        .create_run(PipelineSubmission::sequence("backoff", "a feeds a slow c", ["a", "c"]))
        .unwrap();
    h.executor.start(run_id).unwrap();
    wait_until("c to start", || {
        execution_status(&h.executor, run_id, "c") == ExecutionStatus::Running
    })
    .await;

    let invalidated_at = Instant::now();
    let outcome = h
        .executor
        .invalidate_execution(run_id, "a", "stale network data")
        .unwrap();
    let RecoveryOutcome::Retry { delay } = outcome else {
        panic!("expected a retry, got {outcome:?}");
    };
    assert!(delay >= Duration::from_millis(400));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(execution_status(&h.executor, run_id, "a"), ExecutionStatus::Pending);
    assert_eq!(recorder.started_kinds(), vec!["a"]);

    wait_until("a to run again", || recorder.started_kinds().len() == 2).await;
    assert!(invalidated_at.elapsed() >= delay);

    let result = h.executor.wait(run_id).await.unwrap();
    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(result.execution("a").unwrap().attempts, 2);
}

#[tokio::test]
async fn test_optimization_raises_parallelism_of_wide_run() {
    let recorder = ExecutionRecorder::new();
    let kinds = ["w1", "w2", "w3", "w4"];
    let h = harness(fast_config().with_max_parallel(4), recording(&recorder, &kinds, 50));
    let mut submission = PipelineSubmission::new("wide", "four independent units");
    for kind in kinds {
        submission = submission.unit(WorkUnitSpec::new(kind));
    }
    let run_id = h
        .executor
        .create_run(submission.with_overrides(RunConfigOverrides {
            max_parallel_agents: Some(2),
            ..RunConfigOverrides::default()
        }))
        .unwrap();

    let preview = h.executor.optimize_configuration(run_id, false).unwrap();
    assert!(preview.applied.is_empty());
    assert_eq!(h.executor.status(run_id).unwrap().max_parallel, 2);
    assert_eq!(preview.estimated_improvement.execution_time_reduction, 30.0);
    assert_eq!(preview.estimated_improvement.resource_utilization, 20.0);
    assert_eq!(preview.estimated_improvement.failure_resilience, 0.0);

    let outcome = h.executor.optimize_configuration(run_id, true).unwrap();
    assert_eq!(
        outcome.applied,
        vec![AppliedOptimization::MaxParallelIncreased { from: 2, to: 3 }]
    );
    assert_eq!(outcome.applied[0].to_string(), "max_parallel_increased_2_to_3");
    assert!(outcome.warnings.is_empty());

    let result = h.executor.execute(run_id).await.unwrap();
    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(recorder.max_concurrency(), 3);
    assert!(matches!(
        h.executor.optimize_configuration(run_id, true),
        Err(OrchestrationError::InvalidRunState { action: "optimize", .. })
    ));
}

#[tokio::test]
async fn test_optimization_reorders_only_before_start() {
    let recorder = ExecutionRecorder::new();
    let registry = recording(&recorder, &["d1", "d2", "d3", "d4"], 0)
        .with_handler("root", Arc::new(SlowHandler::with_delay_ms(300)));
    let h = harness(fast_config().with_pipeline_optimization(false), registry);
    let fan_out = || {
        let mut submission = PipelineSubmission::new("fan", "root gates four units");
        for kind in ["d1", "d2", "d3", "d4"] {
            submission = submission.unit(WorkUnitSpec::new(kind).depends_on("root"));
        }
        submission.unit(WorkUnitSpec::new("root"))
    };

    let created = h.executor.create_run(fan_out()).unwrap();
    let outcome = h.executor.optimize_configuration(created, true).unwrap();
    assert_eq!(outcome.applied, vec![AppliedOptimization::ExecutionOrderOptimized]);
    assert_eq!(outcome.estimated_improvement.failure_resilience, 15.0);
    let run = h.executor.status(created).unwrap();
    assert_eq!(run.executions[0].kind, "root");

    let started = h.executor.create_run(fan_out()).unwrap();
    h.executor.start(started).unwrap();
    let outcome = h.executor.optimize_configuration(started, true).unwrap();
    assert!(outcome.applied.is_empty());
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(h.executor.status(started).unwrap().executions[0].kind, "d1");
    assert_eq!(h.executor.wait(started).await.unwrap().status, PipelineStatus::Success);
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let mut mock = MockWorkUnitHandler::new();
    mock.expect_execute().returning(|_, _| panic!("boom"));
    let registry = HandlerRegistry::new().with_handler("fragile", Arc::new(mock));
    let h = harness(fast_config().with_max_attempts(1), registry);

    let result = h
        .executor
        .run(PipelineSubmission::sequence("panic", "handler panics", ["fragile"]))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Failure);
    let error = result.execution("fragile").unwrap().last_error.clone().unwrap();
    assert!(error.contains("boom"), "{error}");
}

#[tokio::test]
async fn test_mock_handler_receives_dependency_output() {
    let mut mock = MockWorkUnitHandler::new();
    mock.expect_execute()
        .withf(|input, _| input.dependency("plan") == Some(&serde_json::json!({"steps": 2})))
        .times(1)
        .returning(|_, _| Ok(WorkOutput::new(serde_json::json!("built"))));
    let registry = HandlerRegistry::new()
        .with_handler("plan", Arc::new(SuccessHandler::new(serde_json::json!({"steps": 2}))))
        .with_handler("build", Arc::new(mock));
    let h = harness(fast_config(), registry);

    let result = h
        .executor
        .run(PipelineSubmission::sequence("inputs", "plan feeds build", ["plan", "build"]))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(result.outputs["build"].result, serde_json::json!("built"));
}

#[tokio::test]
async fn test_events_are_sequenced_and_ordered() {
    let recorder = ExecutionRecorder::new();
    let h = harness(fast_config(), recording(&recorder, &["a", "b"], 0));

    let result = h
        .executor
        .run(PipelineSubmission::sequence("events", "a then b", ["a", "b"]))
        .await
        .unwrap();

    let events = h.events.events();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(sequences, expected);
    assert!(events.iter().all(|e| e.run_id == result.run_id));
    assert_eq!(events.first().map(|e| e.event_type), Some(EventType::RunStarted));
    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::RunCompleted));

    let position = |event_type: EventType, kind: &str| {
        events
            .iter()
            .position(|e| e.event_type == event_type && e.payload["kind"] == serde_json::json!(kind))
            .unwrap()
    };
    assert!(position(EventType::ExecutionStarted, "a") < position(EventType::ExecutionCompleted, "a"));
    assert!(position(EventType::ExecutionCompleted, "a") < position(EventType::ExecutionStarted, "b"));
    assert!(!h.events.events_of_type("progress.updated").is_empty());
}

#[tokio::test]
async fn test_reports_after_completion() {
    let recorder = ExecutionRecorder::new();
    let h = harness(fast_config(), recording(&recorder, &["a", "b", "c"], 20));
    let submission = PipelineSubmission::new("reports", "diamond-ish")
        .unit(WorkUnitSpec::new("a"))
        .unit(WorkUnitSpec::new("b").depends_on("a"))
        .unit(WorkUnitSpec::new("c").depends_on("a"));

    let result = h.executor.run(submission).await.unwrap();
    let run_id = result.run_id;

    let metrics = h.executor.metrics(run_id).unwrap();
    assert_eq!(metrics.status, PipelineStatus::Success);
    assert_eq!(metrics.progress.completed, 3);
    assert!(metrics.monitor.is_some());
    assert!(!h.executor.history(run_id, None).unwrap().is_empty());

    let insights = h.executor.insights(run_id).unwrap();
    assert_eq!(insights.timeline.len(), 3);
    assert_eq!(insights.timeline[0].kind, "a");
    assert_eq!(insights.executions["a"].blocking_executions, 2);

    let analysis = h.executor.analyze_dependencies(run_id).unwrap();
    assert_eq!(analysis.execution_plan.len(), 2);
    assert!(h.executor.optimization_recommendations(run_id).is_ok());

    let executor_metrics = h.executor.executor_metrics();
    assert_eq!(executor_metrics.pipelines_executed, 1);
    assert_eq!(executor_metrics.successful_pipelines, 1);
    assert_eq!(executor_metrics.units_executed, 3);
    assert_eq!(executor_metrics.active_pipelines, 0);

    let health = h.executor.health_check();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.health_score, 100);

    assert_ok!(h.executor.forget_run(run_id));
    assert!(matches!(
        h.executor.status(run_id),
        Err(OrchestrationError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_runs_degrade_health() {
    let registry = HandlerRegistry::new().with_handler("bad", Arc::new(FailingHandler::new("network down")));
    let h = harness(fast_config().with_max_attempts(1), registry);

    for _ in 0..2 {
        let result = h
            .executor
            .run(PipelineSubmission::sequence("unhealthy", "fails", ["bad"]))
            .await
            .unwrap();
        assert_eq!(result.status, PipelineStatus::Failure);
    }

    let health = h.executor.health_check();
    assert!(health.health_score < 100);
    assert!(health.issues.iter().any(|i| i.contains("failure rate")));
    assert_eq!(h.executor.executor_metrics().failure_rate, 100.0);
}

#[test]
fn test_handler_error_maps_to_fault() {
    let fault = ExecutionFault::Handler(HandlerError::failed("network down").to_string());
    assert_eq!(fault.to_string(), "network down");
}
