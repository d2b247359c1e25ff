//! The per-run driver loop.
//!
//! One driver owns a run from start to finish. Each iteration it settles
//! blocked executions under the run lock, launches whatever the scheduler
//! admits and then sleeps until an attempt finishes, the run is cancelled or
//! paused, a retry becomes due or the poll interval elapses. Attempt results
//! are applied here and nowhere else, so every state change of the run is
//! serialized through this loop and the public control calls.

use super::unit::{run_attempt, AttemptOutcome, AttemptReport, AttemptRequest};
use super::{ExecutorInner, RunHandle};
use crate::core::{
    ExecutionStatus, PipelineResult, PipelineRun, PipelineStatus, WorkOutput, WorkUnitExecution,
};
use crate::errors::ExecutionFault;
use crate::events::EventType;
use crate::handlers::HandlerInput;
use crate::monitor::{publish_alerts, MonitorSettings};
use crate::recovery::{Admission, RecoveryOutcome, RecoveryReport};
use crate::scheduler::Scheduler;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

type Joined = (Uuid, Result<AttemptReport, JoinError>);

/// Drives `handle` to completion and returns its result.
pub(super) async fn drive(inner: Arc<ExecutorInner>, handle: Arc<RunHandle>) -> PipelineResult {
    let span = info_span!("pipeline_run", run_id = %handle.id);
    Driver::new(inner, handle).run().instrument(span).await
}

enum Wake {
    Finished(Uuid, Result<AttemptReport, JoinError>),
    Other,
}

/// A fallback attempt in flight: the failed kind and the kind substituting
/// for it.
struct FallbackAttempt {
    kind: String,
    fallback_kind: String,
}

/// A half-open trial held by an attempt in flight.
struct Trial {
    kind: String,
    window: u64,
}

struct Driver {
    inner: Arc<ExecutorInner>,
    handle: Arc<RunHandle>,
    in_flight: FuturesUnordered<BoxFuture<'static, Joined>>,
    aborts: HashMap<Uuid, AbortHandle>,
    fallbacks: HashMap<Uuid, FallbackAttempt>,
    trials: HashMap<Uuid, Trial>,
    not_before: HashMap<Uuid, Instant>,
    deadline: Option<Instant>,
    timed_out: bool,
    fail_fast_triggered: bool,
    paused: bool,
    last_progress: f64,
}

impl Driver {
    fn new(inner: Arc<ExecutorInner>, handle: Arc<RunHandle>) -> Self {
        let deadline = Instant::now().checked_add(handle.config.pipeline_timeout());
        Self {
            inner,
            handle,
            in_flight: FuturesUnordered::new(),
            aborts: HashMap::new(),
            fallbacks: HashMap::new(),
            trials: HashMap::new(),
            not_before: HashMap::new(),
            deadline,
            timed_out: false,
            fail_fast_triggered: false,
            paused: false,
            last_progress: 0.0,
        }
    }

    async fn run(mut self) -> PipelineResult {
        self.start();
        let handle = Arc::clone(&self.handle);
        let mut pause_rx = handle.pause.subscribe();
        let cancel = Arc::clone(&handle.cancel);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            // The run status decides; the gate only wakes the loop.
            let _ = pause_rx.borrow_and_update();
            if self.step() {
                break;
            }

            let wait = self.idle_wait();
            let wake = tokio::select! {
                () = cancel.cancelled() => Wake::Other,
                Some((id, joined)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    Wake::Finished(id, joined)
                }
                Ok(()) = pause_rx.changed() => Wake::Other,
                () = handle.wake.notified() => Wake::Other,
                () = tokio::time::sleep(wait) => Wake::Other,
            };
            if let Wake::Finished(id, joined) = wake {
                self.apply(id, joined);
            }
        }

        self.finish().await
    }

    fn start(&mut self) {
        let snapshot = {
            let mut run = self.handle.run.lock();
            if !self.handle.cancel.is_cancelled() {
                run.mark_started();
            }
            run.update_progress();
            self.last_progress = run.progress_percentage;
            let strategy = self.handle.scheduler.lock().strategy();
            self.handle.emitter.emit(
                EventType::RunStarted,
                json!({
                    "name": run.name,
                    "total_executions": run.executions.len(),
                    "max_parallel": run.max_parallel,
                    "strategy": strategy.to_string(),
                }),
            );
            info!(
                name = %run.name,
                executions = run.executions.len(),
                max_parallel = run.max_parallel,
                "Pipeline run started"
            );
            run.clone()
        };

        self.inner
            .monitor
            .register(&snapshot, MonitorSettings::from_config(&self.handle.config));
        if self.handle.config.enable_monitoring {
            self.inner.monitor.spawn(
                self.handle.id,
                Arc::clone(&self.handle.run),
                Arc::clone(&self.handle.emitter),
            );
        }
    }

    fn halted(&self) -> bool {
        self.timed_out || self.fail_fast_triggered
    }

    fn can_launch(&self) -> bool {
        !self.paused && !self.halted()
    }

    /// One scheduling pass. Returns true once the run is complete.
    fn step(&mut self) -> bool {
        let handle = Arc::clone(&self.handle);
        let requested = std::mem::take(&mut *handle.fallback_requests.lock());
        let mut run = handle.run.lock();
        let mut scheduler = handle.scheduler.lock();

        self.paused = run.status == PipelineStatus::Paused;
        for (id, at) in std::mem::take(&mut *handle.retry_requests.lock()) {
            self.not_before.insert(id, at);
        }
        for (id, fallback_kind) in requested {
            self.launch_fallback(&run, id, fallback_kind);
        }
        self.settle(&mut run, &mut scheduler);

        if !self.timed_out && self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.timed_out = true;
            warn!(
                timeout_secs = handle.config.pipeline_timeout_secs,
                "Pipeline timeout exceeded, no new executions will start"
            );
            self.cancel_waiting(&mut run, &mut scheduler, "Pipeline timeout exceeded");
        }
        self.check_fail_fast(&mut run, &mut scheduler);

        if self.in_flight.is_empty() && run.is_complete() {
            run.currently_running = 0;
            run.mark_completed();
            return true;
        }

        if self.can_launch() {
            let launched = scheduler.schedule_executions(&mut run, |e| self.admit(e));
            for id in launched {
                self.launch(&mut run, &mut scheduler, id);
            }
        }
        self.publish_progress(&run);
        false
    }

    /// Cancels executions that can never run: dependents of failed or
    /// cancelled executions, and, with resource limits on, executions whose
    /// requirements exceed the pool even when idle.
    fn settle(&mut self, run: &mut PipelineRun, scheduler: &mut Scheduler) {
        let under_fallback: HashSet<String> =
            self.fallbacks.values().map(|f| f.kind.clone()).collect();
        loop {
            let mut blocked = run.blocked_executions();
            blocked.retain(|(_, dep)| !under_fallback.contains(dep));
            if blocked.is_empty() {
                break;
            }
            for (id, dep) in blocked {
                scheduler.release(id);
                self.not_before.remove(&id);
                let Some(exec) = run.execution_mut(id) else {
                    continue;
                };
                let reason = format!("Blocked by failed dependency '{dep}'");
                if exec.cancel(reason.clone()) {
                    debug!(kind = %exec.kind, dependency = %dep, "Execution blocked");
                    self.handle.emitter.emit_for(
                        id,
                        EventType::ExecutionFailed,
                        json!({"kind": exec.kind, "status": exec.status, "error": reason}),
                    );
                }
            }
        }

        if self.handle.config.enable_resource_limits {
            for (id, err) in scheduler.unsatisfiable(run) {
                scheduler.release(id);
                let Some(exec) = run.execution_mut(id) else {
                    continue;
                };
                let message = ExecutionFault::ResourceExhaustion(err.to_string()).to_string();
                if exec.status == ExecutionStatus::Queued {
                    exec.status = ExecutionStatus::Pending;
                }
                if let Err(e) = exec.mark_terminal_failure(Some(message.clone())) {
                    warn!(error = %e, "Could not fail unsatisfiable execution");
                    continue;
                }
                warn!(kind = %exec.kind, error = %message, "Execution can never be scheduled");
                self.handle.emitter.emit_for(
                    id,
                    EventType::ExecutionFailed,
                    json!({"kind": exec.kind, "status": exec.status, "error": message}),
                );
            }
        }
        run.update_progress();
    }

    fn cancel_waiting(&mut self, run: &mut PipelineRun, scheduler: &mut Scheduler, reason: &str) {
        let waiting: Vec<Uuid> = run
            .executions
            .iter()
            .filter(|e| e.status.is_waiting())
            .map(|e| e.id)
            .collect();
        for id in waiting {
            scheduler.release(id);
            self.not_before.remove(&id);
            if let Some(exec) = run.execution_mut(id) {
                if exec.cancel(reason) {
                    self.handle.emitter.emit_for(
                        id,
                        EventType::ExecutionFailed,
                        json!({"kind": exec.kind, "status": exec.status, "error": reason}),
                    );
                }
            }
        }
        run.update_progress();
    }

    /// Halts launches once an execution has failed terminally, if the run
    /// is configured to fail fast. Executions under fallback do not count.
    fn check_fail_fast(&mut self, run: &mut PipelineRun, scheduler: &mut Scheduler) {
        if self.fail_fast_triggered || !self.handle.config.fail_fast {
            return;
        }
        let failed = run
            .executions
            .iter()
            .any(|e| e.status == ExecutionStatus::Failure && !self.fallbacks.contains_key(&e.id));
        if failed {
            self.fail_fast_triggered = true;
            warn!(failed = run.failed_count, "Fail-fast triggered, cancelling waiting executions");
            self.cancel_waiting(run, scheduler, "Cancelled by fail-fast");
        }
    }

    fn admit(&self, exec: &WorkUnitExecution) -> bool {
        let due = self
            .not_before
            .get(&exec.id)
            .map_or(true, |at| *at <= Instant::now());
        due && self.inner.recovery.circuit_allows(&exec.kind)
    }

    fn handler_input(run: &PipelineRun, exec: &WorkUnitExecution) -> HandlerInput {
        let (dependency_outputs, context) = run.dependency_inputs(exec);
        HandlerInput {
            run_id: run.id,
            execution_id: exec.id,
            kind: exec.kind.clone(),
            attempt: exec.attempt_number,
            run_name: run.name.clone(),
            brief: run.brief.clone(),
            project_context: run.project_context.clone(),
            dependency_outputs,
            context,
            configuration: exec.configuration.clone(),
        }
    }

    /// Starts an allocated execution. Anything that prevents the launch
    /// hands the allocation back so the execution is reconsidered later.
    fn launch(&mut self, run: &mut PipelineRun, scheduler: &mut Scheduler, id: Uuid) {
        let Some(kind) = run.execution(id).map(|e| e.kind.clone()) else {
            scheduler.release(id);
            return;
        };
        let Ok(permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
            debug!(kind = %kind, "Engine concurrency limit reached, deferring");
            scheduler.release(id);
            return;
        };
        let admission = match self.inner.recovery.admit_circuit(&kind) {
            Some(admission) => admission,
            None => {
                debug!(kind = %kind, "Circuit open, deferring");
                scheduler.release(id);
                return;
            }
        };

        if let Admission::Trial(window) = admission {
            self.trials.insert(id, Trial { kind: kind.clone(), window });
        }

        let Some(input) = run.execution(id).map(|exec| Self::handler_input(run, exec)) else {
            self.release_trial(id);
            scheduler.release(id);
            return;
        };
        let Some(exec) = run.execution_mut(id) else {
            self.release_trial(id);
            scheduler.release(id);
            return;
        };
        if let Err(err) = exec.mark_started() {
            warn!(kind = %kind, error = %err, "Could not start execution");
            self.release_trial(id);
            scheduler.release(id);
            return;
        }
        let attempt = exec.attempt_number;
        run.currently_running += 1;
        self.not_before.remove(&id);
        self.handle.emitter.emit_for(
            id,
            EventType::ExecutionStarted,
            json!({"kind": kind, "attempt": attempt}),
        );

        let request = AttemptRequest {
            execution_id: id,
            handler_kind: kind.clone(),
            input,
            timeout: self.handle.config.execution_timeout(),
            cancel: Arc::clone(&self.handle.cancel),
            registry: Arc::clone(&self.inner.registry),
        };
        let span = info_span!("execution", execution_id = %id, kind = %kind, attempt);
        self.track(id, tokio::spawn(run_attempt(request, permit).instrument(span)));
    }

    /// Runs the fallback handler for a failed execution. The execution keeps
    /// its allocation until the fallback reports.
    fn launch_fallback(&mut self, run: &PipelineRun, id: Uuid, fallback_kind: String) {
        let Some(exec) = run.execution(id) else {
            return;
        };
        let kind = exec.kind.clone();
        let attempt = exec.attempt_number;
        let request = AttemptRequest {
            execution_id: id,
            handler_kind: fallback_kind.clone(),
            input: Self::handler_input(run, exec),
            timeout: self.handle.config.execution_timeout(),
            cancel: Arc::clone(&self.handle.cancel),
            registry: Arc::clone(&self.inner.registry),
        };
        self.handle.emitter.emit_for(
            id,
            EventType::ExecutionStarted,
            json!({"kind": kind, "attempt": attempt, "fallback_kind": fallback_kind}),
        );
        info!(kind = %kind, fallback_kind = %fallback_kind, "Running fallback handler");
        self.fallbacks.insert(id, FallbackAttempt { kind, fallback_kind: fallback_kind.clone() });

        let permits = Arc::clone(&self.inner.permits);
        let span = info_span!("fallback", execution_id = %id, fallback_kind = %fallback_kind);
        let task = tokio::spawn(
            async move {
                match permits.acquire_owned().await {
                    Ok(permit) => run_attempt(request, permit).await,
                    Err(_) => AttemptReport {
                        execution_id: id,
                        outcome: AttemptOutcome::Failed(ExecutionFault::Handler(
                            "concurrency limiter closed".to_string(),
                        )),
                        elapsed: Duration::ZERO,
                    },
                }
            }
            .instrument(span),
        );
        self.track(id, task);
    }

    /// Hands back the half-open trial of an attempt that will never report.
    fn release_trial(&mut self, id: Uuid) {
        if let Some(trial) = self.trials.remove(&id) {
            if self.inner.recovery.release_circuit_trial(&trial.kind, trial.window) {
                debug!(kind = %trial.kind, "Returned half-open trial of abandoned attempt");
            }
        }
    }

    fn track(&mut self, id: Uuid, task: tokio::task::JoinHandle<AttemptReport>) {
        self.aborts.insert(id, task.abort_handle());
        self.in_flight.push(async move { (id, task.await) }.boxed());
    }

    /// Applies a finished attempt to the run.
    fn apply(&mut self, id: Uuid, joined: Result<AttemptReport, JoinError>) {
        self.aborts.remove(&id);
        let fallback = self.fallbacks.remove(&id);
        let outcome = match joined {
            Ok(report) => {
                debug!(
                    execution_id = %report.execution_id,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Attempt finished"
                );
                report.outcome
            }
            Err(err) => AttemptOutcome::Failed(ExecutionFault::Panicked(panic_message(err))),
        };

        let handle = Arc::clone(&self.handle);
        let mut run = handle.run.lock();
        let mut scheduler = handle.scheduler.lock();

        let expected = run.execution(id).is_some_and(|e| {
            if fallback.is_some() {
                e.status.is_failed_attempt()
            } else {
                e.status == ExecutionStatus::Running
            }
        });
        if handle.cancel.is_cancelled() || !expected {
            debug!(execution_id = %id, "Discarding result of abandoned attempt");
            self.release_trial(id);
            self.release_slot(&mut run, &mut scheduler, id);
            return;
        }

        let trial = self.trials.remove(&id);
        let continuing = match outcome {
            AttemptOutcome::Succeeded(output) => {
                self.on_success(&mut run, id, fallback.as_ref(), output);
                false
            }
            AttemptOutcome::Failed(fault) => {
                self.on_failure(&mut run, id, fallback.as_ref(), &fault)
            }
            AttemptOutcome::Cancelled => {
                let fault = ExecutionFault::Handler("Handler cancelled".to_string());
                self.on_failure(&mut run, id, fallback.as_ref(), &fault)
            }
        };

        if let Some(trial) = trial {
            // An outcome that could not be recorded never reached the breaker.
            if run.execution(id).is_some_and(|e| e.status == ExecutionStatus::Running) {
                self.inner.recovery.release_circuit_trial(&trial.kind, trial.window);
            }
        }

        self.paused = run.status == PipelineStatus::Paused;
        self.check_fail_fast(&mut run, &mut scheduler);
        if !continuing {
            if scheduler.pool().is_active(id) {
                run.currently_running = run.currently_running.saturating_sub(1);
            }
            if self.can_launch() {
                let next = scheduler.on_execution_completed(&mut run, id, |e| self.admit(e));
                if let Some(next) = next {
                    self.launch(&mut run, &mut scheduler, next);
                }
            } else {
                scheduler.release(id);
            }
        }
        self.publish_progress(&run);
    }

    fn release_slot(&self, run: &mut PipelineRun, scheduler: &mut Scheduler, id: Uuid) {
        if scheduler.release(id) {
            run.currently_running = run.currently_running.saturating_sub(1);
        }
    }

    fn on_success(
        &mut self,
        run: &mut PipelineRun,
        id: Uuid,
        fallback: Option<&FallbackAttempt>,
        output: WorkOutput,
    ) {
        let artifacts = output.artifacts.clone();
        let confidence = output.confidence;
        let recorded = match fallback {
            Some(f) => self.inner.recovery.complete_fallback(run, id, &f.fallback_kind, output),
            None => run
                .execution_mut(id)
                .map_or(Ok(()), |exec| exec.mark_completed(output)),
        };
        if let Err(err) = recorded {
            warn!(execution_id = %id, error = %err, "Could not record success");
            return;
        }
        run.artifacts.extend(artifacts);
        run.update_progress();

        let Some(exec) = run.execution(id) else {
            return;
        };
        if fallback.is_none() {
            self.inner.recovery.record_attempt_success(&exec.kind);
        }
        info!(
            kind = %exec.kind,
            attempt = exec.attempt_number,
            duration_secs = exec.duration_secs,
            "Execution completed"
        );
        self.handle.emitter.emit_for(
            id,
            EventType::ExecutionCompleted,
            json!({
                "kind": exec.kind,
                "attempt": exec.attempt_number,
                "duration_secs": exec.duration_secs,
                "confidence": confidence,
                "fallback_kind": fallback.map(|f| f.fallback_kind.clone()),
            }),
        );
    }

    /// Returns true when a fallback attempt was launched and the execution
    /// keeps its slot.
    fn on_failure(
        &mut self,
        run: &mut PipelineRun,
        id: Uuid,
        fallback: Option<&FallbackAttempt>,
        fault: &ExecutionFault,
    ) -> bool {
        let error = fault.to_string();
        if let Some(f) = fallback {
            if let Err(err) = self.inner.recovery.fail_fallback(run, id, &f.fallback_kind, &error) {
                warn!(execution_id = %id, error = %err, "Could not record fallback failure");
            }
            self.handle.emitter.emit_for(
                id,
                EventType::ExecutionFailed,
                json!({"kind": f.kind, "error": error, "fallback_kind": f.fallback_kind}),
            );
            return false;
        }

        let Some(exec) = run.execution_mut(id) else {
            return false;
        };
        let kind = exec.kind.clone();
        let attempt = exec.attempt_number;
        let marked = if fault.is_timeout() {
            exec.mark_timed_out(error.clone())
        } else {
            exec.mark_failed(error.clone())
        };
        if let Err(err) = marked {
            warn!(kind = %kind, error = %err, "Could not record failed attempt");
            return false;
        }
        warn!(kind = %kind, attempt, error = %error, "Attempt failed");
        self.inner.recovery.record_attempt_failure(&kind);

        let report = match self.inner.recovery.handle_execution_failure(run, id, fault) {
            Ok(report) => report,
            Err(err) => {
                error!(kind = %kind, error = %err, "Recovery failed, failing execution");
                if let Some(exec) = run.execution_mut(id) {
                    if let Err(e) = exec.mark_terminal_failure(Some(error.clone())) {
                        warn!(kind = %kind, error = %e, "Could not fail execution");
                    }
                }
                run.update_progress();
                self.handle.emitter.emit_for(
                    id,
                    EventType::ExecutionFailed,
                    json!({"kind": kind, "error": error, "attempts": attempt}),
                );
                return false;
            }
        };
        self.apply_recovery(run, id, &kind, attempt, report)
    }

    fn apply_recovery(
        &mut self,
        run: &mut PipelineRun,
        id: Uuid,
        kind: &str,
        attempt: u32,
        report: RecoveryReport,
    ) -> bool {
        for rolled in &report.rolled_back {
            self.not_before.remove(rolled);
        }
        let strategy = report.strategy.to_string();
        let category = report.analysis.category.to_string();
        match report.outcome {
            RecoveryOutcome::Retry { delay } => {
                if let Some(at) = Instant::now().checked_add(delay) {
                    self.not_before.insert(id, at);
                }
                self.handle.emitter.emit_for(
                    id,
                    EventType::ExecutionRetrying,
                    json!({
                        "kind": kind,
                        "attempt": attempt,
                        "next_attempt": attempt + 1,
                        "delay_ms": delay.as_millis() as u64,
                        "strategy": strategy,
                        "category": category,
                        "error": report.analysis.error,
                        "rolled_back": report.rolled_back.len(),
                    }),
                );
                false
            }
            RecoveryOutcome::Resolved => {
                self.handle.emitter.emit_for(
                    id,
                    EventType::ExecutionCompleted,
                    json!({
                        "kind": kind,
                        "attempt": attempt,
                        "skipped": true,
                        "strategy": strategy,
                    }),
                );
                false
            }
            RecoveryOutcome::Fallback { fallback_kind } => {
                self.launch_fallback(run, id, fallback_kind);
                true
            }
            RecoveryOutcome::Terminal { intervention } => {
                let error = run
                    .execution(id)
                    .and_then(|e| e.last_error.clone())
                    .unwrap_or(report.analysis.error);
                error!(kind = %kind, attempts = attempt, error = %error, "Execution failed");
                self.handle.emitter.emit_for(
                    id,
                    EventType::ExecutionFailed,
                    json!({
                        "kind": kind,
                        "error": error,
                        "attempts": attempt,
                        "strategy": strategy,
                        "category": category,
                    }),
                );
                if let Some(record) = intervention {
                    self.handle.emitter.emit_for(
                        id,
                        EventType::InterventionRequired,
                        serde_json::to_value(&record).unwrap_or_default(),
                    );
                }
                false
            }
        }
    }

    fn publish_progress(&mut self, run: &PipelineRun) {
        if (run.progress_percentage - self.last_progress).abs() <= f64::EPSILON {
            return;
        }
        self.last_progress = run.progress_percentage;
        if !self.handle.config.enable_progress_tracking {
            return;
        }
        self.handle.emitter.emit(
            EventType::ProgressUpdated,
            json!({
                "progress": run.progress_percentage,
                "completed": run.completed_count,
                "failed": run.failed_count,
                "total": run.executions.len(),
            }),
        );
    }

    /// How long to sleep when nothing finishes in the meantime.
    fn idle_wait(&self) -> Duration {
        let now = Instant::now();
        let mut wait = self.handle.config.poll_interval();
        if self.can_launch() {
            if let Some(next) = self.not_before.values().min() {
                wait = wait.min(next.saturating_duration_since(now));
            }
        }
        if !self.timed_out {
            if let Some(deadline) = self.deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
        }
        wait.max(Duration::from_millis(1))
    }

    async fn finish(mut self) -> PipelineResult {
        let run_id = self.handle.id;
        if !self.aborts.is_empty() {
            debug!(count = self.aborts.len(), "Aborting in-flight attempts");
        }
        for (id, abort) in std::mem::take(&mut self.aborts) {
            abort.abort();
            self.release_trial(id);
        }
        self.in_flight = FuturesUnordered::new();

        let (result, snapshot) = {
            let mut run = self.handle.run.lock();
            let mut scheduler = self.handle.scheduler.lock();
            let released = scheduler.release_all();
            if !released.is_empty() {
                debug!(count = released.len(), "Released allocations of abandoned executions");
            }
            run.currently_running = 0;
            if run.completed_at.is_none() {
                run.cancel_pending("Pipeline stopped");
                run.mark_completed();
            }
            (PipelineResult::from_run(&run), run.clone())
        };

        self.inner.monitor.stop(run_id).await;
        let alerts = self.inner.monitor.observe(&snapshot);
        publish_alerts(&self.handle.emitter, &alerts);

        self.handle.emitter.emit(
            EventType::RunCompleted,
            json!({
                "status": result.status,
                "duration_secs": result.duration_secs,
                "successful_kinds": result.successful_kinds,
                "failed_kinds": result.failed_kinds,
                "retry_count": result.retry_count,
                "parallel_efficiency": result.parallel_efficiency,
            }),
        );
        info!(
            status = %result.status,
            duration_secs = result.duration_secs,
            succeeded = result.successful_kinds.len(),
            failed = result.failed_kinds.len(),
            "Pipeline run finished"
        );

        self.inner.record_completion(&result);
        self.handle.done.send_replace(Some(result.clone()));
        result
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}
