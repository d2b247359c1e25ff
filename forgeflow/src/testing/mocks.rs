//! Mock work-unit handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::core::WorkOutput;
use crate::errors::HandlerError;
use crate::handlers::{HandlerInput, WorkUnitHandler};

/// Sleeps for `delay` unless the token is cancelled first.
async fn cancellable_sleep(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), HandlerError> {
    tokio::select! {
        () = cancel.cancelled() => Err(HandlerError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// A handler that always succeeds.
#[derive(Debug)]
pub struct SuccessHandler {
    output: WorkOutput,
    calls: AtomicUsize,
}

impl SuccessHandler {
    /// Succeeds with `result`.
    #[must_use]
    pub fn new(result: Value) -> Self {
        Self::with_output(WorkOutput::new(result))
    }

    /// Succeeds with a prepared output.
    #[must_use]
    pub fn with_output(output: WorkOutput) -> Self {
        Self {
            output,
            calls: AtomicUsize::new(0),
        }
    }

    /// Times invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkUnitHandler for SuccessHandler {
    async fn execute(
        &self,
        _input: HandlerInput,
        _cancel: Arc<CancellationToken>,
    ) -> Result<WorkOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// A handler that always fails with the same message.
#[derive(Debug)]
pub struct FailingHandler {
    error: String,
    calls: AtomicUsize,
}

impl FailingHandler {
    /// Fails with `error`.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Times invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkUnitHandler for FailingHandler {
    async fn execute(
        &self,
        _input: HandlerInput,
        _cancel: Arc<CancellationToken>,
    ) -> Result<WorkOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::failed(self.error.clone()))
    }
}

/// A handler that fails a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FlakyHandler {
    failures: usize,
    error: String,
    result: Value,
    calls: AtomicUsize,
}

impl FlakyHandler {
    /// Fails the first `failures` calls with `error`.
    #[must_use]
    pub fn new(failures: usize, error: impl Into<String>) -> Self {
        Self {
            failures,
            error: error.into(),
            result: json!({"recovered": true}),
            calls: AtomicUsize::new(0),
        }
    }

    /// Times invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkUnitHandler for FlakyHandler {
    async fn execute(
        &self,
        input: HandlerInput,
        _cancel: Arc<CancellationToken>,
    ) -> Result<WorkOutput, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(HandlerError::failed(format!("{} (call {})", self.error, call + 1)));
        }
        Ok(WorkOutput::new(self.result.clone()).with_metadata("attempt", json!(input.attempt)))
    }
}

/// A handler that takes a while and honours cancellation.
#[derive(Debug)]
pub struct SlowHandler {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowHandler {
    /// Sleeps `delay` before succeeding.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleeps `ms` milliseconds before succeeding.
    #[must_use]
    pub fn with_delay_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// Times invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkUnitHandler for SlowHandler {
    async fn execute(
        &self,
        input: HandlerInput,
        cancel: Arc<CancellationToken>,
    ) -> Result<WorkOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cancellable_sleep(self.delay, &cancel).await?;
        Ok(WorkOutput::new(json!({"kind": input.kind})))
    }
}

/// One call seen by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Kind invoked.
    pub kind: String,
    /// Attempt number.
    pub attempt: u32,
    /// Kinds whose outputs were passed in, sorted.
    pub dependency_kinds: Vec<String>,
    /// Merged context updates of the dependencies.
    pub context: HashMap<String, Value>,
    /// Calls that had already finished when this one began.
    pub finished_before: usize,
}

#[derive(Debug, Default)]
struct RecorderState {
    started: Vec<RecordedCall>,
    finished: Vec<String>,
    active: usize,
    max_active: usize,
}

/// Shared log of calls across several [`RecordingHandler`]s.
#[derive(Debug, Default)]
pub struct ExecutionRecorder {
    state: Mutex<RecorderState>,
}

impl ExecutionRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn begin(&self, mut call: RecordedCall) {
        let mut state = self.state.lock();
        call.finished_before = state.finished.len();
        state.started.push(call);
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
    }

    fn end(&self, kind: &str) {
        let mut state = self.state.lock();
        state.finished.push(kind.to_string());
        state.active = state.active.saturating_sub(1);
    }

    /// Every call, in start order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().started.clone()
    }

    /// Kinds in start order.
    #[must_use]
    pub fn started_kinds(&self) -> Vec<String> {
        self.state.lock().started.iter().map(|c| c.kind.clone()).collect()
    }

    /// Kinds in completion order.
    #[must_use]
    pub fn finished_kinds(&self) -> Vec<String> {
        self.state.lock().finished.clone()
    }

    /// Index of the first start of `kind`.
    #[must_use]
    pub fn start_position(&self, kind: &str) -> Option<usize> {
        self.state.lock().started.iter().position(|c| c.kind == kind)
    }

    /// Index of the first completion of `kind`.
    #[must_use]
    pub fn finish_position(&self, kind: &str) -> Option<usize> {
        self.state.lock().finished.iter().position(|k| k == kind)
    }

    /// Most calls in progress at once.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.state.lock().max_active
    }
}

/// A handler that logs every call to a shared [`ExecutionRecorder`] and
/// succeeds after an optional delay.
#[derive(Debug)]
pub struct RecordingHandler {
    recorder: Arc<ExecutionRecorder>,
    delay: Duration,
}

impl RecordingHandler {
    /// Records into `recorder` and succeeds immediately.
    #[must_use]
    pub fn new(recorder: Arc<ExecutionRecorder>) -> Self {
        Self {
            recorder,
            delay: Duration::ZERO,
        }
    }

    /// Holds each call open for `ms` milliseconds.
    #[must_use]
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }
}

#[async_trait]
impl WorkUnitHandler for RecordingHandler {
    async fn execute(
        &self,
        input: HandlerInput,
        cancel: Arc<CancellationToken>,
    ) -> Result<WorkOutput, HandlerError> {
        let mut dependency_kinds: Vec<String> = input.dependency_outputs.keys().cloned().collect();
        dependency_kinds.sort();
        self.recorder.begin(RecordedCall {
            kind: input.kind.clone(),
            attempt: input.attempt,
            dependency_kinds: dependency_kinds.clone(),
            context: input.context.clone(),
            finished_before: 0,
        });
        let slept = if self.delay.is_zero() {
            Ok(())
        } else {
            cancellable_sleep(self.delay, &cancel).await
        };
        self.recorder.end(&input.kind);
        slept?;
        Ok(WorkOutput::new(json!({"kind": input.kind, "inputs": dependency_kinds}))
            .with_context_update(format!("{}_done", input.kind), json!(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn input(kind: &str) -> HandlerInput {
        HandlerInput {
            run_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            kind: kind.into(),
            attempt: 1,
            run_name: "test".into(),
            brief: "brief".into(),
            project_context: HashMap::new(),
            dependency_outputs: HashMap::from([("a".to_string(), json!(1))]),
            context: HashMap::new(),
            configuration: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_flaky_handler_recovers() {
        let handler = FlakyHandler::new(2, "network timeout");
        let token = Arc::new(CancellationToken::new());
        assert!(handler.execute(input("x"), Arc::clone(&token)).await.is_err());
        assert!(handler.execute(input("x"), Arc::clone(&token)).await.is_err());
        assert!(handler.execute(input("x"), token).await.is_ok());
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn test_slow_handler_observes_cancel() {
        let handler = SlowHandler::with_delay_ms(10_000);
        let token = Arc::new(CancellationToken::new());
        token.cancel("stop");
        let result = handler.execute(input("x"), token).await;
        assert!(matches!(result, Err(HandlerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_recorder_tracks_calls() {
        let recorder = ExecutionRecorder::new();
        let handler = RecordingHandler::new(Arc::clone(&recorder));
        let output = handler
            .execute(input("b"), Arc::new(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(output.result, json!({"kind": "b", "inputs": ["a"]}));
        assert_eq!(recorder.started_kinds(), vec!["b".to_string()]);
        assert_eq!(recorder.calls()[0].dependency_kinds, vec!["a".to_string()]);
        assert_eq!(recorder.max_concurrency(), 1);
    }
}
