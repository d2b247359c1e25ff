//! One handler invocation.
//!
//! An attempt task never touches the run. It resolves the handler, runs it
//! under the execution timeout and reports what happened; the driver loop
//! applies the report under the run lock. A task abandoned by a cancelled
//! run therefore cannot corrupt run state.

use crate::cancellation::CancellationToken;
use crate::core::WorkOutput;
use crate::errors::{ExecutionFault, HandlerError};
use crate::handlers::{HandlerInput, HandlerRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};
use uuid::Uuid;

/// How an attempt ended.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    /// The handler returned output.
    Succeeded(WorkOutput),
    /// The attempt failed.
    Failed(ExecutionFault),
    /// The handler stopped because the run was cancelled.
    Cancelled,
}

/// What the driver needs to apply an attempt's result.
#[derive(Debug)]
pub(crate) struct AttemptReport {
    pub execution_id: Uuid,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// Everything an attempt task owns.
pub(crate) struct AttemptRequest {
    pub execution_id: Uuid,
    /// Kind whose handler is invoked (the fallback kind for fallbacks).
    pub handler_kind: String,
    pub input: HandlerInput,
    pub timeout: Duration,
    pub cancel: Arc<CancellationToken>,
    pub registry: Arc<HandlerRegistry>,
}

/// Runs one attempt while holding a global concurrency permit.
pub(crate) async fn run_attempt(
    request: AttemptRequest,
    permit: OwnedSemaphorePermit,
) -> AttemptReport {
    let started = Instant::now();
    let outcome = invoke(&request).await;
    drop(permit);
    AttemptReport {
        execution_id: request.execution_id,
        outcome,
        elapsed: started.elapsed(),
    }
}

async fn invoke(request: &AttemptRequest) -> AttemptOutcome {
    let Some(handler) = request.registry.create(&request.handler_kind) else {
        warn!(kind = %request.handler_kind, "No handler registered");
        return AttemptOutcome::Failed(ExecutionFault::MissingHandler(request.handler_kind.clone()));
    };

    debug!(kind = %request.handler_kind, attempt = request.input.attempt, "Invoking handler");
    let call = handler.execute(request.input.clone(), Arc::clone(&request.cancel));
    match tokio::time::timeout(request.timeout, call).await {
        Ok(Ok(output)) => AttemptOutcome::Succeeded(output),
        Ok(Err(HandlerError::Cancelled)) if request.cancel.is_cancelled() => {
            AttemptOutcome::Cancelled
        }
        Ok(Err(err)) => AttemptOutcome::Failed(ExecutionFault::Handler(err.to_string())),
        Err(_) => AttemptOutcome::Failed(ExecutionFault::Timeout {
            seconds: request.timeout.as_secs_f64(),
        }),
    }
}
