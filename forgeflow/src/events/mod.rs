//! Lifecycle events emitted by the engine.
//!
//! Every run numbers its events from 1, so a consumer can restore order
//! even when a transport delivers them out of order. Delivery is left to the
//! [`EventSink`] implementation.

mod sink;

pub use sink::{ChannelEventSink, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// The driver loop started.
    #[serde(rename = "run.started")]
    RunStarted,
    /// The run reached a terminal status.
    #[serde(rename = "run.completed")]
    RunCompleted,
    /// New launches were suspended.
    #[serde(rename = "run.paused")]
    RunPaused,
    /// New launches resumed.
    #[serde(rename = "run.resumed")]
    RunResumed,
    /// The run was cancelled.
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    /// An attempt started.
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    /// An execution succeeded (including substitutes).
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    /// An execution failed terminally.
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    /// An attempt failed and will be retried.
    #[serde(rename = "execution.retrying")]
    ExecutionRetrying,
    /// Run progress changed.
    #[serde(rename = "progress.updated")]
    ProgressUpdated,
    /// The monitor raised an alert.
    #[serde(rename = "alert.raised")]
    AlertRaised,
    /// A failure needs a human.
    #[serde(rename = "intervention.required")]
    InterventionRequired,
}

impl EventType {
    /// Dotted name, e.g. `execution.started`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunPaused => "run.paused",
            Self::RunResumed => "run.resumed",
            Self::RunCancelled => "run.cancelled",
            Self::ExecutionStarted => "execution.started",
            Self::ExecutionCompleted => "execution.completed",
            Self::ExecutionFailed => "execution.failed",
            Self::ExecutionRetrying => "execution.retrying",
            Self::ProgressUpdated => "progress.updated",
            Self::AlertRaised => "alert.raised",
            Self::InterventionRequired => "intervention.required",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    /// Per-run sequence number, starting at 1.
    pub sequence: u64,
    /// Event kind.
    pub event_type: EventType,
    /// Owning run.
    pub run_id: Uuid,
    /// Execution, when the event concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Structured payload.
    #[serde(default)]
    pub payload: Value,
}

impl OrchestrationEvent {
    /// Creates a run-level event.
    #[must_use]
    pub fn new(sequence: u64, event_type: EventType, run_id: Uuid, payload: Value) -> Self {
        Self {
            sequence,
            event_type,
            run_id,
            execution_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Attaches an execution id.
    #[must_use]
    pub fn with_execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }
}

/// Numbers and forwards the events of one run.
///
/// Sequence assignment and hand-off to the sink happen under one lock, so
/// the sink observes events in sequence order even when the driver loop
/// and the monitor emit concurrently.
pub struct RunEmitter {
    run_id: Uuid,
    sink: Arc<dyn EventSink>,
    sequence: Mutex<u64>,
}

impl RunEmitter {
    /// Creates an emitter for `run_id`.
    #[must_use]
    pub fn new(run_id: Uuid, sink: Arc<dyn EventSink>) -> Self {
        Self {
            run_id,
            sink,
            sequence: Mutex::new(0),
        }
    }

    /// Emits a run-level event.
    pub fn emit(&self, event_type: EventType, payload: Value) {
        self.send(event_type, None, payload);
    }

    /// Emits an event about one execution.
    pub fn emit_for(&self, execution_id: Uuid, event_type: EventType, payload: Value) {
        self.send(event_type, Some(execution_id), payload);
    }

    /// Number of events emitted so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        *self.sequence.lock()
    }

    fn send(&self, event_type: EventType, execution_id: Option<Uuid>, payload: Value) {
        let mut sequence = self.sequence.lock();
        *sequence += 1;
        let mut event = OrchestrationEvent::new(*sequence, event_type, self.run_id, payload);
        event.execution_id = execution_id;
        self.sink.try_emit(event);
    }
}

impl fmt::Debug for RunEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunEmitter")
            .field("run_id", &self.run_id)
            .field("emitted", &self.emitted())
            .finish_non_exhaustive()
    }
}
