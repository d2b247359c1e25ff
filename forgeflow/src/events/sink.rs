//! Event sink trait and implementations.

use super::OrchestrationEvent;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};

/// Receives engine lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: OrchestrationEvent);

    /// Emits an event without blocking.
    ///
    /// Must never panic; delivery failures are logged and dropped.
    fn try_emit(&self, event: OrchestrationEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: OrchestrationEvent) {}

    fn try_emit(&self, _event: OrchestrationEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &OrchestrationEvent) {
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.event_type,
                sequence = event.sequence,
                run_id = %event.run_id,
                execution_id = ?event.execution_id,
                payload = %event.payload,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                event_type = %event.event_type,
                sequence = event.sequence,
                run_id = %event.run_id,
                execution_id = ?event.execution_id,
                payload = %event.payload,
                "Event: {}", event.event_type
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: OrchestrationEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: OrchestrationEvent) {
        self.log_event(&event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<OrchestrationEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose dotted type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<OrchestrationEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.as_str().starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: OrchestrationEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: OrchestrationEvent) {
        self.events.write().push(event);
    }
}

/// Forwards events into a bounded tokio channel for an external transport.
///
/// `try_emit` drops the event when the channel is full or closed and counts
/// the drop.
#[derive(Debug)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<OrchestrationEvent>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelEventSink {
    /// Creates a sink and the receiver its events arrive on.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OrchestrationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                emitted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events delivered into the channel.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Events dropped.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: OrchestrationEvent) {
        if self.tx.send(event).await.is_ok() {
            self.emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Event channel closed, dropping event");
        }
    }

    fn try_emit(&self, event: OrchestrationEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "Dropping event");
            }
        }
    }
}
