//! Overflow priority queue for ready executions that could not be allocated.

use crate::core::WorkUnitExecution;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use uuid::Uuid;

/// Queue score: priority, minus 5 per dependency, plus one per minute
/// waited, plus up to 10 for short tasks.
#[must_use]
pub fn priority_score(execution: &WorkUnitExecution, now: DateTime<Utc>) -> f64 {
    let waited_minutes = (now - execution.created_at).num_seconds().max(0) as f64 / 60.0;
    let duration_factor = execution
        .estimated_duration_secs
        .map_or(1.0, |est| (1.0 - est / 600.0).max(0.5));
    f64::from(execution.priority) - execution.depends_on.len() as f64 * 5.0
        + waited_minutes
        + duration_factor * 10.0
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    score: f64,
    seq: u64,
    execution_id: Uuid,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher score first; among equal scores, earlier entries first.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Max-heap of execution ids keyed by score.
///
/// An execution appears at most once; pushing an id that is already queued
/// keeps its original position.
#[derive(Debug, Default, Clone)]
pub struct ExecutionQueue {
    heap: BinaryHeap<Entry>,
    /// id -> sequence number of its live entry
    members: HashMap<Uuid, u64>,
    next_seq: u64,
}

impl ExecutionQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an execution. Returns false if it was already queued.
    pub fn push(&mut self, execution_id: Uuid, score: f64) -> bool {
        if self.members.contains_key(&execution_id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(execution_id, seq);
        self.heap.push(Entry {
            score,
            seq,
            execution_id,
        });
        true
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.members.get(&top.execution_id) == Some(&top.seq) {
                return;
            }
            self.heap.pop();
        }
    }

    /// The head entry without removing it.
    pub fn peek(&mut self) -> Option<(Uuid, f64)> {
        self.discard_stale();
        self.heap.peek().map(|e| (e.execution_id, e.score))
    }

    /// Removes and returns the head.
    pub fn pop(&mut self) -> Option<Uuid> {
        self.discard_stale();
        let entry = self.heap.pop()?;
        self.members.remove(&entry.execution_id);
        Some(entry.execution_id)
    }

    /// Removes an execution wherever it is. Returns true if it was queued.
    pub fn remove(&mut self, execution_id: Uuid) -> bool {
        self.members.remove(&execution_id).is_some()
    }

    /// True if the execution is queued.
    #[must_use]
    pub fn contains(&self, execution_id: Uuid) -> bool {
        self.members.contains_key(&execution_id)
    }

    /// Number of queued executions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.members.clear();
    }
}
