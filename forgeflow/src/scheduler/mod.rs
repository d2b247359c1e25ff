//! Scheduling of ready executions onto a bounded resource pool.
//!
//! Each run owns one [`Scheduler`]. Ready executions are ordered by the
//! configured [`SchedulingStrategy`] and allocated greedily up to the
//! caller's parallelism ceiling; whatever does not fit goes to an overflow
//! [`ExecutionQueue`] and is promoted as allocations are released.

mod queue;
mod resources;
mod strategy;

pub use queue::{priority_score, ExecutionQueue};
pub use resources::{AllocationError, PoolUsage, ResourceLimits, ResourcePool};
pub use strategy::{
    CriticalPathStrategy, PriorityStrategy, ResourceAwareStrategy, SchedulingStrategy, StrategyKind,
};

use crate::config::OrchestrationConfig;
use crate::core::{ExecutionStatus, PipelineRun, WorkUnitExecution};
use crate::graph::DependencyManager;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// Scheduler counters plus current pool usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Strategy in use.
    pub strategy: StrategyKind,
    /// Executions allocated directly by a scheduling pass.
    pub total_scheduled: u64,
    /// Executions placed in the overflow queue.
    pub total_queued: u64,
    /// Executions promoted out of the queue.
    pub total_promoted: u64,
    /// Current queue length.
    pub queue_size: usize,
    /// Pool usage.
    pub pool: PoolUsage,
}

/// Structural report on how well a run can be scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOptimization {
    /// Number of dependency levels divided by the number of executions.
    /// 1.0 means fully serial.
    pub serial_ratio: f64,
    /// Kinds that a large share of the run depends on, directly or not.
    pub bottlenecks: Vec<String>,
    /// Share of slots the widest level can use.
    pub slot_efficiency: f64,
    /// Human-readable recommendations.
    pub recommendations: Vec<String>,
}

/// Orders and allocates ready executions for one run.
#[derive(Debug)]
pub struct Scheduler {
    strategy: Box<dyn SchedulingStrategy>,
    pool: ResourcePool,
    queue: ExecutionQueue,
    total_scheduled: u64,
    total_queued: u64,
    total_promoted: u64,
}

impl Scheduler {
    /// Creates a scheduler using the configuration's strategy and limits.
    #[must_use]
    pub fn new(config: &OrchestrationConfig) -> Self {
        Self {
            strategy: config.effective_strategy().build(),
            pool: ResourcePool::new(ResourceLimits::from_config(config)),
            queue: ExecutionQueue::new(),
            total_scheduled: 0,
            total_queued: 0,
            total_promoted: 0,
        }
    }

    /// Replaces the ordering strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn SchedulingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Changes the pool's slot count.
    pub fn set_max_parallel(&mut self, slots: usize) {
        self.pool.set_max_slots(slots);
    }

    /// The strategy in use.
    #[must_use]
    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// The resource pool.
    #[must_use]
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// The overflow queue length.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn slots_left(run: &PipelineRun, launched: usize) -> usize {
        run.max_parallel
            .saturating_sub(run.currently_running)
            .saturating_sub(launched)
    }

    /// Allocates ready executions and returns the ids to launch.
    ///
    /// Queued executions are tried first, in queue order. Remaining ready
    /// executions for which `admit` returns true are ordered by the strategy
    /// and allocated until the pool or the run's parallelism ceiling refuses;
    /// the rest are queued and marked `Queued`.
    pub fn schedule_executions<F>(&mut self, run: &mut PipelineRun, admit: F) -> Vec<Uuid>
    where
        F: Fn(&WorkUnitExecution) -> bool,
    {
        let mut launched = Vec::new();
        while Self::slots_left(run, launched.len()) > 0 {
            match self.promote_head(run, &admit) {
                Some(id) => launched.push(id),
                None => break,
            }
        }

        let now = Utc::now();
        let ordered: Vec<(Uuid, f64)> = {
            let ready: Vec<&WorkUnitExecution> = run
                .ready_executions()
                .into_iter()
                .filter(|e| !self.pool.is_active(e.id) && !self.queue.contains(e.id) && admit(e))
                .collect();
            self.strategy
                .prioritize(ready, run)
                .into_iter()
                .map(|e| (e.id, priority_score(e, now)))
                .collect()
        };

        for (id, score) in ordered {
            let allocated = Self::slots_left(run, launched.len()) > 0
                && run
                    .execution(id)
                    .is_some_and(|exec| self.pool.allocate(exec).is_ok());
            if allocated {
                self.total_scheduled += 1;
                launched.push(id);
            } else if self.queue.push(id, score) {
                self.total_queued += 1;
                debug!(
                    execution_id = %id,
                    score,
                    queue_size = self.queue.len(),
                    "Execution queued"
                );
                if let Some(exec) = run.execution_mut(id) {
                    if exec.status == ExecutionStatus::Pending {
                        let _ = exec.transition(ExecutionStatus::Queued);
                    }
                }
            }
        }
        launched
    }

    /// Pops the queue head if it can be allocated now.
    ///
    /// Entries that are no longer ready are discarded (and returned to
    /// `Pending` if still queued). A live head that cannot be allocated stays
    /// at the head and nothing is returned.
    fn promote_head<F>(&mut self, run: &mut PipelineRun, admit: &F) -> Option<Uuid>
    where
        F: Fn(&WorkUnitExecution) -> bool,
    {
        loop {
            let (id, _) = self.queue.peek()?;
            let succeeded = run.succeeded_kinds();
            let (ready, allocatable) = match run.execution(id) {
                Some(exec) => (
                    exec.status.is_waiting() && exec.dependencies_satisfied(&succeeded),
                    admit(exec) && self.pool.can_allocate(exec),
                ),
                None => (false, false),
            };
            if !ready {
                self.queue.pop();
                if let Some(exec) = run.execution_mut(id) {
                    if exec.status == ExecutionStatus::Queued {
                        let _ = exec.transition(ExecutionStatus::Pending);
                    }
                }
                continue;
            }
            if !allocatable {
                return None;
            }
            self.queue.pop();
            let exec = run.execution(id)?;
            if self.pool.allocate(exec).is_err() {
                return None;
            }
            self.total_promoted += 1;
            debug!(execution_id = %id, "Promoted queued execution");
            return Some(id);
        }
    }

    /// Promotes the queue head when a slot is free.
    pub fn promote_next<F>(&mut self, run: &mut PipelineRun, admit: F) -> Option<Uuid>
    where
        F: Fn(&WorkUnitExecution) -> bool,
    {
        if Self::slots_left(run, 0) == 0 {
            return None;
        }
        self.promote_head(run, &admit)
    }

    /// Releases an allocation. Returns false if none was held.
    pub fn release(&mut self, execution_id: Uuid) -> bool {
        self.queue.remove(execution_id);
        self.pool.release(execution_id)
    }

    /// Releases an execution's allocation and promotes the next queued one.
    pub fn on_execution_completed<F>(
        &mut self,
        run: &mut PipelineRun,
        execution_id: Uuid,
        admit: F,
    ) -> Option<Uuid>
    where
        F: Fn(&WorkUnitExecution) -> bool,
    {
        self.release(execution_id);
        self.promote_next(run, admit)
    }

    /// Releases every allocation and clears the queue, returning the ids
    /// that held an allocation.
    pub fn release_all(&mut self) -> Vec<Uuid> {
        let ids = self.pool.active_ids();
        for id in &ids {
            self.pool.release(*id);
        }
        self.queue.clear();
        ids
    }

    /// Waiting executions whose requirements exceed the pool's ceilings
    /// even when nothing else is running.
    #[must_use]
    pub fn unsatisfiable(&self, run: &PipelineRun) -> Vec<(Uuid, AllocationError)> {
        run.executions
            .iter()
            .filter(|e| e.status.is_waiting())
            .filter_map(|e| self.pool.check_fits_idle(e).err().map(|err| (e.id, err)))
            .collect()
    }

    /// Counters and pool usage.
    #[must_use]
    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            strategy: self.strategy.kind(),
            total_scheduled: self.total_scheduled,
            total_queued: self.total_queued,
            total_promoted: self.total_promoted,
            queue_size: self.queue.len(),
            pool: self.pool.usage(),
        }
    }

    /// Structural analysis of the run's schedule.
    #[must_use]
    pub fn optimize_schedule(&self, run: &PipelineRun) -> ScheduleOptimization {
        let manager = DependencyManager::from_run(run);
        let graph = manager.graph();
        let total = run.executions.len();
        let levels = graph.execution_levels().unwrap_or_default();

        let serial_ratio = if total == 0 {
            0.0
        } else {
            levels.len() as f64 / total as f64
        };
        let widest = levels.iter().map(Vec::len).max().unwrap_or(0);
        let slot_efficiency = if run.max_parallel == 0 {
            0.0
        } else {
            (widest.min(run.max_parallel) as f64 / run.max_parallel as f64).min(1.0)
        };

        let declared: HashSet<&str> = run.executions.iter().map(|e| e.kind.as_str()).collect();
        let threshold = (total as f64 * 0.3).ceil().max(2.0) as usize;
        let mut bottlenecks: Vec<String> = declared
            .iter()
            .filter(|kind| graph.descendants(kind).len() >= threshold)
            .map(|kind| (*kind).to_string())
            .collect();
        bottlenecks.sort();

        let mut recommendations = Vec::new();
        if total > 1 && serial_ratio > 0.8 {
            recommendations.push(format!(
                "Pipeline is mostly serial ({} levels for {} executions); consider removing dependencies",
                levels.len(),
                total
            ));
        }
        if widest > run.max_parallel {
            recommendations.push(format!(
                "Widest level has {widest} executions but only {} slots; consider raising max_parallel",
                run.max_parallel
            ));
        }
        if total > 0 && widest < run.max_parallel {
            recommendations.push(format!(
                "At most {widest} of {} slots can be used at once",
                run.max_parallel
            ));
        }
        for kind in &bottlenecks {
            recommendations.push(format!(
                "'{kind}' gates most of the pipeline; keep it fast and reliable"
            ));
        }

        ScheduleOptimization {
            serial_ratio,
            bottlenecks,
            slot_efficiency,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineSubmission, ResourceRequirements, WorkOutput, WorkUnitSpec};
    use pretty_assertions::assert_eq;

    fn kinds(run: &PipelineRun, ids: &[Uuid]) -> Vec<String> {
        ids.iter()
            .map(|id| run.execution(*id).unwrap().kind.clone())
            .collect()
    }

    fn start(run: &mut PipelineRun, ids: &[Uuid]) {
        for id in ids {
            run.execution_mut(*id).unwrap().mark_started().unwrap();
        }
        run.currently_running += ids.len();
    }

    fn finish(run: &mut PipelineRun, id: Uuid) {
        run.execution_mut(id)
            .unwrap()
            .mark_completed(WorkOutput::default())
            .unwrap();
        run.currently_running -= 1;
    }

    fn wide(n: usize, max_parallel: usize) -> (PipelineRun, Scheduler) {
        let mut submission = PipelineSubmission::new("wide", "b");
        for i in 0..n {
            submission = submission.unit(WorkUnitSpec::new(format!("u{i}")).with_priority(90 - i as u8));
        }
        let config = OrchestrationConfig::default().with_max_parallel(max_parallel);
        (PipelineRun::from_submission(&submission, &config), Scheduler::new(&config))
    }

    #[test]
    fn test_allocates_up_to_ceiling_and_queues_rest() {
        let (mut run, mut scheduler) = wide(5, 2);
        let launched = scheduler.schedule_executions(&mut run, |_| true);
        assert_eq!(kinds(&run, &launched), vec!["u0", "u1"]);
        assert_eq!(scheduler.queue_len(), 3);
        assert_eq!(run.execution_by_kind("u2").unwrap().status, ExecutionStatus::Queued);

        start(&mut run, &launched);
        // Nothing more fits while both slots are busy.
        assert!(scheduler.schedule_executions(&mut run, |_| true).is_empty());
        assert_eq!(scheduler.metrics().total_queued, 3);
    }

    #[test]
    fn test_completion_promotes_queue_head() {
        let (mut run, mut scheduler) = wide(4, 2);
        let launched = scheduler.schedule_executions(&mut run, |_| true);
        start(&mut run, &launched);

        finish(&mut run, launched[0]);
        let promoted = scheduler.on_execution_completed(&mut run, launched[0], |_| true);
        assert_eq!(promoted.map(|id| run.execution(id).unwrap().kind.clone()), Some("u2".to_string()));
        let metrics = scheduler.metrics();
        assert_eq!(metrics.total_promoted, 1);
        assert_eq!(metrics.pool.active, 2);
        assert_eq!(metrics.pool.total_releases, 1);
    }

    #[test]
    fn test_admit_filter_excludes_units() {
        let (mut run, mut scheduler) = wide(3, 3);
        let launched = scheduler.schedule_executions(&mut run, |e| e.kind != "u0");
        assert_eq!(kinds(&run, &launched), vec!["u1", "u2"]);
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[test]
    fn test_stale_queue_entries_discarded() {
        let (mut run, mut scheduler) = wide(3, 1);
        let launched = scheduler.schedule_executions(&mut run, |_| true);
        start(&mut run, &launched);
        let queued = run.execution_by_kind("u1").unwrap().id;
        run.execution_mut(queued).unwrap().cancel("stop");

        finish(&mut run, launched[0]);
        let promoted = scheduler.on_execution_completed(&mut run, launched[0], |_| true);
        assert_eq!(promoted.map(|id| run.execution(id).unwrap().kind.clone()), Some("u2".to_string()));
    }

    #[test]
    fn test_unsatisfiable_requirements() {
        let submission = PipelineSubmission::new("r", "b")
            .unit(WorkUnitSpec::new("huge").with_resources(ResourceRequirements::new(500.0, 10.0)))
            .unit(WorkUnitSpec::new("small").with_resources(ResourceRequirements::new(10.0, 10.0)));
        let config = OrchestrationConfig::default().with_resource_limits(Some(100.0), None);
        let mut run = PipelineRun::from_submission(&submission, &config);
        let mut scheduler = Scheduler::new(&config);

        let launched = scheduler.schedule_executions(&mut run, |_| true);
        assert_eq!(kinds(&run, &launched), vec!["small"]);
        let stuck = scheduler.unsatisfiable(&run);
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].0, run.execution_by_kind("huge").unwrap().id);
    }

    #[test]
    fn test_release_all() {
        let (mut run, mut scheduler) = wide(4, 2);
        let launched = scheduler.schedule_executions(&mut run, |_| true);
        let released = scheduler.release_all();
        assert_eq!(released.len(), launched.len());
        assert!(scheduler.pool().is_idle());
        assert_eq!(scheduler.queue_len(), 0);
        assert!(!scheduler.release(launched[0]));
    }

    #[test]
    fn test_optimize_schedule_serial_chain() {
        let submission = PipelineSubmission::sequence("chain", "b", ["a", "b", "c", "d"]);
        let config = OrchestrationConfig::default();
        let run = PipelineRun::from_submission(&submission, &config);
        let report = Scheduler::new(&config).optimize_schedule(&run);
        assert!((report.serial_ratio - 1.0).abs() < f64::EPSILON);
        assert!(report.bottlenecks.contains(&"a".to_string()));
        assert!(!report.recommendations.is_empty());
    }
}
