//! Slot, CPU and memory accounting for one run.

use crate::config::OrchestrationConfig;
use crate::core::WorkUnitExecution;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Ceilings enforced by a [`ResourcePool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum concurrent allocations.
    pub max_slots: usize,
    /// Whether cpu/memory ceilings are enforced.
    pub enforce: bool,
    /// CPU ceiling.
    pub max_cpu: Option<f64>,
    /// Memory ceiling in megabytes.
    pub max_memory_mb: Option<f64>,
}

impl ResourceLimits {
    /// Limits taken from a configuration.
    #[must_use]
    pub fn from_config(config: &OrchestrationConfig) -> Self {
        Self {
            max_slots: config.max_parallel_agents.max(1),
            enforce: config.enable_resource_limits,
            max_cpu: config.max_cpu_percent,
            max_memory_mb: config.max_memory_mb,
        }
    }
}

/// Why an allocation was refused.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AllocationError {
    /// The execution already holds an allocation.
    #[error("execution {0} already holds an allocation")]
    AlreadyAllocated(Uuid),
    /// Every slot is taken.
    #[error("all {0} slots are in use")]
    SlotsExhausted(usize),
    /// CPU would exceed the ceiling.
    #[error("cpu {requested} requested, {available} of {ceiling} available")]
    Cpu {
        /// Requested amount.
        requested: f64,
        /// Currently free.
        available: f64,
        /// Ceiling.
        ceiling: f64,
    },
    /// Memory would exceed the ceiling.
    #[error("memory {requested}MB requested, {available}MB of {ceiling}MB available")]
    Memory {
        /// Requested amount.
        requested: f64,
        /// Currently free.
        available: f64,
        /// Ceiling.
        ceiling: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Claim {
    cpu: f64,
    memory_mb: f64,
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUsage {
    /// Executions holding an allocation.
    pub active: usize,
    /// CPU in use.
    pub cpu_in_use: f64,
    /// Memory in use.
    pub memory_in_use_mb: f64,
    /// CPU in use as a percentage of the ceiling, when one is set.
    pub cpu_utilization: Option<f64>,
    /// Memory in use as a percentage of the ceiling, when one is set.
    pub memory_utilization: Option<f64>,
    /// Allocations granted so far.
    pub total_allocations: u64,
    /// Releases performed so far.
    pub total_releases: u64,
}

/// Tracks what running executions have claimed.
///
/// Each execution holds at most one allocation, and a release only succeeds
/// for an execution that holds one, so every allocate pairs with exactly one
/// release.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    limits: ResourceLimits,
    allocations: HashMap<Uuid, Claim>,
    cpu_in_use: f64,
    memory_in_use_mb: f64,
    total_allocations: u64,
    total_releases: u64,
}

impl ResourcePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            allocations: HashMap::new(),
            cpu_in_use: 0.0,
            memory_in_use_mb: 0.0,
            total_allocations: 0,
            total_releases: 0,
        }
    }

    /// The pool's limits.
    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Changes the slot count. Allocations above a lowered count stay until
    /// released.
    pub fn set_max_slots(&mut self, slots: usize) {
        self.limits.max_slots = slots.max(1);
    }

    /// Checks whether `execution` could be allocated now.
    pub fn check(&self, execution: &WorkUnitExecution) -> Result<(), AllocationError> {
        if self.allocations.contains_key(&execution.id) {
            return Err(AllocationError::AlreadyAllocated(execution.id));
        }
        if self.allocations.len() >= self.limits.max_slots {
            return Err(AllocationError::SlotsExhausted(self.limits.max_slots));
        }
        self.check_ceilings(execution, self.cpu_in_use, self.memory_in_use_mb)
    }

    fn check_ceilings(
        &self,
        execution: &WorkUnitExecution,
        cpu_in_use: f64,
        memory_in_use_mb: f64,
    ) -> Result<(), AllocationError> {
        if !self.limits.enforce {
            return Ok(());
        }
        let req = &execution.resource_requirements;
        if let Some(ceiling) = self.limits.max_cpu {
            if cpu_in_use + req.cpu > ceiling {
                return Err(AllocationError::Cpu {
                    requested: req.cpu,
                    available: (ceiling - cpu_in_use).max(0.0),
                    ceiling,
                });
            }
        }
        if let Some(ceiling) = self.limits.max_memory_mb {
            if memory_in_use_mb + req.memory_mb > ceiling {
                return Err(AllocationError::Memory {
                    requested: req.memory_mb,
                    available: (ceiling - memory_in_use_mb).max(0.0),
                    ceiling,
                });
            }
        }
        Ok(())
    }

    /// True if `execution` could be allocated now.
    #[must_use]
    pub fn can_allocate(&self, execution: &WorkUnitExecution) -> bool {
        self.check(execution).is_ok()
    }

    /// Checks whether `execution` would fit into an otherwise idle pool.
    pub fn check_fits_idle(&self, execution: &WorkUnitExecution) -> Result<(), AllocationError> {
        self.check_ceilings(execution, 0.0, 0.0)
    }

    /// Claims resources for `execution`.
    pub fn allocate(&mut self, execution: &WorkUnitExecution) -> Result<(), AllocationError> {
        self.check(execution)?;
        let req = &execution.resource_requirements;
        self.allocations.insert(
            execution.id,
            Claim {
                cpu: req.cpu,
                memory_mb: req.memory_mb,
            },
        );
        self.cpu_in_use += req.cpu;
        self.memory_in_use_mb += req.memory_mb;
        self.total_allocations += 1;
        Ok(())
    }

    /// Returns the claim held by `execution_id`.
    ///
    /// Returns false if it held none.
    pub fn release(&mut self, execution_id: Uuid) -> bool {
        let Some(claim) = self.allocations.remove(&execution_id) else {
            return false;
        };
        self.cpu_in_use = (self.cpu_in_use - claim.cpu).max(0.0);
        self.memory_in_use_mb = (self.memory_in_use_mb - claim.memory_mb).max(0.0);
        self.total_releases += 1;
        true
    }

    /// True if the execution holds an allocation.
    #[must_use]
    pub fn is_active(&self, execution_id: Uuid) -> bool {
        self.allocations.contains_key(&execution_id)
    }

    /// Ids holding an allocation.
    #[must_use]
    pub fn active_ids(&self) -> Vec<Uuid> {
        self.allocations.keys().copied().collect()
    }

    /// Number of allocations held.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.allocations.len()
    }

    /// True when nothing is allocated.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Current usage.
    #[must_use]
    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            active: self.allocations.len(),
            cpu_in_use: self.cpu_in_use,
            memory_in_use_mb: self.memory_in_use_mb,
            cpu_utilization: self.limits.max_cpu.map(|c| self.cpu_in_use / c * 100.0),
            memory_utilization: self
                .limits
                .max_memory_mb
                .map(|m| self.memory_in_use_mb / m * 100.0),
            total_allocations: self.total_allocations,
            total_releases: self.total_releases,
        }
    }
}
