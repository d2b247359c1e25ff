//! Engine configuration.
//!
//! [`OrchestrationConfig`] holds engine-wide defaults. Every knob a caller
//! may change for a single run is mirrored in [`RunConfigOverrides`].
//! Configurations can be built in code or loaded from TOML:
//!
//! ```toml
//! max_parallel_agents = 4
//! execution_timeout_secs = 300.0
//! fail_fast = true
//!
//! [circuit_breaker]
//! failure_threshold = 3
//!
//! [recovery.fallback_kinds]
//! coder = "template_coder"
//! ```

use crate::core::RetryStrategy;
use crate::errors::ConfigError;
use crate::recovery::{FailureCategory, JitterStrategy, RecoveryStrategy};
use crate::scheduler::StrategyKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Converts seconds to a duration, treating negative or NaN values as zero.
pub(crate) fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// Per-kind circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before admitting trial calls.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: f64,
    /// Trial calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> f64 {
    60.0
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Returns the recovery timeout as a duration.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        secs(self.recovery_timeout_secs)
    }
}

/// Failure recovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Upper bound on the estimated recovery wait added before a retry.
    #[serde(default = "default_max_recovery_delay")]
    pub max_recovery_delay_secs: f64,
    /// Whether the per-category recovery estimate is waited before a retry.
    #[serde(default = "default_true")]
    pub apply_recovery_estimates: bool,
    /// Alternate handler kind to use when a kind falls back.
    #[serde(default)]
    pub fallback_kinds: HashMap<String, String>,
    /// Strategy to use for a category instead of the built-in choice.
    #[serde(default)]
    pub strategy_overrides: HashMap<FailureCategory, RecoveryStrategy>,
}

fn default_max_recovery_delay() -> f64 {
    300.0
}

fn default_true() -> bool {
    true
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_delay_secs: default_max_recovery_delay(),
            apply_recovery_estimates: true,
            fallback_kinds: HashMap::new(),
            strategy_overrides: HashMap::new(),
        }
    }
}

impl RecoveryConfig {
    /// Registers a fallback kind.
    #[must_use]
    pub fn with_fallback(mut self, kind: impl Into<String>, fallback: impl Into<String>) -> Self {
        self.fallback_kinds.insert(kind.into(), fallback.into());
        self
    }

    /// Forces a strategy for a failure category.
    #[must_use]
    pub fn with_strategy_override(
        mut self,
        category: FailureCategory,
        strategy: RecoveryStrategy,
    ) -> Self {
        self.strategy_overrides.insert(category, strategy);
        self
    }
}

/// Thresholds at which the monitor raises alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Failed executions as a percentage of started ones.
    #[serde(default = "default_failure_rate")]
    pub failure_rate_percent: f64,
    /// Retries as a percentage of started executions.
    #[serde(default = "default_retry_rate")]
    pub retry_rate_percent: f64,
    /// Multiple of the execution timeout after which a running execution is reported.
    #[serde(default = "default_runtime_factor")]
    pub execution_runtime_factor: f64,
}

fn default_failure_rate() -> f64 {
    20.0
}

fn default_retry_rate() -> f64 {
    50.0
}

fn default_runtime_factor() -> f64 {
    1.5
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            failure_rate_percent: default_failure_rate(),
            retry_rate_percent: default_retry_rate(),
            execution_runtime_factor: default_runtime_factor(),
        }
    }
}

/// Engine-wide orchestration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Maximum executions running at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_agents: usize,
    /// Per-execution timeout in seconds.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: f64,
    /// Whole-run timeout in seconds.
    #[serde(default = "default_pipeline_timeout")]
    pub pipeline_timeout_secs: f64,
    /// Attempts per execution unless a unit overrides it.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Retry strategy unless a unit overrides it.
    #[serde(default)]
    pub default_retry_strategy: RetryStrategy,
    /// Base delay for retry backoff in milliseconds.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Cap on retry backoff in milliseconds.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Jitter applied to retry backoff.
    #[serde(default)]
    pub retry_jitter: JitterStrategy,
    /// Whether timed-out executions may be retried.
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
    /// Stop launching new work after the first terminal failure.
    #[serde(default)]
    pub fail_fast: bool,
    /// Enforce cpu/memory ceilings in addition to the slot limit.
    #[serde(default = "default_true")]
    pub enable_resource_limits: bool,
    /// Memory ceiling in megabytes.
    #[serde(default)]
    pub max_memory_mb: Option<f64>,
    /// CPU ceiling in percent.
    #[serde(default)]
    pub max_cpu_percent: Option<f64>,
    /// Run the background monitor.
    #[serde(default = "default_true")]
    pub enable_monitoring: bool,
    /// Monitor polling interval in seconds.
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval_secs: f64,
    /// Track progress and ETA in monitor snapshots.
    #[serde(default = "default_true")]
    pub enable_progress_tracking: bool,
    /// Reorder executions using dependency analysis before the run starts.
    #[serde(default = "default_true")]
    pub enable_pipeline_optimization: bool,
    /// Scheduling strategy; derived from the other flags when unset.
    #[serde(default)]
    pub scheduling_strategy: Option<StrategyKind>,
    /// How long the driver waits for a completion before re-checking state.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Monitor snapshots retained per run.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Recovery settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Alert thresholds.
    #[serde(default)]
    pub alerts: AlertThresholds,
}

fn default_max_parallel() -> usize {
    3
}

fn default_execution_timeout() -> f64 {
    600.0
}

fn default_pipeline_timeout() -> f64 {
    3600.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    300_000
}

fn default_monitoring_interval() -> f64 {
    5.0
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_history_limit() -> usize {
    1000
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel(),
            execution_timeout_secs: default_execution_timeout(),
            pipeline_timeout_secs: default_pipeline_timeout(),
            default_max_attempts: default_max_attempts(),
            default_retry_strategy: RetryStrategy::default(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_jitter: JitterStrategy::default(),
            retry_on_timeout: true,
            fail_fast: false,
            enable_resource_limits: true,
            max_memory_mb: None,
            max_cpu_percent: None,
            enable_monitoring: true,
            monitoring_interval_secs: default_monitoring_interval(),
            enable_progress_tracking: true,
            enable_pipeline_optimization: true,
            scheduling_strategy: None,
            poll_interval_ms: default_poll_interval(),
            history_limit: default_history_limit(),
            circuit_breaker: CircuitBreakerConfig::default(),
            recovery: RecoveryConfig::default(),
            alerts: AlertThresholds::default(),
        }
    }
}

impl OrchestrationConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Sets the parallelism limit.
    #[must_use]
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel_agents = max;
        self
    }

    /// Sets the per-execution timeout.
    #[must_use]
    pub fn with_execution_timeout(mut self, secs: f64) -> Self {
        self.execution_timeout_secs = secs;
        self
    }

    /// Sets the whole-run timeout.
    #[must_use]
    pub fn with_pipeline_timeout(mut self, secs: f64) -> Self {
        self.pipeline_timeout_secs = secs;
        self
    }

    /// Sets the default attempt limit.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts;
        self
    }

    /// Sets the default retry strategy.
    #[must_use]
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.default_retry_strategy = strategy;
        self
    }

    /// Sets the retry base delay.
    #[must_use]
    pub fn with_retry_base_delay_ms(mut self, delay: u64) -> Self {
        self.retry_base_delay_ms = delay;
        self
    }

    /// Sets fail-fast mode.
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Enables resource limits with the given ceilings.
    #[must_use]
    pub fn with_resource_limits(
        mut self,
        max_cpu: Option<f64>,
        max_memory_mb: Option<f64>,
    ) -> Self {
        self.enable_resource_limits = true;
        self.max_cpu_percent = max_cpu;
        self.max_memory_mb = max_memory_mb;
        self
    }

    /// Sets the monitoring interval; zero or less disables monitoring.
    #[must_use]
    pub fn with_monitoring_interval(mut self, secs: f64) -> Self {
        self.enable_monitoring = secs > 0.0;
        if secs > 0.0 {
            self.monitoring_interval_secs = secs;
        }
        self
    }

    /// Sets the driver's poll interval.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets an explicit scheduling strategy.
    #[must_use]
    pub fn with_scheduling_strategy(mut self, strategy: StrategyKind) -> Self {
        self.scheduling_strategy = Some(strategy);
        self
    }

    /// Sets pipeline optimization.
    #[must_use]
    pub fn with_pipeline_optimization(mut self, enabled: bool) -> Self {
        self.enable_pipeline_optimization = enabled;
        self
    }

    /// Sets the circuit breaker configuration.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Sets the recovery configuration.
    #[must_use]
    pub fn with_recovery(mut self, config: RecoveryConfig) -> Self {
        self.recovery = config;
        self
    }

    /// Sets the alert thresholds.
    #[must_use]
    pub fn with_alerts(mut self, alerts: AlertThresholds) -> Self {
        self.alerts = alerts;
        self
    }

    /// Execution timeout as a duration.
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        secs(self.execution_timeout_secs)
    }

    /// Run timeout as a duration.
    #[must_use]
    pub fn pipeline_timeout(&self) -> Duration {
        secs(self.pipeline_timeout_secs)
    }

    /// Monitor interval as a duration.
    #[must_use]
    pub fn monitoring_interval(&self) -> Duration {
        secs(self.monitoring_interval_secs)
    }

    /// Driver poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// The scheduling strategy in effect.
    ///
    /// Unless set explicitly: critical path when optimization is enabled,
    /// else resource-aware when limits are enabled, else priority-first.
    #[must_use]
    pub fn effective_strategy(&self) -> StrategyKind {
        self.scheduling_strategy.unwrap_or({
            if self.enable_pipeline_optimization {
                StrategyKind::CriticalPath
            } else if self.enable_resource_limits {
                StrategyKind::ResourceAware
            } else {
                StrategyKind::Priority
            }
        })
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_agents == 0 {
            return Err(ConfigError::invalid("max_parallel_agents", "must be at least 1"));
        }
        for (field, value) in [
            ("execution_timeout_secs", self.execution_timeout_secs),
            ("pipeline_timeout_secs", self.pipeline_timeout_secs),
            ("monitoring_interval_secs", self.monitoring_interval_secs),
        ] {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::invalid(field, format!("must be positive, got {value}")));
            }
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::invalid("default_max_attempts", "must be at least 1"));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::invalid("history_limit", "must be at least 1"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.half_open_max_calls",
                "must be at least 1",
            ));
        }
        for (field, ceiling) in [
            ("max_cpu_percent", self.max_cpu_percent),
            ("max_memory_mb", self.max_memory_mb),
        ] {
            if let Some(value) = ceiling {
                if value.is_nan() || value <= 0.0 {
                    return Err(ConfigError::invalid(
                        field,
                        format!("must be positive, got {value}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Per-run overrides of the engine configuration.
///
/// Unset fields keep the engine value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfigOverrides {
    /// Overrides `max_parallel_agents`.
    #[serde(default)]
    pub max_parallel_agents: Option<usize>,
    /// Overrides `execution_timeout_secs`.
    #[serde(default)]
    pub execution_timeout_secs: Option<f64>,
    /// Overrides `pipeline_timeout_secs`.
    #[serde(default)]
    pub pipeline_timeout_secs: Option<f64>,
    /// Overrides `default_max_attempts`.
    #[serde(default)]
    pub default_max_attempts: Option<u32>,
    /// Overrides `default_retry_strategy`.
    #[serde(default)]
    pub default_retry_strategy: Option<RetryStrategy>,
    /// Overrides `fail_fast`.
    #[serde(default)]
    pub fail_fast: Option<bool>,
    /// Overrides `enable_resource_limits`.
    #[serde(default)]
    pub enable_resource_limits: Option<bool>,
    /// Overrides `max_memory_mb`.
    #[serde(default)]
    pub max_memory_mb: Option<f64>,
    /// Overrides `max_cpu_percent`.
    #[serde(default)]
    pub max_cpu_percent: Option<f64>,
    /// Overrides `enable_monitoring`.
    #[serde(default)]
    pub enable_monitoring: Option<bool>,
    /// Overrides `monitoring_interval_secs`.
    #[serde(default)]
    pub monitoring_interval_secs: Option<f64>,
    /// Overrides `enable_pipeline_optimization`.
    #[serde(default)]
    pub enable_pipeline_optimization: Option<bool>,
}

impl RunConfigOverrides {
    /// Creates empty overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the parallelism limit.
    #[must_use]
    pub fn max_parallel(mut self, max: usize) -> Self {
        self.max_parallel_agents = Some(max);
        self
    }

    /// Overrides the execution timeout.
    #[must_use]
    pub fn execution_timeout(mut self, secs: f64) -> Self {
        self.execution_timeout_secs = Some(secs);
        self
    }

    /// Overrides the run timeout.
    #[must_use]
    pub fn pipeline_timeout(mut self, secs: f64) -> Self {
        self.pipeline_timeout_secs = Some(secs);
        self
    }

    /// Overrides the attempt limit.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = Some(attempts);
        self
    }

    /// Overrides fail-fast mode.
    #[must_use]
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    /// Returns `base` with these overrides applied, validated.
    pub fn apply(&self, base: &OrchestrationConfig) -> Result<OrchestrationConfig, ConfigError> {
        let mut config = base.clone();
        if let Some(v) = self.max_parallel_agents {
            config.max_parallel_agents = v;
        }
        if let Some(v) = self.execution_timeout_secs {
            config.execution_timeout_secs = v;
        }
        if let Some(v) = self.pipeline_timeout_secs {
            config.pipeline_timeout_secs = v;
        }
        if let Some(v) = self.default_max_attempts {
            config.default_max_attempts = v;
        }
        if let Some(v) = self.default_retry_strategy {
            config.default_retry_strategy = v;
        }
        if let Some(v) = self.fail_fast {
            config.fail_fast = v;
        }
        if let Some(v) = self.enable_resource_limits {
            config.enable_resource_limits = v;
        }
        if self.max_memory_mb.is_some() {
            config.max_memory_mb = self.max_memory_mb;
        }
        if self.max_cpu_percent.is_some() {
            config.max_cpu_percent = self.max_cpu_percent;
        }
        if let Some(v) = self.enable_monitoring {
            config.enable_monitoring = v;
        }
        if let Some(v) = self.monitoring_interval_secs {
            config.monitoring_interval_secs = v;
        }
        if let Some(v) = self.enable_pipeline_optimization {
            config.enable_pipeline_optimization = v;
        }
        config.validate()?;
        Ok(config)
    }
}
