//! Failure classification and strategy recommendation.
//!
//! Classification is keyword based and deterministic: the same error text,
//! attempt number and configuration always produce the same analysis.

use crate::config::RecoveryConfig;
use crate::core::Severity;
use crate::errors::ExecutionFault;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad cause of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The attempt ran out of time.
    Timeout,
    /// CPU, memory, disk or quota exhaustion.
    Resource,
    /// Connectivity problems.
    Network,
    /// Bad or malformed input.
    Validation,
    /// Something the unit needs is missing.
    Dependency,
    /// Permission or authentication problems.
    Security,
    /// Misconfiguration.
    Configuration,
    /// Nothing matched.
    Unknown,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Resource => write!(f, "resource"),
            Self::Network => write!(f, "network"),
            Self::Validation => write!(f, "validation"),
            Self::Dependency => write!(f, "dependency"),
            Self::Security => write!(f, "security"),
            Self::Configuration => write!(f, "configuration"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// What recovery does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Run the unit again after a delay.
    Retry,
    /// Substitute a zero-confidence placeholder success.
    Skip,
    /// Run the designated fallback handler instead.
    Fallback,
    /// Reset consumers of the unit's output, then retry.
    Rollback,
    /// Retry only while the kind's breaker admits attempts.
    CircuitBreaker,
    /// Fail terminally and ask for a human.
    ManualIntervention,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
            Self::Fallback => write!(f, "fallback"),
            Self::Rollback => write!(f, "rollback"),
            Self::CircuitBreaker => write!(f, "circuit_breaker"),
            Self::ManualIntervention => write!(f, "manual_intervention"),
        }
    }
}

/// Result of analyzing one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    /// Classified cause.
    pub category: FailureCategory,
    /// Assessed severity.
    pub severity: Severity,
    /// Recommended strategy.
    pub strategy: RecoveryStrategy,
    /// True for failures that may resolve on their own.
    pub is_transient: bool,
    /// Suggested operator actions.
    pub recovery_actions: Vec<String>,
    /// Expected seconds until recovery; `None` when recovery needs a human.
    pub estimated_recovery_secs: Option<f64>,
    /// The analyzed error text.
    pub error: String,
    /// The attempt that failed.
    pub attempt: u32,
}

const CATEGORY_KEYWORDS: &[(FailureCategory, &[&str])] = &[
    (
        FailureCategory::Timeout,
        &["timeout", "timed out", "execution exceeded", "deadline exceeded"],
    ),
    (
        FailureCategory::Resource,
        &["memory", "disk space", "cpu", "resource", "quota exceeded"],
    ),
    (
        FailureCategory::Network,
        &["connection", "network", "http", "socket", "dns", "ssl"],
    ),
    (
        FailureCategory::Validation,
        &["validation", "invalid", "malformed", "parse error", "syntax error"],
    ),
    (
        FailureCategory::Dependency,
        &["not found", "missing", "import error", "module", "dependency"],
    ),
    (
        FailureCategory::Security,
        &["permission", "unauthorized", "forbidden", "access denied", "authentication"],
    ),
    (
        FailureCategory::Configuration,
        &["config", "setting", "environment", "variable", "missing key"],
    ),
];

const CRITICAL_KEYWORDS: &[&str] = &["fatal", "critical", "security", "corruption", "unauthorized"];
const HIGH_KEYWORDS: &[&str] = &["system", "database", "network", "timeout"];
const MEDIUM_KEYWORDS: &[&str] = &["validation", "format", "parse", "config"];

/// Upper bound on any recovery estimate.
pub const MAX_RECOVERY_ESTIMATE_SECS: f64 = 300.0;

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// Classifies error text by keyword, first matching category wins.
#[must_use]
pub fn classify(error: &str) -> FailureCategory {
    let text = error.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| contains_any(&text, keywords))
        .map_or(FailureCategory::Unknown, |(category, _)| *category)
}

/// Classifies a fault; structural faults take precedence over keywords.
#[must_use]
pub fn classify_fault(fault: &ExecutionFault) -> FailureCategory {
    match fault {
        ExecutionFault::Timeout { .. } => FailureCategory::Timeout,
        ExecutionFault::MissingHandler(_) => FailureCategory::Configuration,
        ExecutionFault::ResourceExhaustion(_) => FailureCategory::Resource,
        ExecutionFault::Handler(_) | ExecutionFault::Panicked(_) => classify(&fault.to_string()),
    }
}

/// Severity from keyword signals and the attempt count.
#[must_use]
pub fn assess_severity(error: &str, attempt: u32) -> Severity {
    let text = error.to_lowercase();
    if contains_any(&text, CRITICAL_KEYWORDS) {
        Severity::Critical
    } else if attempt > 2 || contains_any(&text, HIGH_KEYWORDS) {
        Severity::High
    } else if attempt > 1 || contains_any(&text, MEDIUM_KEYWORDS) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Strategy for a category before overrides and severity escalation.
#[must_use]
pub fn default_strategy(category: FailureCategory, attempt: u32) -> RecoveryStrategy {
    match category {
        FailureCategory::Timeout | FailureCategory::Network => {
            if attempt < 3 {
                RecoveryStrategy::Retry
            } else {
                RecoveryStrategy::CircuitBreaker
            }
        }
        FailureCategory::Resource => {
            if attempt < 2 {
                RecoveryStrategy::Retry
            } else {
                RecoveryStrategy::Skip
            }
        }
        FailureCategory::Dependency => RecoveryStrategy::Fallback,
        FailureCategory::Validation => RecoveryStrategy::Skip,
        FailureCategory::Security | FailureCategory::Configuration => {
            RecoveryStrategy::ManualIntervention
        }
        FailureCategory::Unknown => {
            if attempt < 3 {
                RecoveryStrategy::Retry
            } else {
                RecoveryStrategy::Skip
            }
        }
    }
}

/// True for categories that may resolve without intervention.
#[must_use]
pub fn is_transient(category: FailureCategory) -> bool {
    matches!(
        category,
        FailureCategory::Timeout | FailureCategory::Network | FailureCategory::Resource
    )
}

/// Operator-facing actions per category.
#[must_use]
pub fn recovery_actions(category: FailureCategory) -> Vec<String> {
    let actions: &[&str] = match category {
        FailureCategory::Timeout => &[
            "Increase the execution timeout",
            "Split the work into smaller units",
            "Check for blocking external calls",
        ],
        FailureCategory::Resource => &[
            "Lower max parallel executions",
            "Raise resource ceilings",
            "Reduce the unit's resource requirements",
        ],
        FailureCategory::Network => &[
            "Check connectivity to external services",
            "Verify endpoints and certificates",
            "Retry after the service recovers",
        ],
        FailureCategory::Validation => &[
            "Inspect the unit's input data",
            "Check the outputs of its dependencies",
        ],
        FailureCategory::Dependency => &[
            "Verify required modules and services are available",
            "Configure a fallback kind",
        ],
        FailureCategory::Security => &[
            "Verify credentials and permissions",
            "Review access policies",
        ],
        FailureCategory::Configuration => &[
            "Check the unit configuration and environment variables",
            "Verify a handler is registered for the kind",
        ],
        FailureCategory::Unknown => &["Inspect the error and logs", "Retry manually if transient"],
    };
    actions.iter().map(|a| (*a).to_string()).collect()
}

/// Expected recovery time per category, capped at
/// [`MAX_RECOVERY_ESTIMATE_SECS`]; `None` when a human is needed.
#[must_use]
pub fn estimated_recovery_secs(category: FailureCategory) -> Option<f64> {
    let secs = match category {
        FailureCategory::Timeout => 60.0,
        FailureCategory::Resource | FailureCategory::Unknown => 30.0,
        FailureCategory::Network => 10.0,
        FailureCategory::Dependency => 5.0,
        FailureCategory::Validation => 0.0,
        FailureCategory::Security | FailureCategory::Configuration => return None,
    };
    Some(f64::min(secs, MAX_RECOVERY_ESTIMATE_SECS))
}

/// Classifies faults and recommends strategies.
#[derive(Debug, Clone, Default)]
pub struct FailureAnalyzer {
    config: RecoveryConfig,
}

impl FailureAnalyzer {
    /// Creates an analyzer honoring `config`'s overrides.
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// Analyzes a failed attempt.
    ///
    /// Critical severity always escalates to manual intervention; otherwise
    /// a configured per-category override wins over the default strategy.
    #[must_use]
    pub fn analyze(&self, fault: &ExecutionFault, attempt: u32) -> FailureAnalysis {
        let error = fault.to_string();
        let category = classify_fault(fault);
        let severity = assess_severity(&error, attempt);
        let strategy = if severity == Severity::Critical {
            RecoveryStrategy::ManualIntervention
        } else if let Some(strategy) = self.config.strategy_overrides.get(&category) {
            *strategy
        } else {
            default_strategy(category, attempt)
        };
        let estimated_recovery_secs = estimated_recovery_secs(category)
            .map(|secs| secs.min(self.config.max_recovery_delay_secs.max(0.0)));

        FailureAnalysis {
            category,
            severity,
            strategy,
            is_transient: is_transient(category),
            recovery_actions: recovery_actions(category),
            estimated_recovery_secs,
            error,
            attempt,
        }
    }
}
