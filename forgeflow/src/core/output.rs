//! Work-unit output payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The output produced by a work-unit handler.
///
/// The engine never interprets `result`; it is handed to dependents and
/// surfaced in the final run result. `context_updates` are merged into the
/// context of every dependent, and `artifacts` into the run's artifact map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkOutput {
    /// Arbitrary structured result.
    pub result: Value,

    /// Confidence score in `0.0..=1.0`.
    pub confidence: f64,

    /// Named artifacts produced by the unit.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub artifacts: HashMap<String, Value>,

    /// Context entries exposed to dependents.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context_updates: HashMap<String, Value>,

    /// Additional metadata, including recovery provenance.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Default for WorkOutput {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

impl WorkOutput {
    /// Creates an output with full confidence.
    #[must_use]
    pub fn new(result: Value) -> Self {
        Self {
            result,
            confidence: 1.0,
            artifacts: HashMap::new(),
            context_updates: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Creates the zero-confidence placeholder recorded when a failure is skipped.
    #[must_use]
    pub fn skipped(kind: &str, original_error: &str) -> Self {
        Self::new(Value::Null)
            .with_confidence(0.0)
            .with_metadata("skipped", Value::Bool(true))
            .with_metadata("skipped_kind", Value::String(kind.to_string()))
            .with_metadata("original_error", Value::String(original_error.to_string()))
    }

    /// Sets the confidence, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Adds an artifact.
    #[must_use]
    pub fn with_artifact(mut self, name: impl Into<String>, value: Value) -> Self {
        self.artifacts.insert(name.into(), value);
        self
    }

    /// Adds a context update for dependents.
    #[must_use]
    pub fn with_context_update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns true if this output is a skip placeholder.
    #[must_use]
    pub fn is_skip_placeholder(&self) -> bool {
        self.metadata.get("skipped") == Some(&Value::Bool(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_confidence_clamped() {
        assert!((WorkOutput::default().with_confidence(1.7).confidence - 1.0).abs() < f64::EPSILON);
        assert!(WorkOutput::default().with_confidence(-0.2).confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn test_skipped_placeholder() {
        let output = WorkOutput::skipped("tester", "invalid fixture");
        assert!(output.is_skip_placeholder());
        assert!(output.confidence.abs() < f64::EPSILON);
        assert_eq!(output.metadata["original_error"], json!("invalid fixture"));
    }

    #[test]
    fn test_serialization_omits_empty_maps() {
        let value = serde_json::to_value(WorkOutput::new(json!({"plan": 1}))).unwrap();
        assert_eq!(value, json!({"result": {"plan": 1}, "confidence": 1.0}));
    }
}
