//! Failure taxonomy
//!
//! Seven categories describe why a step failed. Classifications are produced
//! fresh per failure and only ever persisted inside a snapshot.

use serde::{Deserialize, Serialize};

/// Why a step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Step received an object where it expected an array (or similar)
    DataShapeMismatch,
    /// Upstream produced nothing usable
    DataUnavailable,
    /// Plugin/runtime error (transient, auth, configuration, unknown)
    ExecutionError,
    /// Plugin cannot perform the requested action
    CapabilityMismatch,
    /// Step ran before its dependencies
    InvalidStepOrder,
    /// Referenced step does not exist
    MissingStep,
    /// Condition evaluation failed
    LogicError,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 7] = [
        Self::DataShapeMismatch,
        Self::DataUnavailable,
        Self::ExecutionError,
        Self::CapabilityMismatch,
        Self::InvalidStepOrder,
        Self::MissingStep,
        Self::LogicError,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataShapeMismatch => "data_shape_mismatch",
            Self::DataUnavailable => "data_unavailable",
            Self::ExecutionError => "execution_error",
            Self::CapabilityMismatch => "capability_mismatch",
            Self::InvalidStepOrder => "invalid_step_order",
            Self::MissingStep => "missing_step",
            Self::LogicError => "logic_error",
        }
    }

    /// Categories that neither retry nor repair can fix
    #[inline]
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::MissingStep | Self::CapabilityMismatch | Self::InvalidStepOrder
        )
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narrower reason within a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSubType {
    // data_shape_mismatch
    TransformInput,
    ScatterInput,
    IterateInput,
    Generic,
    // data_unavailable
    EmptyResults,
    MissingField,
    // execution_error
    RateLimit,
    Timeout,
    Network,
    ServiceUnavailable,
    Auth,
    InsufficientScope,
    Configuration,
    Unknown,
}

impl FailureSubType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransformInput => "transform_input",
            Self::ScatterInput => "scatter_input",
            Self::IterateInput => "iterate_input",
            Self::Generic => "generic",
            Self::EmptyResults => "empty_results",
            Self::MissingField => "missing_field",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Auth => "auth",
            Self::InsufficientScope => "insufficient_scope",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureSubType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Triage severity; recorded only, no behaviour hangs off it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureClassification {
    pub category: FailureCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<FailureSubType>,
    pub severity: Severity,
    pub is_auto_retryable: bool,
}

impl FailureClassification {
    /// Non-retryable classification
    #[inline]
    #[must_use]
    pub fn new(category: FailureCategory, severity: Severity) -> Self {
        Self {
            category,
            sub_type: None,
            severity,
            is_auto_retryable: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_sub_type(mut self, sub_type: FailureSubType) -> Self {
        self.sub_type = Some(sub_type);
        self
    }

    #[inline]
    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.is_auto_retryable = true;
        self
    }

    /// Fallback used when nothing matches or the engine itself failed
    #[inline]
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(FailureCategory::ExecutionError, Severity::Medium)
            .with_sub_type(FailureSubType::Unknown)
    }
}

impl std::fmt::Display for FailureClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.sub_type {
            Some(sub) => write!(f, "{}/{}/{}", self.category, sub, self.severity.as_str()),
            None => write!(f, "{}/{}", self.category, self.severity.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_serialize_snake_case() {
        let json = serde_json::to_string(&FailureCategory::DataShapeMismatch).unwrap();
        assert_eq!(json, "\"data_shape_mismatch\"");
        for category in FailureCategory::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
    }

    #[test]
    fn structural_categories() {
        assert!(FailureCategory::MissingStep.is_structural());
        assert!(!FailureCategory::DataShapeMismatch.is_structural());
    }

    #[test]
    fn display_includes_sub_type() {
        let c = FailureClassification::new(FailureCategory::DataShapeMismatch, Severity::High)
            .with_sub_type(FailureSubType::TransformInput);
        assert_eq!(c.to_string(), "data_shape_mismatch/transform_input/high");
    }
}
