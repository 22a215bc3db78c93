//! Repair proposals for shape mismatches

use serde::{Deserialize, Serialize};

/// Structural fix applied to an upstream payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Object has exactly one payload array; lift it out
    ExtractSingleArray,
    /// Object has several payload arrays; lift out the best match
    ExtractNamedArray,
    /// Single record object; wrap it as a one-element array
    WrapInArray,
    /// Nothing to do or nothing safe to do
    None,
}

impl RepairAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractSingleArray => "extract_single_array",
            Self::ExtractNamedArray => "extract_named_array",
            Self::WrapInArray => "wrap_in_array",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairRisk {
    Low,
    Medium,
    High,
}

/// Proposed repair of one upstream step's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairProposal {
    pub action: RepairAction,
    pub description: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    /// Step whose output would be rewritten
    pub target_step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_field: Option<String>,
    pub risk: RepairRisk,
}

impl RepairProposal {
    /// Proposal that does nothing
    #[must_use]
    pub fn none(target_step_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action: RepairAction::None,
            description: description.into(),
            confidence: 0.0,
            target_step_id: target_step_id.into(),
            extract_field: None,
            risk: RepairRisk::High,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        self.action != RepairAction::None
    }
}

/// Shape of an upstream payload as seen by the repair heuristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamShape {
    AlreadyArray,
    SingleArrayField,
    MultipleArrayFields,
    SingleRecord,
    TooDeep,
    /// Scalar, null or an object with nothing but metadata
    Unrepairable,
}

/// Result of inspecting an upstream payload. Field names only, no values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamAnalysis {
    pub shape: UpstreamShape,
    /// Non-metadata array-valued fields, in key order
    pub array_fields: Vec<String>,
    /// Field chosen for extraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_field: Option<String>,
    pub depth: usize,
}

/// Outcome of a repair attempt, as consumed by reporting collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairResult {
    pub proposal: RepairProposal,
    /// Repaired output was written back into the context
    pub applied: bool,
    pub data_modified: bool,
    /// Element count of the repaired array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repaired_item_count: Option<usize>,
}
