//! Data repair heuristics
//!
//! Stateless shape analysis of an upstream step's payload. When a downstream
//! step expected an array and got an object, these heuristics find the array
//! the upstream meant to deliver and produce a repaired copy of its output.
//! The original output is never modified.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use shadow_types::{
    FailureCategory, FailureClassification, RepairAction, RepairProposal, RepairRisk,
    StepDefinition, StepOutput, UpstreamAnalysis, UpstreamShape,
};

/// Field names that describe a response rather than carry its payload.
/// Compared case-insensitively with `_`/`-` removed.
const METADATA_FIELDS: &[&str] = &[
    "pagination",
    "page",
    "pages",
    "pagesize",
    "perpage",
    "pageinfo",
    "pagetoken",
    "nextpage",
    "nextpagetoken",
    "next",
    "previous",
    "prev",
    "cursor",
    "nextcursor",
    "hasmore",
    "offset",
    "limit",
    "total",
    "totalcount",
    "totalsize",
    "totalresults",
    "count",
    "resultcount",
    "resultsizeestimate",
    "status",
    "statuscode",
    "links",
    "meta",
    "metadata",
    "headers",
    "errors",
    "warnings",
    "success",
    "message",
    "kind",
    "etag",
    "requestid",
];

/// Preferred payload field names, in priority order
const PRIORITY_FIELDS: &[&str] = &[
    "items",
    "results",
    "records",
    "entries",
    "list",
    "rows",
    "values",
    "objects",
    "entities",
    "resources",
    "elements",
    "content",
    "response",
];

/// Deepest object still wrapped as a single record
const MAX_RECORD_DEPTH: usize = 3;

const SINGLE_ARRAY_CONFIDENCE: f64 = 0.95;
const NAMED_ARRAY_CONFIDENCE: f64 = 0.8;
const WRAP_CONFIDENCE: f64 = 0.85;

static STEP_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*(step[\w-]*)").expect("valid regex"));

/// View of a JSON payload as the three shapes the heuristics distinguish
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Array(&'a [Value]),
    Object(&'a Map<String, Value>),
    Scalar(&'a Value),
}

impl<'a> Payload<'a> {
    #[must_use]
    pub fn of(value: &'a Value) -> Self {
        match value {
            Value::Array(items) => Self::Array(items),
            Value::Object(map) => Self::Object(map),
            other => Self::Scalar(other),
        }
    }
}

/// Field describes the response rather than carrying its payload
#[must_use]
pub fn is_metadata_field(name: &str) -> bool {
    let normalized: String = name
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    METADATA_FIELDS.contains(&normalized.as_str())
}

/// Nesting depth: scalars are 0, each object/array level adds 1
#[must_use]
pub fn nesting_depth(value: &Value) -> usize {
    match Payload::of(value) {
        Payload::Scalar(_) => 0,
        Payload::Array(items) => 1 + items.iter().map(nesting_depth).max().unwrap_or(0),
        Payload::Object(map) => 1 + map.values().map(nesting_depth).max().unwrap_or(0),
    }
}

/// Classify the shape of an upstream payload
#[must_use]
pub fn analyze_upstream_data(data: &Value) -> UpstreamAnalysis {
    let depth = nesting_depth(data);
    let map = match Payload::of(data) {
        Payload::Array(_) => {
            return UpstreamAnalysis {
                shape: UpstreamShape::AlreadyArray,
                array_fields: Vec::new(),
                selected_field: None,
                depth,
            }
        }
        Payload::Scalar(_) => {
            return UpstreamAnalysis {
                shape: UpstreamShape::Unrepairable,
                array_fields: Vec::new(),
                selected_field: None,
                depth,
            }
        }
        Payload::Object(map) => map,
    };

    let array_fields: Vec<String> = map
        .iter()
        .filter(|(key, value)| value.is_array() && !is_metadata_field(key))
        .map(|(key, _)| key.clone())
        .collect();

    let (shape, selected_field) = match array_fields.len() {
        1 => (UpstreamShape::SingleArrayField, array_fields.first().cloned()),
        n if n > 1 => (
            UpstreamShape::MultipleArrayFields,
            select_array_field(map, &array_fields),
        ),
        _ if depth > MAX_RECORD_DEPTH => (UpstreamShape::TooDeep, None),
        _ if map.keys().any(|key| !is_metadata_field(key)) => (UpstreamShape::SingleRecord, None),
        _ => (UpstreamShape::Unrepairable, None),
    };

    UpstreamAnalysis {
        shape,
        array_fields,
        selected_field,
        depth,
    }
}

/// Pick the payload array among several candidates
///
/// Priority names first, then the longest plural-looking name, then the
/// largest non-empty array, then the first candidate.
fn select_array_field(map: &Map<String, Value>, candidates: &[String]) -> Option<String> {
    for preferred in PRIORITY_FIELDS {
        if let Some(found) = candidates
            .iter()
            .find(|c| c.eq_ignore_ascii_case(preferred))
        {
            return Some(found.clone());
        }
    }

    let longest_plural = candidates
        .iter()
        .filter(|c| looks_plural(c))
        .fold(None::<&String>, |best, c| match best {
            Some(b) if b.len() >= c.len() => Some(b),
            _ => Some(c),
        });
    if let Some(found) = longest_plural {
        return Some(found.clone());
    }

    let array_len = |key: &String| map.get(key).and_then(Value::as_array).map_or(0, Vec::len);
    let largest = candidates
        .iter()
        .filter(|c| array_len(*c) > 0)
        .fold(None::<&String>, |best, c| match best {
            Some(b) if array_len(b) >= array_len(c) => Some(b),
            _ => Some(c),
        });

    largest.or_else(|| candidates.first()).cloned()
}

fn looks_plural(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.len() > 1 && lower.ends_with('s') && !lower.ends_with("ss")
}

/// Propose a repair for a shape mismatch
///
/// Anything other than `data_shape_mismatch` yields `RepairAction::None`.
#[must_use]
pub fn propose_repair(
    classification: &FailureClassification,
    failed_step_id: &str,
    upstream_step_id: &str,
    upstream_output: &StepOutput,
) -> RepairProposal {
    if classification.category != FailureCategory::DataShapeMismatch {
        return RepairProposal::none(
            upstream_step_id,
            format!("{} is not a shape mismatch", classification.category),
        );
    }

    let analysis = analyze_upstream_data(&upstream_output.data);
    let proposal = match (analysis.shape, analysis.selected_field) {
        (UpstreamShape::SingleArrayField, Some(field)) => RepairProposal {
            action: RepairAction::ExtractSingleArray,
            description: format!(
                "Extract array field '{field}' from {upstream_step_id} output for {failed_step_id}"
            ),
            confidence: SINGLE_ARRAY_CONFIDENCE,
            target_step_id: upstream_step_id.to_string(),
            extract_field: Some(field),
            risk: RepairRisk::Low,
        },
        (UpstreamShape::MultipleArrayFields, Some(field)) => RepairProposal {
            action: RepairAction::ExtractNamedArray,
            description: format!(
                "Extract best-matching array field '{field}' of {} candidates from {upstream_step_id} output for {failed_step_id}",
                analysis.array_fields.len()
            ),
            confidence: NAMED_ARRAY_CONFIDENCE,
            target_step_id: upstream_step_id.to_string(),
            extract_field: Some(field),
            risk: RepairRisk::Medium,
        },
        (UpstreamShape::SingleRecord, _) => RepairProposal {
            action: RepairAction::WrapInArray,
            description: format!(
                "Wrap single record from {upstream_step_id} as a one-element array for {failed_step_id}"
            ),
            confidence: WRAP_CONFIDENCE,
            target_step_id: upstream_step_id.to_string(),
            extract_field: None,
            risk: RepairRisk::Low,
        },
        (UpstreamShape::AlreadyArray, _) => {
            RepairProposal::none(upstream_step_id, "Upstream output is already an array")
        }
        (UpstreamShape::TooDeep, _) => RepairProposal::none(
            upstream_step_id,
            format!("Upstream output is nested {} levels deep", analysis.depth),
        ),
        _ => RepairProposal::none(upstream_step_id, "Upstream output has no repairable shape"),
    };

    tracing::debug!(
        "Repair proposal for {}: {} (confidence {:.2})",
        failed_step_id,
        proposal.action.as_str(),
        proposal.confidence
    );
    proposal
}

/// Apply a proposal to a copy of the upstream output
///
/// Returns `None` when the proposal does nothing or no longer fits the
/// payload. Metadata is carried over unchanged.
#[must_use]
pub fn apply_repair(proposal: &RepairProposal, upstream_output: &StepOutput) -> Option<StepOutput> {
    match proposal.action {
        RepairAction::ExtractSingleArray | RepairAction::ExtractNamedArray => {
            let field = proposal.extract_field.as_deref()?;
            let extracted = upstream_output.data.as_object()?.get(field)?;
            if !extracted.is_array() {
                return None;
            }
            Some(upstream_output.with_data(extracted.clone()))
        }
        RepairAction::WrapInArray => {
            if !upstream_output.data.is_object() {
                return None;
            }
            Some(upstream_output.with_data(Value::Array(vec![upstream_output.data.clone()])))
        }
        RepairAction::None => None,
    }
}

/// Find the step whose output fed the failing step
///
/// Resolution order: last declared dependency, a `{{stepN...}}` reference in
/// `input`, a reference anywhere in `params`, the most recently completed
/// step.
#[must_use]
pub fn detect_upstream_step_id(step: &StepDefinition, completed_step_ids: &[String]) -> Option<String> {
    if let Some(dep) = step.dependencies.last() {
        return Some(dep.clone());
    }

    if let Some(found) = step
        .input
        .as_ref()
        .and_then(|input| find_step_reference(input, &step.id))
    {
        return Some(found);
    }

    if let Some(found) = step
        .params
        .as_ref()
        .and_then(|params| find_step_reference(params, &step.id))
    {
        return Some(found);
    }

    completed_step_ids
        .iter()
        .rev()
        .find(|id| **id != step.id)
        .cloned()
}

fn find_step_reference(value: &Value, own_id: &str) -> Option<String> {
    match value {
        Value::String(text) => STEP_REFERENCE
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .find(|id| *id != own_id)
            .map(str::to_string),
        Value::Array(items) => items.iter().find_map(|v| find_step_reference(v, own_id)),
        Value::Object(map) => map.values().find_map(|v| find_step_reference(v, own_id)),
        _ => None,
    }
}
