//! Execution context and step types
//!
//! The step executor owns the [`ExecutionContext`]. The engine only sees it
//! through [`ContextAccess`], reading progress and rewriting step outputs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Declared step of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id (`step3`)
    pub id: String,
    /// Human-readable step name
    pub name: String,
    /// Step kind (`action`, `transform`, `scatter_gather`, `loop`, ...)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    /// Explicitly declared upstream steps, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Primary input expression, usually a `{{stepN...}}` reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Free-form parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl StepDefinition {
    /// Create a step with only id and name
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step_type: None,
            dependencies: Vec::new(),
            input: None,
            params: None,
        }
    }

    /// With step type
    #[inline]
    #[must_use]
    pub fn with_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = Some(step_type.into());
        self
    }

    /// With declared dependencies
    #[inline]
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// With input expression
    #[inline]
    #[must_use]
    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// With parameters
    #[inline]
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// Raw error raised by a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl StepError {
    #[inline]
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Configuration value a human has to correct before the step can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterError {
    /// Normalised parameter name (`spreadsheet_id`, `range`, ...)
    pub parameter_name: String,
    /// Value quoted in the error message
    pub problematic_value: String,
    /// Resource kind as written in the message
    pub resource: String,
}

/// Metadata attached to a step output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Error string, present on failed outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_error: Option<ParameterError>,
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Payload of arbitrary shape
    pub data: Value,
    #[serde(default)]
    pub metadata: StepMetadata,
}

impl StepOutput {
    /// Create output with data and empty metadata
    #[inline]
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            metadata: StepMetadata::default(),
        }
    }

    /// With originating plugin and action
    #[inline]
    #[must_use]
    pub fn with_source(mut self, plugin: impl Into<String>, action: impl Into<String>) -> Self {
        self.metadata.plugin = Some(plugin.into());
        self.metadata.action = Some(action.into());
        self
    }

    /// With error string
    #[inline]
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.metadata.error = Some(error.into());
        self
    }

    /// Copy of this output carrying a different payload
    #[must_use]
    pub fn with_data(&self, data: Value) -> Self {
        Self {
            data,
            metadata: self.metadata.clone(),
        }
    }
}

/// Copied progress counters of an execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub completed_step_ids: Vec<String>,
    pub failed_step_ids: Vec<String>,
    pub skipped_step_ids: Vec<String>,
    pub current_step_id: Option<String>,
    pub tokens_used: u64,
    pub execution_time_ms: u64,
}

/// Accessor through which the engine reads and writes executor state
///
/// Implemented by [`ExecutionContext`]; executors keeping their state
/// elsewhere implement it directly.
pub trait ContextAccess: Send {
    /// Copy of the progress counters
    fn progress(&self) -> ProgressSnapshot;

    /// Cached output of a step
    fn step_output(&self, step_id: &str) -> Option<StepOutput>;

    /// Replace the cached output of a step
    fn set_step_output(&mut self, step_id: &str, output: StepOutput);
}

/// Mutable per-execution state owned by the step executor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub current_step: Option<String>,
    pub total_tokens_used: u64,
    pub total_execution_time_ms: u64,
    pub step_outputs: HashMap<String, StepOutput>,
    pub inputs: Map<String, Value>,
}

impl ExecutionContext {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With original input values
    #[inline]
    #[must_use]
    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Mark a step as started
    pub fn start_step(&mut self, step_id: impl Into<String>) {
        self.current_step = Some(step_id.into());
    }

    /// Record a completed step and its output
    pub fn complete_step(&mut self, step_id: impl Into<String>, output: StepOutput) {
        let step_id = step_id.into();
        push_unique(&mut self.completed_steps, &step_id);
        self.step_outputs.insert(step_id, output);
    }

    pub fn fail_step(&mut self, step_id: impl Into<String>) {
        push_unique(&mut self.failed_steps, &step_id.into());
    }

    pub fn skip_step(&mut self, step_id: impl Into<String>) {
        push_unique(&mut self.skipped_steps, &step_id.into());
    }

    /// Add token usage and elapsed time
    pub fn add_usage(&mut self, tokens: u64, elapsed_ms: u64) {
        self.total_tokens_used = self.total_tokens_used.saturating_add(tokens);
        self.total_execution_time_ms = self.total_execution_time_ms.saturating_add(elapsed_ms);
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

impl ContextAccess for ExecutionContext {
    fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed_step_ids: self.completed_steps.clone(),
            failed_step_ids: self.failed_steps.clone(),
            skipped_step_ids: self.skipped_steps.clone(),
            current_step_id: self.current_step.clone(),
            tokens_used: self.total_tokens_used,
            execution_time_ms: self.total_execution_time_ms,
        }
    }

    fn step_output(&self, step_id: &str) -> Option<StepOutput> {
        self.step_outputs.get(step_id).cloned()
    }

    fn set_step_output(&mut self, step_id: &str, output: StepOutput) {
        self.step_outputs.insert(step_id.to_string(), output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completed_steps_stay_unique_and_ordered() {
        let mut ctx = ExecutionContext::new();
        ctx.complete_step("step1", StepOutput::new(json!(1)));
        ctx.complete_step("step2", StepOutput::new(json!(2)));
        ctx.complete_step("step1", StepOutput::new(json!(3)));

        assert_eq!(ctx.completed_steps, vec!["step1", "step2"]);
        assert_eq!(ctx.step_output("step1").unwrap().data, json!(3));
    }

    #[test]
    fn progress_is_a_copy() {
        let mut ctx = ExecutionContext::new();
        ctx.complete_step("step1", StepOutput::new(json!(null)));
        let progress = ctx.progress();

        ctx.complete_step("step2", StepOutput::new(json!(null)));
        assert_eq!(progress.completed_step_ids, vec!["step1"]);
    }

    #[test]
    fn step_definition_reads_type_field() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "step3",
            "name": "Filter emails",
            "type": "transform",
            "input": "{{step2.data}}"
        }))
        .unwrap();

        assert_eq!(step.step_type.as_deref(), Some("transform"));
        assert!(step.dependencies.is_empty());
    }

    #[test]
    fn with_data_keeps_metadata() {
        let output = StepOutput::new(json!({"a": 1})).with_source("gmail", "search");
        let copy = output.with_data(json!([1]));

        assert_eq!(copy.metadata, output.metadata);
        assert_eq!(output.data, json!({"a": 1}));
    }
}
