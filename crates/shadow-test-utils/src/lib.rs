//! Testing utilities for the shadow workspace
//!
//! Shared fixtures for executions, steps and contexts.

#![allow(missing_docs)]

use serde_json::Value;
use shadow_types::{ExecutionContext, ExecutionScope, StepDefinition, StepOutput};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn test_scope(execution_id: &str) -> ExecutionScope {
    ExecutionScope::new(execution_id, "agent-1", "user-1")
}

/// Step depending on `upstream`
pub fn dependent_step(id: &str, name: &str, step_type: &str, upstream: &str) -> StepDefinition {
    StepDefinition::new(id, name)
        .with_type(step_type)
        .with_dependencies([upstream])
}

/// Context in which the given steps completed in order with these payloads
pub fn context_with_outputs(outputs: &[(&str, Value)]) -> ExecutionContext {
    let mut ctx = ExecutionContext::new();
    for (step_id, data) in outputs {
        ctx.start_step(*step_id);
        ctx.complete_step(*step_id, StepOutput::new(data.clone()));
        ctx.add_usage(100, 250);
    }
    ctx
}

/// Cached payload of a step, `Value::Null` if absent
pub fn output_data(ctx: &ExecutionContext, step_id: &str) -> Value {
    ctx.step_outputs
        .get(step_id)
        .map(|o| o.data.clone())
        .unwrap_or(Value::Null)
}
