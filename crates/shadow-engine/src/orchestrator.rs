//! Resume orchestrator
//!
//! Single entry point for step failures. For each failure it:
//! - Classifies the error and captures a snapshot
//! - Takes a step checkpoint
//! - Stops early on structural failures
//! - Dispatches on the category (repair, retry, ask a human, or stop)
//!
//! Sessions are keyed by execution id and live from
//! [`ResumeOrchestrator::begin_execution`] to
//! [`ResumeOrchestrator::finish_execution`]. Nothing raised inside a
//! session, panics included, reaches the caller: every path yields a
//! [`ResumeDecision`], `stop_execution` when in doubt.

use crate::capture::FailureCapture;
use crate::checkpoint::CheckpointManager;
use crate::classifier::{classify, detect_parameter_error, StepContext};
use crate::config::ResilienceConfig;
use crate::decision::DataDecisionHandler;
use crate::error::ResilienceError;
use crate::lifecycle::{AgentLifecycle, LifecycleState};
use crate::protection::ExecutionProtection;
use crate::repair::{apply_repair, detect_upstream_step_id, is_metadata_field, propose_repair};
use crate::store::ResilienceStore;
use dashmap::DashMap;
use futures::FutureExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use shadow_types::{
    ContextAccess, DataDecision, DataDecisionContext, ExecutionId, ExecutionOutcome,
    ExecutionScope, FailureCategory, FailureClassification, InMemoryCheckpoint, RepairResult,
    ResumeAction, ResumeDecision, StepDefinition, StepError, StepMetadata, StepOutput,
};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

static QUOTED_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"]([A-Za-z_][\w.\-]*)['"]"#).expect("valid regex"));

static MISSING_WORDING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bmissing\b|\brequired\b|\bundefined\b|\bnot present\b").expect("valid regex")
});

static EMPTY_WORDING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bempty\b|\bno (?:results|records|rows|items)\b|\b0 (?:results|records|rows|items)\b")
        .expect("valid regex")
});

const OP_IS_EMPTY: &str = "is_empty";
const OP_IS_MISSING: &str = "is_missing";
const OP_NO_DATA: &str = "no_data";

/// State of one supervised execution
struct ExecutionSession {
    scope: ExecutionScope,
    mode: LifecycleState,
    checkpoints: CheckpointManager,
    protection: ExecutionProtection,
    failure_counts: Mutex<HashMap<String, u32>>,
    last_seen: Mutex<Instant>,
}

impl ExecutionSession {
    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }

    /// Prior failures of `step_id` in this execution, then count this one
    fn next_retry_count(&self, step_id: &str) -> u32 {
        let mut counts = self.failure_counts.lock();
        let count = counts.entry(step_id.to_string()).or_insert(0);
        let previous = *count;
        *count += 1;
        previous
    }
}

/// Coordinator invoked by the step executor on every step failure
pub struct ResumeOrchestrator {
    store: Arc<dyn ResilienceStore>,
    config: ResilienceConfig,
    capture: FailureCapture,
    decisions: DataDecisionHandler,
    lifecycle: AgentLifecycle,
    sessions: DashMap<ExecutionId, Arc<ExecutionSession>>,
}

impl ResumeOrchestrator {
    /// Create orchestrator over a store
    pub fn new(store: Arc<dyn ResilienceStore>, config: ResilienceConfig) -> Self {
        Self {
            capture: FailureCapture::new(Arc::clone(&store), config.capture),
            decisions: DataDecisionHandler::new(Arc::clone(&store), config.decision),
            lifecycle: AgentLifecycle::new(Arc::clone(&store)),
            sessions: DashMap::new(),
            store,
            config,
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    /// Number of executions currently supervised
    #[must_use]
    pub fn active_executions(&self) -> usize {
        self.sessions.len()
    }

    /// Register an execution. Returns the lifecycle state it runs in.
    ///
    /// The session lives until `finish_execution`. Executors that can lose
    /// track of a run should call `evict_idle` periodically.
    pub async fn begin_execution(&self, scope: ExecutionScope) -> LifecycleState {
        let mode = self.lifecycle.state(&scope.agent_id).await;
        let session = ExecutionSession {
            checkpoints: CheckpointManager::new(scope.execution_id.clone()),
            protection: ExecutionProtection::new(
                self.config.protection,
                Arc::clone(&self.store),
                scope.agent_id.clone(),
                scope.execution_id.clone(),
            ),
            failure_counts: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
            mode,
            scope,
        };
        tracing::info!(
            "Supervising execution {} of agent {} ({:?})",
            session.scope.execution_id,
            session.scope.agent_id,
            mode
        );
        self.sessions
            .insert(session.scope.execution_id.clone(), Arc::new(session));
        mode
    }

    /// Decide how the executor proceeds after `step` failed
    ///
    /// `step_output` is the failing step's own output when it produced one.
    /// Repairs and parameter-error details are written back through `ctx`.
    pub async fn handle_step_failure(
        &self,
        execution_id: &ExecutionId,
        step: &StepDefinition,
        error: &StepError,
        ctx: &mut dyn ContextAccess,
        step_output: Option<&StepOutput>,
    ) -> ResumeDecision {
        let guarded = AssertUnwindSafe(self.try_handle(execution_id, step, error, ctx, step_output))
            .catch_unwind()
            .await;
        match guarded {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::error!("Failure handling for step {} aborted: {}", step.id, e);
                ResumeDecision::fail_safe(format!("failure handling aborted: {e}"))
            }
            Err(_) => {
                tracing::error!("Failure handling for step {} panicked", step.id);
                ResumeDecision::fail_safe("failure handling panicked")
            }
        }
    }

    async fn try_handle(
        &self,
        execution_id: &ExecutionId,
        step: &StepDefinition,
        error: &StepError,
        ctx: &mut dyn ContextAccess,
        step_output: Option<&StepOutput>,
    ) -> Result<ResumeDecision, ResilienceError> {
        let session = self
            .sessions
            .get(execution_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| ResilienceError::UnknownExecution(execution_id.clone()))?;
        session.touch();

        let classification = classify(error, &StepContext::from(step));
        tracing::info!(
            "Step {} of execution {} failed: {}",
            step.id,
            execution_id,
            classification
        );

        let progress = ctx.progress();
        let retry_count = session.next_retry_count(&step.id);
        let captured = self
            .capture
            .capture(&session.scope, step, error, &classification, &progress, retry_count)
            .await;
        let checkpoint = session.checkpoints.create_step_checkpoint(progress, &step.id);

        let decision = if session.mode.is_production() {
            dormant_decision(classification)
        } else if session.protection.should_early_stop(&classification) {
            tracing::warn!(
                "Stopping execution {} early: {} is not recoverable",
                execution_id,
                classification.category
            );
            ResumeDecision::stop(
                classification,
                format!("{} cannot be fixed by retry or repair", classification.category),
            )
        } else {
            let branch = match classification.category {
                FailureCategory::DataShapeMismatch => {
                    self.handle_shape_mismatch(&session, step, classification, ctx)
                        .await
                }
                FailureCategory::ExecutionError => {
                    Ok(handle_execution_error(step, error, classification, ctx, step_output))
                }
                FailureCategory::DataUnavailable => Ok(self
                    .handle_data_unavailable(&session, step, error, classification, step_output)
                    .await),
                FailureCategory::CapabilityMismatch
                | FailureCategory::LogicError
                | FailureCategory::MissingStep
                | FailureCategory::InvalidStepOrder => Ok(ResumeDecision::stop(
                    classification,
                    format!("{} requires a workflow change", classification.category),
                )),
            };
            branch.unwrap_or_else(|e| {
                tracing::error!("Recovery branch for step {} failed: {}", step.id, e);
                ResumeDecision::stop(classification, format!("recovery failed: {e}"))
            })
        };

        tracing::info!(
            "Step {} of execution {}: {}",
            step.id,
            execution_id,
            decision.action.as_str()
        );
        Ok(decision.with_trace(captured.snapshot_id, Some(checkpoint.checkpoint_id)))
    }

    async fn handle_shape_mismatch(
        &self,
        session: &ExecutionSession,
        step: &StepDefinition,
        classification: FailureClassification,
        ctx: &mut dyn ContextAccess,
    ) -> Result<ResumeDecision, ResilienceError> {
        if !session
            .protection
            .can_attempt_repair(&step.id, &classification)
            .await
        {
            return Ok(ResumeDecision::stop(
                classification,
                format!("repair not allowed for step {} (budget exhausted or failed in a prior run)", step.id),
            ));
        }

        let progress = ctx.progress();
        let Some(upstream_id) = detect_upstream_step_id(step, &progress.completed_step_ids) else {
            return Ok(ResumeDecision::stop(
                classification,
                format!("no upstream step found for {}", step.id),
            ));
        };
        let upstream = ctx
            .step_output(&upstream_id)
            .ok_or_else(|| ResilienceError::MissingUpstream {
                step_id: upstream_id.clone(),
            })?;

        let proposal = propose_repair(&classification, &step.id, &upstream_id, &upstream);
        if !proposal.is_actionable() {
            let reason = format!("no repair possible: {}", proposal.description);
            return Ok(ResumeDecision::stop(classification, reason).with_repair(RepairResult {
                proposal,
                applied: false,
                data_modified: false,
                repaired_item_count: None,
            }));
        }

        session.protection.record_repair_attempt(&step.id);
        let Some(repaired) = apply_repair(&proposal, &upstream) else {
            tracing::warn!("Repair {} of step {} did not apply", proposal.action.as_str(), upstream_id);
            let reason = format!("repair {} could not be applied", proposal.action.as_str());
            return Ok(ResumeDecision::stop(classification, reason).with_repair(RepairResult {
                proposal,
                applied: false,
                data_modified: false,
                repaired_item_count: None,
            }));
        };

        let data_modified = repaired.data != upstream.data;
        let repaired_item_count = repaired.data.as_array().map(Vec::len);
        ctx.set_step_output(&upstream_id, repaired);
        session
            .checkpoints
            .create_validation_checkpoint(ctx.progress(), &upstream_id);

        let result = RepairResult {
            proposal,
            applied: true,
            data_modified,
            repaired_item_count,
        };
        if data_modified {
            tracing::info!(
                "Repaired output of step {} ({}), retrying {}",
                upstream_id,
                result.proposal.action.as_str(),
                step.id
            );
            let reason = format!("repaired output of {}: {}", upstream_id, result.proposal.description);
            Ok(ResumeDecision::retry(classification, reason).with_repair(result))
        } else {
            Ok(ResumeDecision::stop(classification, "repair left the data unchanged").with_repair(result))
        }
    }

    async fn handle_data_unavailable(
        &self,
        session: &ExecutionSession,
        step: &StepDefinition,
        error: &StepError,
        classification: FailureClassification,
        step_output: Option<&StepOutput>,
    ) -> ResumeDecision {
        let context = decision_context(step, error, step_output);
        let result = self
            .decisions
            .handle_data_unavailable(&session.scope, &context, &classification)
            .await;

        let reason = if result.rule_applied {
            format!("behavior rule chose {}", result.decision.as_str())
        } else {
            format!("decision for missing {}: {}", context.data_field, result.decision.as_str())
        };
        let mut decision = ResumeDecision::new(ResumeAction::from(result.decision), classification, reason);
        decision.rule_applied = result.rule_applied;
        decision.rule_id = result.rule_id;
        decision.request_id = result.request_id;

        if result.decision == DataDecision::Continue {
            decision = decision.with_fallback(StepOutput {
                data: Value::Array(Vec::new()),
                metadata: StepMetadata {
                    plugin: context.plugin,
                    action: context.action,
                    ..StepMetadata::default()
                },
            });
        }
        decision
    }

    /// Take a batch-boundary checkpoint
    pub fn record_batch_checkpoint(
        &self,
        execution_id: &ExecutionId,
        ctx: &dyn ContextAccess,
        trigger_step_id: Option<&str>,
    ) -> Option<InMemoryCheckpoint> {
        let session = self.sessions.get(execution_id)?;
        session.touch();
        Some(
            session
                .checkpoints
                .create_batch_checkpoint(ctx.progress(), trigger_step_id),
        )
    }

    /// Take a checkpoint after the executor validated a step's output
    pub fn record_validation_checkpoint(
        &self,
        execution_id: &ExecutionId,
        ctx: &dyn ContextAccess,
        trigger_step_id: &str,
    ) -> Option<InMemoryCheckpoint> {
        let session = self.sessions.get(execution_id)?;
        session.touch();
        Some(
            session
                .checkpoints
                .create_validation_checkpoint(ctx.progress(), trigger_step_id),
        )
    }

    /// Most recent checkpoint of the execution not triggered by `step_id`
    #[must_use]
    pub fn checkpoint_before(
        &self,
        execution_id: &ExecutionId,
        step_id: &str,
    ) -> Option<InMemoryCheckpoint> {
        self.sessions
            .get(execution_id)?
            .checkpoints
            .get_checkpoint_before(step_id)
    }

    /// Checkpoints held for the execution
    #[must_use]
    pub fn checkpoint_count(&self, execution_id: &ExecutionId) -> Option<usize> {
        self.sessions
            .get(execution_id)
            .map(|s| s.checkpoints.get_checkpoint_count())
    }

    /// Repairs attempted so far in the execution
    #[must_use]
    pub fn repair_count(&self, execution_id: &ExecutionId) -> Option<u32> {
        self.sessions
            .get(execution_id)
            .map(|s| s.protection.total_repair_count())
    }

    /// Drop sessions with no failure or checkpoint activity for `max_idle`
    ///
    /// Evicted runs get no lifecycle transition. `max_idle` should exceed the
    /// decision timeout, since a run waiting on a human looks idle. Returns
    /// how many were dropped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|execution_id, session| {
            if session.idle_for(now) < max_idle {
                return true;
            }
            tracing::warn!(
                "Evicting execution {} of agent {}: idle for {:?}",
                execution_id,
                session.scope.agent_id,
                session.idle_for(now)
            );
            session.checkpoints.clear();
            false
        });
        before.saturating_sub(self.sessions.len())
    }

    /// End supervision and apply the agent lifecycle transition
    ///
    /// Returns `None` for an execution that was never registered.
    pub async fn finish_execution(
        &self,
        execution_id: &ExecutionId,
        outcome: ExecutionOutcome,
    ) -> Option<LifecycleState> {
        let (_, session) = self.sessions.remove(execution_id)?;
        session.checkpoints.clear();

        let agent_id = &session.scope.agent_id;
        let state = match outcome {
            ExecutionOutcome::Succeeded => self.lifecycle.on_execution_success(agent_id).await,
            ExecutionOutcome::Failed => {
                self.lifecycle
                    .on_execution_failure(agent_id, session.mode)
                    .await
            }
        };
        tracing::info!(
            "Execution {} finished ({:?}), agent {} is {:?}",
            execution_id,
            outcome,
            agent_id,
            state
        );
        Some(state)
    }
}

impl std::fmt::Debug for ResumeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeOrchestrator")
            .field("config", &self.config)
            .field("active_executions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

/// Production agents only retry transient errors
fn dormant_decision(classification: FailureClassification) -> ResumeDecision {
    if classification.is_auto_retryable {
        ResumeDecision::retry(classification, "transient error, retrying")
    } else {
        ResumeDecision::stop(classification, "recovery is dormant for production agents")
    }
}

fn handle_execution_error(
    step: &StepDefinition,
    error: &StepError,
    classification: FailureClassification,
    ctx: &mut dyn ContextAccess,
    step_output: Option<&StepOutput>,
) -> ResumeDecision {
    if let Some(parameter_error) = detect_parameter_error(&error.message) {
        tracing::warn!(
            "Step {} references a missing {} ({})",
            step.id,
            parameter_error.resource,
            parameter_error.parameter_name
        );
        let mut output = step_output
            .cloned()
            .or_else(|| ctx.step_output(&step.id))
            .unwrap_or_else(|| StepOutput::new(Value::Null));
        output.metadata.error = Some(error.message.clone());
        output.metadata.parameter_error = Some(parameter_error.clone());
        ctx.set_step_output(&step.id, output);

        let reason = format!(
            "{} '{}' not found, correct {} and retry",
            parameter_error.resource, parameter_error.problematic_value, parameter_error.parameter_name
        );
        return ResumeDecision::stop(classification, reason).with_parameter_error(parameter_error);
    }

    if classification.is_auto_retryable {
        ResumeDecision::retry(classification, "transient error, retrying")
    } else {
        ResumeDecision::stop(classification, format!("{} cannot be retried automatically", classification))
    }
}

/// Where the missing data was observed
#[must_use]
pub fn decision_context(
    step: &StepDefinition,
    error: &StepError,
    step_output: Option<&StepOutput>,
) -> DataDecisionContext {
    let metadata = step_output.map(|o| &o.metadata);
    let plugin = metadata
        .and_then(|m| m.plugin.clone())
        .or_else(|| step.step_type.clone());
    let action = metadata
        .and_then(|m| m.action.clone())
        .or_else(|| step.step_type.clone());

    let (data_field, operator) = step_output
        .and_then(|o| empty_field(&o.data))
        .or_else(|| {
            QUOTED_FIELD.captures(&error.message).and_then(|caps| {
                let field = caps.get(1)?.as_str().to_string();
                let operator = if MISSING_WORDING.is_match(&error.message) {
                    OP_IS_MISSING
                } else if EMPTY_WORDING.is_match(&error.message) {
                    OP_IS_EMPTY
                } else {
                    OP_NO_DATA
                };
                Some((field, operator))
            })
        })
        .unwrap_or_else(|| {
            let operator = if EMPTY_WORDING.is_match(&error.message) {
                OP_IS_EMPTY
            } else {
                OP_NO_DATA
            };
            ("data".to_string(), operator)
        });

    DataDecisionContext {
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        plugin,
        action,
        data_field,
        operator: operator.to_string(),
    }
}

/// First empty collection or null field of a payload. Payload fields win
/// over pagination and status fields.
fn empty_field(data: &Value) -> Option<(String, &'static str)> {
    match data {
        Value::Array(items) if items.is_empty() => Some(("data".to_string(), OP_IS_EMPTY)),
        Value::Object(map) => {
            let empty = |(key, value): (&String, &Value)| {
                let operator = match value {
                    Value::Null => OP_IS_MISSING,
                    Value::Array(items) if items.is_empty() => OP_IS_EMPTY,
                    Value::Object(inner) if inner.is_empty() => OP_IS_EMPTY,
                    _ => return None,
                };
                Some((key.clone(), operator))
            };
            map.iter()
                .filter(|(key, _)| !is_metadata_field(key))
                .find_map(empty)
                .or_else(|| map.iter().find_map(empty))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use shadow_types::{AgentRecord, ExecutionContext};

    fn orchestrator(store: Arc<InMemoryStore>) -> ResumeOrchestrator {
        ResumeOrchestrator::new(store, ResilienceConfig::default())
    }

    fn scope() -> ExecutionScope {
        ExecutionScope::new("exec-1", "agent-1", "user-1")
    }

    #[test]
    fn context_uses_first_empty_field() {
        let step = StepDefinition::new("step7", "Fetch contacts").with_type("hubspot");
        let output = StepOutput::new(json!({ "contacts": [], "total": 0 }))
            .with_source("hubspot", "list_contacts");
        let ctx = decision_context(&step, &StepError::new("No data returned"), Some(&output));

        assert_eq!(ctx.data_field, "contacts");
        assert_eq!(ctx.operator, "is_empty");
        assert_eq!(ctx.plugin.as_deref(), Some("hubspot"));
        assert_eq!(ctx.action.as_deref(), Some("list_contacts"));
    }

    #[test]
    fn context_skips_pagination_and_error_fields() {
        let step = StepDefinition::new("step3", "List users").with_type("crm");
        let error = StepError::new("No data returned");

        let output = StepOutput::new(json!({ "users": [], "next_cursor": null }));
        let ctx = decision_context(&step, &error, Some(&output));
        assert_eq!(ctx.data_field, "users");
        assert_eq!(ctx.operator, "is_empty");

        let output = StepOutput::new(json!({ "results": [], "errors": [] }));
        let ctx = decision_context(&step, &error, Some(&output));
        assert_eq!(ctx.data_field, "results");

        // only metadata is empty
        let output = StepOutput::new(json!({ "users": [{ "id": 1 }], "errors": [] }));
        let ctx = decision_context(&step, &error, Some(&output));
        assert_eq!(ctx.data_field, "errors");
    }

    #[test]
    fn context_falls_back_to_message_then_data() {
        let step = StepDefinition::new("step4", "Read rows").with_type("sheets");
        let ctx = decision_context(
            &step,
            &StepError::new("Required field 'email' is missing"),
            None,
        );
        assert_eq!(ctx.data_field, "email");
        assert_eq!(ctx.operator, "is_missing");
        assert_eq!(ctx.plugin.as_deref(), Some("sheets"));

        let ctx = decision_context(&step, &StepError::new("no data"), None);
        assert_eq!(ctx.data_field, "data");
        assert_eq!(ctx.operator, "no_data");
    }

    #[test]
    fn null_field_is_missing() {
        let step = StepDefinition::new("s", "S");
        let output = StepOutput::new(json!({ "items": [1], "owner": null }));
        let ctx = decision_context(&step, &StepError::new("no data"), Some(&output));
        assert_eq!((ctx.data_field.as_str(), ctx.operator.as_str()), ("owner", "is_missing"));
    }

    #[tokio::test]
    async fn unknown_execution_stops() {
        let o = orchestrator(Arc::new(InMemoryStore::new()));
        let mut ctx = ExecutionContext::new();
        let decision = o
            .handle_step_failure(
                &ExecutionId::from("nope"),
                &StepDefinition::new("step1", "Step"),
                &StepError::new("Request timed out").with_code("ETIMEDOUT"),
                &mut ctx,
                None,
            )
            .await;

        assert!(decision.is_stop());
        assert_eq!(decision.classification, FailureClassification::unknown());
    }

    #[tokio::test]
    async fn structural_failure_stops_early() {
        let store = Arc::new(InMemoryStore::new());
        let o = orchestrator(store.clone());
        o.begin_execution(scope()).await;
        let mut ctx = ExecutionContext::new();

        let decision = o
            .handle_step_failure(
                &scope().execution_id,
                &StepDefinition::new("step3", "Send"),
                &StepError::new("Plugin does not support action 'bulk_send'"),
                &mut ctx,
                None,
            )
            .await;

        assert_eq!(decision.action, ResumeAction::StopExecution);
        assert_eq!(decision.classification.category, FailureCategory::CapabilityMismatch);
        assert!(decision.snapshot_id.is_some());
        assert_eq!(decision.checkpoint_id, Some(1));
        assert_eq!(store.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn transient_error_retries() {
        let o = orchestrator(Arc::new(InMemoryStore::new()));
        o.begin_execution(scope()).await;
        let mut ctx = ExecutionContext::new();

        let decision = o
            .handle_step_failure(
                &scope().execution_id,
                &StepDefinition::new("step2", "Fetch"),
                &StepError::new("Too many requests").with_code("429"),
                &mut ctx,
                None,
            )
            .await;

        assert_eq!(decision.action, ResumeAction::RetryStep);
        assert!(decision.classification.is_auto_retryable);
    }

    #[tokio::test]
    async fn production_agent_is_dormant() {
        let store = Arc::new(InMemoryStore::new());
        store.put_agent(AgentRecord {
            agent_id: scope().agent_id,
            production_ready: true,
            calibration_run_count: 1,
        });
        let o = orchestrator(store.clone());
        assert_eq!(o.begin_execution(scope()).await, LifecycleState::Production);

        let mut ctx = ExecutionContext::new();
        ctx.complete_step("step1", StepOutput::new(json!({ "emails": [{ "id": 1 }] })));
        let decision = o
            .handle_step_failure(
                &scope().execution_id,
                &StepDefinition::new("step2", "Transform").with_dependencies(["step1"]),
                &StepError::new("expected array").with_code("INVALID_TRANSFORM_INPUT"),
                &mut ctx,
                None,
            )
            .await;

        assert!(decision.is_stop());
        assert!(decision.repair.is_none());
        assert_eq!(ctx.step_outputs["step1"].data, json!({ "emails": [{ "id": 1 }] }));
        assert_eq!(store.snapshot_count(), 1);

        let state = o
            .finish_execution(&scope().execution_id, ExecutionOutcome::Failed)
            .await;
        assert_eq!(state, Some(LifecycleState::Calibrating));
    }

    #[tokio::test]
    async fn finish_drops_session() {
        let o = orchestrator(Arc::new(InMemoryStore::new()));
        o.begin_execution(scope()).await;
        let ctx = ExecutionContext::new();
        o.record_batch_checkpoint(&scope().execution_id, &ctx, None);
        assert_eq!(o.checkpoint_count(&scope().execution_id), Some(1));

        let state = o
            .finish_execution(&scope().execution_id, ExecutionOutcome::Succeeded)
            .await;
        assert_eq!(state, Some(LifecycleState::Production));
        assert_eq!(o.active_executions(), 0);
        assert!(o.checkpoint_count(&scope().execution_id).is_none());
        assert!(o
            .finish_execution(&scope().execution_id, ExecutionOutcome::Succeeded)
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_evicted() {
        let o = orchestrator(Arc::new(InMemoryStore::new()));
        let stale = ExecutionScope::new("exec-stale", "agent-1", "user-1");
        let live = ExecutionScope::new("exec-live", "agent-1", "user-1");
        let ctx = ExecutionContext::new();

        o.begin_execution(stale.clone()).await;
        o.record_batch_checkpoint(&stale.execution_id, &ctx, None);
        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        o.begin_execution(live.clone()).await;
        tokio::time::advance(Duration::from_secs(40 * 60)).await;
        o.record_batch_checkpoint(&live.execution_id, &ctx, None);

        assert_eq!(o.evict_idle(Duration::from_secs(60 * 60)), 1);
        assert_eq!(o.active_executions(), 1);
        assert!(o.checkpoint_count(&stale.execution_id).is_none());
        assert_eq!(o.checkpoint_count(&live.execution_id), Some(1));
        assert_eq!(o.evict_idle(Duration::from_secs(60 * 60)), 0);
    }
}
