//! Pause-and-ask protocol for data-unavailable failures
//!
//! ```text
//! matching rule ─────────────────────────────────────────> rule decision
//! no rule ─> pending ─[human responds]─> responded ─> decision (+ learned rule)
//!               └──────[deadline]──────> timeout ───> stop
//! ```
//!
//! The request row is the source of truth. The poll loop only suspends
//! the task that owns the failing execution; dropping the future abandons
//! the wait and the row expires on its own through `expires_at`.

use crate::config::DecisionConfig;
use crate::store::ResilienceStore;
use chrono::Utc;
use shadow_types::{
    BehaviorRule, DataDecision, DataDecisionContext, DataDecisionRequest, DataDecisionResult,
    DataPattern, DecisionStatus, ExecutionScope, FailureClassification, RequestId, RuleAction,
    RuleActionType, RuleId, RuleQuery, RuleStatus, TriggerCondition, UserDecision,
};
use std::sync::Arc;
use tokio::time::Instant;

pub struct DataDecisionHandler {
    store: Arc<dyn ResilienceStore>,
    config: DecisionConfig,
}

impl DataDecisionHandler {
    /// Create handler
    pub fn new(store: Arc<dyn ResilienceStore>, config: DecisionConfig) -> Self {
        Self { store, config }
    }

    /// Resolve a data-unavailable failure
    ///
    /// Applies a remembered rule without pausing when one matches, otherwise
    /// creates a pending request and waits for a human answer or the
    /// deadline. Every path yields a result; errors resolve to `stop`.
    /// Waiting relies on the Tokio time driver.
    pub async fn handle_data_unavailable(
        &self,
        scope: &ExecutionScope,
        context: &DataDecisionContext,
        classification: &FailureClassification,
    ) -> DataDecisionResult {
        if let Some(result) = self.apply_matching_rule(scope, context).await {
            return result;
        }

        let request_id = match self.create_request(scope, context, classification).await {
            Some(id) => id,
            None => return DataDecisionResult::stop(),
        };
        self.wait_for_decision(scope, context, request_id).await
    }

    async fn apply_matching_rule(
        &self,
        scope: &ExecutionScope,
        context: &DataDecisionContext,
    ) -> Option<DataDecisionResult> {
        let query = RuleQuery {
            user_id: scope.user_id.clone(),
            agent_id: scope.agent_id.clone(),
            step_name: context.step_name.clone(),
            field: context.data_field.clone(),
            operator: context.operator.clone(),
        };
        let rule = match self.store.find_active_rule(query).await {
            Ok(rule) => rule?,
            Err(e) => {
                tracing::warn!("Behavior rule lookup failed for step {}: {}", context.step_id, e);
                return None;
            }
        };

        let decision = rule_decision(&rule);
        tracing::info!(
            "Applying behavior rule {} to step {}: {}",
            rule.id,
            context.step_id,
            decision.as_str()
        );

        // best-effort counter: detached on a Tokio runtime, inline elsewhere
        let store = Arc::clone(&self.store);
        let rule_id = rule.id;
        let record = async move {
            if let Err(e) = store.record_rule_application(rule_id, Utc::now()).await {
                tracing::warn!("Failed to record application of rule {}: {}", rule_id, e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(record);
            }
            Err(_) => record.await,
        }

        Some(DataDecisionResult {
            decision,
            rule_applied: true,
            rule_id: Some(rule.id),
            request_id: None,
        })
    }

    async fn create_request(
        &self,
        scope: &ExecutionScope,
        context: &DataDecisionContext,
        classification: &FailureClassification,
    ) -> Option<RequestId> {
        let timeout = match chrono::Duration::from_std(self.config.timeout()) {
            Ok(timeout) => timeout,
            Err(e) => {
                tracing::error!("Decision timeout out of range: {}", e);
                return None;
            }
        };
        let now = Utc::now();
        let request = DataDecisionRequest {
            id: RequestId::new(),
            execution_id: scope.execution_id.clone(),
            agent_id: scope.agent_id.clone(),
            user_id: scope.user_id.clone(),
            step_id: context.step_id.clone(),
            step_name: context.step_name.clone(),
            failure_category: classification.category,
            decision_context: context.clone(),
            status: DecisionStatus::Pending,
            user_decision: None,
            created_at: now,
            expires_at: now + timeout,
            responded_at: None,
        };

        match self.store.insert_decision_request(request).await {
            Ok(id) => {
                tracing::info!(
                    "Paused execution {} at step {}: decision request {} ({} {})",
                    scope.execution_id,
                    context.step_id,
                    id,
                    context.data_field,
                    context.operator
                );
                Some(id)
            }
            Err(e) => {
                tracing::error!(
                    "Failed to create decision request for step {}: {}",
                    context.step_id,
                    e
                );
                None
            }
        }
    }

    async fn wait_for_decision(
        &self,
        scope: &ExecutionScope,
        context: &DataDecisionContext,
        request_id: RequestId,
    ) -> DataDecisionResult {
        let deadline = Instant::now() + self.config.timeout();

        loop {
            match self.store.get_decision_request(request_id).await {
                Ok(Some(request)) => match request.status {
                    DecisionStatus::Responded => {
                        return self.on_responded(scope, context, &request).await;
                    }
                    DecisionStatus::Timeout => return stopped(request_id),
                    DecisionStatus::Pending => {
                        if request.is_expired_at(Utc::now()) || Instant::now() >= deadline {
                            return self.expire(scope, context, request_id).await;
                        }
                    }
                },
                Ok(None) => {
                    tracing::error!("Decision request {} disappeared", request_id);
                    return stopped(request_id);
                }
                Err(e) => {
                    tracing::warn!("Polling decision request {} failed: {}", request_id, e);
                    if Instant::now() >= deadline {
                        return self.expire(scope, context, request_id).await;
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.poll_interval().min(remaining)).await;
        }
    }

    async fn expire(
        &self,
        scope: &ExecutionScope,
        context: &DataDecisionContext,
        request_id: RequestId,
    ) -> DataDecisionResult {
        match self.store.mark_decision_timeout(request_id).await {
            Ok(true) => {
                tracing::warn!(
                    "Decision request {} for step {} timed out, stopping",
                    request_id,
                    context.step_id
                );
                stopped(request_id)
            }
            // another poller or the human got there first
            Ok(false) => match self.store.get_decision_request(request_id).await {
                Ok(Some(request)) if request.status == DecisionStatus::Responded => {
                    self.on_responded(scope, context, &request).await
                }
                Ok(_) => stopped(request_id),
                Err(e) => {
                    tracing::warn!("Re-reading decision request {} failed: {}", request_id, e);
                    stopped(request_id)
                }
            },
            Err(e) => {
                tracing::error!("Failed to time out decision request {}: {}", request_id, e);
                stopped(request_id)
            }
        }
    }

    async fn on_responded(
        &self,
        scope: &ExecutionScope,
        context: &DataDecisionContext,
        request: &DataDecisionRequest,
    ) -> DataDecisionResult {
        let Some(answer) = request.user_decision else {
            tracing::error!("Decision request {} responded without a decision", request.id);
            return stopped(request.id);
        };
        tracing::info!(
            "Decision request {} answered: {} (remember: {})",
            request.id,
            answer.action.as_str(),
            answer.remember
        );

        let rule_id = if answer.remember {
            self.learn_rule(scope, context, request.id, answer).await
        } else {
            None
        };

        DataDecisionResult {
            decision: answer.action,
            rule_applied: false,
            rule_id,
            request_id: Some(request.id),
        }
    }

    /// Persist a rule learned from a remembered answer. A failure here does
    /// not affect the answer itself.
    async fn learn_rule(
        &self,
        scope: &ExecutionScope,
        context: &DataDecisionContext,
        request_id: RequestId,
        answer: UserDecision,
    ) -> Option<RuleId> {
        let rule_type = RuleActionType::learned_from(answer.action);
        let rule = BehaviorRule {
            id: RuleId::new(),
            user_id: scope.user_id.clone(),
            agent_id: Some(scope.agent_id.clone()),
            rule_type,
            trigger_condition: TriggerCondition {
                step_name: Some(context.step_name.clone()),
                data_pattern: DataPattern {
                    field: context.data_field.clone(),
                    operator: context.operator.clone(),
                },
            },
            action: RuleAction {
                action_type: rule_type,
                params: serde_json::json!({ "decision": answer.action }),
            },
            status: RuleStatus::Active,
            applied_count: 0,
            last_applied_at: None,
            created_from_decision_id: Some(request_id),
            created_at: Utc::now(),
        };

        match self.store.insert_behavior_rule(rule).await {
            Ok(id) => {
                tracing::info!("Learned behavior rule {} from decision {}", id, request_id);
                Some(id)
            }
            Err(e) => {
                tracing::warn!("Failed to learn rule from decision {}: {}", request_id, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for DataDecisionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataDecisionHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Decision a stored rule resolves to
///
/// Learned rules carry the original decision in `params.decision`; rules
/// without it fall back on their type.
#[must_use]
pub fn rule_decision(rule: &BehaviorRule) -> DataDecision {
    rule.action
        .params
        .get("decision")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(match rule.action.action_type {
            RuleActionType::SkipOnEmpty => DataDecision::Skip,
            RuleActionType::DataFallback => DataDecision::Stop,
        })
}

fn stopped(request_id: RequestId) -> DataDecisionResult {
    DataDecisionResult {
        request_id: Some(request_id),
        ..DataDecisionResult::stop()
    }
}
