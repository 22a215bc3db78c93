//! Durable records
//!
//! Rows written to the external store. None of them may carry client data
//! values: only identifiers, counts, field names and category labels.

use crate::classification::{FailureCategory, FailureSubType, Severity};
use crate::ids::{AgentId, ExecutionId, RequestId, RuleId, SnapshotId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of `shadow_failure_snapshots`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSnapshot {
    pub id: SnapshotId,
    pub execution_id: ExecutionId,
    pub agent_id: AgentId,
    pub user_id: UserId,
    pub failed_step_id: String,
    pub failed_step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_type: Option<String>,
    pub failure_category: FailureCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_sub_type: Option<FailureSubType>,
    pub severity: Severity,
    pub is_auto_retryable: bool,
    /// Sanitized and truncated error message
    pub error_message: String,
    pub completed_step_ids: Vec<String>,
    pub failed_step_ids: Vec<String>,
    pub retry_count: u32,
    pub tokens_before_failure: u64,
    pub time_before_failure_ms: u64,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Projection of a snapshot used for identical-failure detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorFailure {
    pub execution_id: ExecutionId,
    pub step_id: String,
    pub category: FailureCategory,
    pub failed_at: DateTime<Utc>,
}

impl From<&FailureSnapshot> for PriorFailure {
    fn from(snapshot: &FailureSnapshot) -> Self {
        Self {
            execution_id: snapshot.execution_id.clone(),
            step_id: snapshot.failed_step_id.clone(),
            category: snapshot.failure_category,
            failed_at: snapshot.failed_at,
        }
    }
}

/// What to do about a step that produced no data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataDecision {
    /// Continue with an empty fallback output
    Continue,
    /// Skip the step
    Skip,
    /// Stop the execution
    Stop,
}

impl DataDecision {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Skip => "skip",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Responded,
    Timeout,
}

impl DecisionStatus {
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Answer written by the human-facing surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDecision {
    pub action: DataDecision,
    /// Learn a behavior rule from this answer
    #[serde(default)]
    pub remember: bool,
}

/// Where the missing data was observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDecisionContext {
    pub step_id: String,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub data_field: String,
    pub operator: String,
}

/// One row of `data_decision_requests`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDecisionRequest {
    pub id: RequestId,
    pub execution_id: ExecutionId,
    pub agent_id: AgentId,
    pub user_id: UserId,
    pub step_id: String,
    pub step_name: String,
    pub failure_category: FailureCategory,
    pub decision_context: DataDecisionContext,
    pub status: DecisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_decision: Option<UserDecision>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl DataDecisionRequest {
    /// Request is still pending but its deadline has passed
    #[inline]
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == DecisionStatus::Pending && now >= self.expires_at
    }
}

/// Learned action for an empty-data failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleActionType {
    /// Learned from `continue` or `skip`
    SkipOnEmpty,
    /// Learned from `stop`
    DataFallback,
}

impl RuleActionType {
    /// Rule type learned from a human decision
    #[must_use]
    pub fn learned_from(decision: DataDecision) -> Self {
        match decision {
            DataDecision::Continue | DataDecision::Skip => Self::SkipOnEmpty,
            DataDecision::Stop => Self::DataFallback,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Inactive,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPattern {
    pub field: String,
    pub operator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCondition {
    /// Rule only fires for this step name when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub data_pattern: DataPattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub action_type: RuleActionType,
    #[serde(default)]
    pub params: Value,
}

/// One row of `behavior_rules`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorRule {
    pub id: RuleId,
    pub user_id: UserId,
    /// `None` applies to every agent of the user
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    pub rule_type: RuleActionType,
    pub trigger_condition: TriggerCondition,
    pub action: RuleAction,
    pub status: RuleStatus,
    pub applied_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from_decision_id: Option<RequestId>,
    pub created_at: DateTime<Utc>,
}

/// Lookup key for an active behavior rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleQuery {
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub step_name: String,
    pub field: String,
    pub operator: String,
}

impl BehaviorRule {
    /// Rule is active and its trigger matches the query
    #[must_use]
    pub fn matches(&self, query: &RuleQuery) -> bool {
        self.status == RuleStatus::Active
            && self.user_id == query.user_id
            && self
                .agent_id
                .as_ref()
                .map_or(true, |agent| *agent == query.agent_id)
            && self
                .trigger_condition
                .step_name
                .as_ref()
                .map_or(true, |name| *name == query.step_name)
            && self.trigger_condition.data_pattern.field == query.field
            && self.trigger_condition.data_pattern.operator == query.operator
    }
}

/// Lifecycle columns of the `agents` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub production_ready: bool,
    pub calibration_run_count: u32,
}

/// New lifecycle column values for a conditional update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLifecycleUpdate {
    pub production_ready: bool,
    pub calibration_run_count: u32,
}
