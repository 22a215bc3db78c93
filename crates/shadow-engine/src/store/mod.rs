//! Persistence seam
//!
//! Schema-agnostic view of the durable tables the engine reads and writes:
//! - `shadow_failure_snapshots` (insert-only)
//! - `data_decision_requests` (insert + conditional status update)
//! - `behavior_rules` (insert + application counter)
//! - `agents` lifecycle columns (read + conditional update)
//!
//! Every write is keyed by a single row id; no method needs a cross-row
//! transaction.

mod memory;

pub use memory::InMemoryStore;

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use shadow_types::{
    AgentId, AgentLifecycleUpdate, AgentRecord, BehaviorRule, DataDecisionRequest,
    FailureSnapshot, PriorFailure, RequestId, RuleId, RuleQuery, SnapshotId, UserDecision,
};

/// Durable storage backend
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ResilienceStore: Send + Sync {
    /// Persist one failure snapshot
    async fn insert_failure_snapshot(
        &self,
        snapshot: FailureSnapshot,
    ) -> Result<SnapshotId, StoreError>;

    /// Most recent failures of an agent, newest first
    async fn recent_failures(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> Result<Vec<PriorFailure>, StoreError>;

    /// Active rule matching the query; agent-specific rules win over global ones
    async fn find_active_rule(&self, query: RuleQuery) -> Result<Option<BehaviorRule>, StoreError>;

    async fn insert_behavior_rule(&self, rule: BehaviorRule) -> Result<RuleId, StoreError>;

    /// Increment `applied_count` and set `last_applied_at`
    async fn record_rule_application(
        &self,
        rule_id: RuleId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_decision_request(
        &self,
        request: DataDecisionRequest,
    ) -> Result<RequestId, StoreError>;

    async fn get_decision_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<DataDecisionRequest>, StoreError>;

    /// Record a human answer. Applies only while the request is pending;
    /// returns whether this call performed the transition.
    async fn respond_to_decision_request(
        &self,
        request_id: RequestId,
        decision: UserDecision,
    ) -> Result<bool, StoreError>;

    /// Mark a pending request as timed out. Returns `true` for exactly one
    /// caller per request.
    async fn mark_decision_timeout(&self, request_id: RequestId) -> Result<bool, StoreError>;

    async fn agent_record(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>, StoreError>;

    /// Write lifecycle columns only if `production_ready` still equals
    /// `expected_production_ready`. Returns whether the row was updated.
    async fn update_agent_lifecycle(
        &self,
        agent_id: &AgentId,
        expected_production_ready: bool,
        update: AgentLifecycleUpdate,
    ) -> Result<bool, StoreError>;
}
