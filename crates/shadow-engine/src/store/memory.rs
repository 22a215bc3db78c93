//! In-process store backed by concurrent maps
//!
//! Conditional updates hold the row's shard lock for the whole
//! read-compare-write, so they are atomic per row.

use super::ResilienceStore;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shadow_types::{
    AgentId, AgentLifecycleUpdate, AgentRecord, BehaviorRule, DataDecisionRequest,
    DecisionStatus, ExecutionId, FailureSnapshot, PriorFailure, RequestId, RuleId, RuleQuery,
    SnapshotId, UserDecision,
};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshots: DashMap<SnapshotId, FailureSnapshot>,
    rules: DashMap<RuleId, BehaviorRule>,
    requests: DashMap<RequestId, DataDecisionRequest>,
    agents: DashMap<AgentId, AgentRecord>,
}

impl InMemoryStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite an agent record
    pub fn put_agent(&self, record: AgentRecord) {
        self.agents.insert(record.agent_id.clone(), record);
    }

    /// Failure snapshots of one execution, oldest first
    #[must_use]
    pub fn snapshots_for(&self, execution_id: &ExecutionId) -> Vec<FailureSnapshot> {
        let mut rows: Vec<_> = self
            .snapshots
            .iter()
            .filter(|entry| entry.execution_id == *execution_id)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|s| s.failed_at);
        rows
    }

    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    #[must_use]
    pub fn rule(&self, rule_id: RuleId) -> Option<BehaviorRule> {
        self.rules.get(&rule_id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn rules(&self) -> Vec<BehaviorRule> {
        self.rules.iter().map(|r| r.value().clone()).collect()
    }

    /// Pending requests of one execution
    #[must_use]
    pub fn pending_requests(&self, execution_id: &ExecutionId) -> Vec<DataDecisionRequest> {
        self.requests
            .iter()
            .filter(|r| r.execution_id == *execution_id && r.status == DecisionStatus::Pending)
            .map(|r| r.value().clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ResilienceStore for InMemoryStore {
    async fn insert_failure_snapshot(
        &self,
        snapshot: FailureSnapshot,
    ) -> Result<SnapshotId, StoreError> {
        let id = snapshot.id;
        if self.snapshots.contains_key(&id) {
            return Err(StoreError::Conflict(format!("snapshot {id} already exists")));
        }
        self.snapshots.insert(id, snapshot);
        Ok(id)
    }

    async fn recent_failures(
        &self,
        agent_id: &AgentId,
        limit: usize,
    ) -> Result<Vec<PriorFailure>, StoreError> {
        let mut rows: Vec<_> = self
            .snapshots
            .iter()
            .filter(|s| s.agent_id == *agent_id)
            .map(|s| PriorFailure::from(s.value()))
            .collect();
        rows.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_active_rule(&self, query: RuleQuery) -> Result<Option<BehaviorRule>, StoreError> {
        let best = self
            .rules
            .iter()
            .filter(|r| r.matches(&query))
            .max_by_key(|r| (r.agent_id.is_some(), r.created_at))
            .map(|r| r.value().clone());
        Ok(best)
    }

    async fn insert_behavior_rule(&self, rule: BehaviorRule) -> Result<RuleId, StoreError> {
        let id = rule.id;
        if self.rules.contains_key(&id) {
            return Err(StoreError::Conflict(format!("rule {id} already exists")));
        }
        self.rules.insert(id, rule);
        Ok(id)
    }

    async fn record_rule_application(
        &self,
        rule_id: RuleId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut rule = self
            .rules
            .get_mut(&rule_id)
            .ok_or_else(|| StoreError::rule_not_found(rule_id))?;
        rule.applied_count += 1;
        rule.last_applied_at = Some(at);
        Ok(())
    }

    async fn insert_decision_request(
        &self,
        request: DataDecisionRequest,
    ) -> Result<RequestId, StoreError> {
        let id = request.id;
        if self.requests.contains_key(&id) {
            return Err(StoreError::Conflict(format!("request {id} already exists")));
        }
        self.requests.insert(id, request);
        Ok(id)
    }

    async fn get_decision_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<DataDecisionRequest>, StoreError> {
        Ok(self.requests.get(&request_id).map(|r| r.value().clone()))
    }

    async fn respond_to_decision_request(
        &self,
        request_id: RequestId,
        decision: UserDecision,
    ) -> Result<bool, StoreError> {
        let mut request = self
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| StoreError::request_not_found(request_id))?;
        if request.status != DecisionStatus::Pending {
            return Ok(false);
        }
        request.status = DecisionStatus::Responded;
        request.user_decision = Some(decision);
        request.responded_at = Some(Utc::now());
        Ok(true)
    }

    async fn mark_decision_timeout(&self, request_id: RequestId) -> Result<bool, StoreError> {
        let mut request = self
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| StoreError::request_not_found(request_id))?;
        if request.status != DecisionStatus::Pending {
            return Ok(false);
        }
        request.status = DecisionStatus::Timeout;
        Ok(true)
    }

    async fn agent_record(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.agents.get(agent_id).map(|a| a.value().clone()))
    }

    /// A missing agent counts as calibrating with no runs, so the first
    /// update expecting `false` creates the record.
    async fn update_agent_lifecycle(
        &self,
        agent_id: &AgentId,
        expected_production_ready: bool,
        update: AgentLifecycleUpdate,
    ) -> Result<bool, StoreError> {
        let mut record = self
            .agents
            .entry(agent_id.clone())
            .or_insert_with(|| AgentRecord {
                agent_id: agent_id.clone(),
                production_ready: false,
                calibration_run_count: 0,
            });
        if record.production_ready != expected_production_ready {
            return Ok(false);
        }
        record.production_ready = update.production_ready;
        record.calibration_run_count = update.calibration_run_count;
        Ok(true)
    }
}
