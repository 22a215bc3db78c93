//! Repair governor
//!
//! One instance per execution. Enforces:
//! - Early stop on structural categories that no retry or repair can fix
//! - A per-step and a total repair budget
//! - No repeat of a `(step, category)` repair that already failed in a
//!   prior run of the same agent

use crate::config::ExecutionProtectionConfig;
use crate::store::ResilienceStore;
use parking_lot::Mutex;
use shadow_types::{AgentId, ExecutionId, FailureCategory, FailureClassification};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Prior-run failures: step id to the categories it failed with
pub type PriorFailureIndex = HashMap<String, HashSet<FailureCategory>>;

#[derive(Debug, Default)]
struct RepairCounters {
    per_step: HashMap<String, u32>,
    total: u32,
}

pub struct ExecutionProtection {
    config: ExecutionProtectionConfig,
    store: Arc<dyn ResilienceStore>,
    agent_id: AgentId,
    execution_id: ExecutionId,
    counters: Mutex<RepairCounters>,
    prior_failures: OnceCell<PriorFailureIndex>,
}

impl ExecutionProtection {
    /// Create governor for one execution
    pub fn new(
        config: ExecutionProtectionConfig,
        store: Arc<dyn ResilienceStore>,
        agent_id: AgentId,
        execution_id: ExecutionId,
    ) -> Self {
        Self {
            config,
            store,
            agent_id,
            execution_id,
            counters: Mutex::new(RepairCounters::default()),
            prior_failures: OnceCell::new(),
        }
    }

    /// Structural failure that is not auto-retryable
    #[must_use]
    pub fn should_early_stop(&self, classification: &FailureClassification) -> bool {
        self.config.early_stop_on_non_recoverable
            && classification.category.is_structural()
            && !classification.is_auto_retryable
    }

    /// Whether another repair of `step_id` is allowed
    pub async fn can_attempt_repair(
        &self,
        step_id: &str,
        classification: &FailureClassification,
    ) -> bool {
        {
            let counters = self.counters.lock();
            let step_count = counters.per_step.get(step_id).copied().unwrap_or(0);
            if step_count >= self.config.max_repairs_per_step {
                tracing::warn!(
                    "Repair budget for step {} exhausted ({}/{})",
                    step_id,
                    step_count,
                    self.config.max_repairs_per_step
                );
                return false;
            }
            if counters.total >= self.config.max_total_repairs {
                tracing::warn!(
                    "Total repair budget for execution {} exhausted ({}/{})",
                    self.execution_id,
                    counters.total,
                    self.config.max_total_repairs
                );
                return false;
            }
        }

        if self.config.check_identical_failures {
            let failed_before = self
                .prior_failures()
                .await
                .get(step_id)
                .is_some_and(|categories| categories.contains(&classification.category));
            if failed_before {
                tracing::info!(
                    "Step {} already failed with {} in a prior run, not repairing",
                    step_id,
                    classification.category
                );
                return false;
            }
        }

        true
    }

    /// Count one attempted repair, whatever its outcome
    pub fn record_repair_attempt(&self, step_id: &str) {
        let mut counters = self.counters.lock();
        *counters.per_step.entry(step_id.to_string()).or_insert(0) += 1;
        counters.total += 1;
    }

    #[must_use]
    pub fn step_repair_count(&self, step_id: &str) -> u32 {
        self.counters.lock().per_step.get(step_id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_repair_count(&self) -> u32 {
        self.counters.lock().total
    }

    /// Failures from earlier runs of this agent, loaded once
    ///
    /// A store error yields an empty index.
    pub async fn prior_failures(&self) -> &PriorFailureIndex {
        self.prior_failures
            .get_or_init(|| async {
                match self
                    .store
                    .recent_failures(&self.agent_id, self.config.prior_failure_lookback)
                    .await
                {
                    Ok(rows) => {
                        let mut index = PriorFailureIndex::new();
                        for row in rows
                            .into_iter()
                            .filter(|row| row.execution_id != self.execution_id)
                        {
                            index.entry(row.step_id).or_default().insert(row.category);
                        }
                        tracing::debug!(
                            "Loaded prior failures for agent {}: {} steps",
                            self.agent_id,
                            index.len()
                        );
                        index
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Prior failure history unavailable for agent {}: {}",
                            self.agent_id,
                            e
                        );
                        PriorFailureIndex::new()
                    }
                }
            })
            .await
    }
}

impl std::fmt::Debug for ExecutionProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionProtection")
            .field("config", &self.config)
            .field("agent_id", &self.agent_id)
            .field("execution_id", &self.execution_id)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MockResilienceStore;
    use chrono::Utc;
    use shadow_types::{FailureSubType, PriorFailure, Severity};

    fn shape_mismatch() -> FailureClassification {
        FailureClassification::new(FailureCategory::DataShapeMismatch, Severity::High)
            .with_sub_type(FailureSubType::TransformInput)
    }

    fn protection(store: MockResilienceStore, config: ExecutionProtectionConfig) -> ExecutionProtection {
        ExecutionProtection::new(
            config,
            Arc::new(store),
            AgentId::from("a1"),
            ExecutionId::from("exec-now"),
        )
    }

    fn no_history() -> MockResilienceStore {
        let mut store = MockResilienceStore::new();
        store.expect_recent_failures().returning(|_, _| Ok(vec![]));
        store
    }

    #[test]
    fn structural_non_retryable_failures_stop_early() {
        let p = protection(MockResilienceStore::new(), ExecutionProtectionConfig::default());
        for category in FailureCategory::ALL {
            let c = FailureClassification::new(category, Severity::High);
            assert_eq!(p.should_early_stop(&c), category.is_structural(), "{category}");
        }
        let retryable =
            FailureClassification::new(FailureCategory::MissingStep, Severity::High).retryable();
        assert!(!p.should_early_stop(&retryable));
    }

    #[test]
    fn early_stop_can_be_disabled() {
        let config = ExecutionProtectionConfig {
            early_stop_on_non_recoverable: false,
            ..Default::default()
        };
        let p = protection(MockResilienceStore::new(), config);
        let c = FailureClassification::new(FailureCategory::MissingStep, Severity::High);
        assert!(!p.should_early_stop(&c));
    }

    #[tokio::test]
    async fn per_step_budget_applies_before_total_budget() {
        let p = protection(no_history(), ExecutionProtectionConfig::default());
        let c = shape_mismatch();

        assert!(p.can_attempt_repair("step2", &c).await);
        p.record_repair_attempt("step2");
        assert!(p.can_attempt_repair("step2", &c).await);
        p.record_repair_attempt("step2");

        assert!(!p.can_attempt_repair("step2", &c).await);
        assert_eq!(p.total_repair_count(), 2);
        assert!(p.can_attempt_repair("step3", &c).await);
    }

    #[tokio::test]
    async fn total_budget_spans_steps() {
        let p = protection(no_history(), ExecutionProtectionConfig::default());
        let c = shape_mismatch();
        for step in ["s1", "s2", "s3", "s4", "s5"] {
            p.record_repair_attempt(step);
        }
        assert!(!p.can_attempt_repair("s6", &c).await);
    }

    #[tokio::test]
    async fn identical_prior_failure_blocks_repair() {
        let mut store = MockResilienceStore::new();
        store.expect_recent_failures().times(1).returning(|_, _| {
            Ok(vec![
                PriorFailure {
                    execution_id: ExecutionId::from("exec-old"),
                    step_id: "step2".into(),
                    category: FailureCategory::DataShapeMismatch,
                    failed_at: Utc::now(),
                },
                PriorFailure {
                    execution_id: ExecutionId::from("exec-now"),
                    step_id: "step9".into(),
                    category: FailureCategory::DataShapeMismatch,
                    failed_at: Utc::now(),
                },
            ])
        });
        let p = protection(store, ExecutionProtectionConfig::default());
        let c = shape_mismatch();

        assert!(!p.can_attempt_repair("step2", &c).await);
        assert!(p.can_attempt_repair("step9", &c).await);
        assert!(p.can_attempt_repair("step3", &c).await);
    }

    #[tokio::test]
    async fn history_load_error_does_not_block() {
        let mut store = MockResilienceStore::new();
        store
            .expect_recent_failures()
            .times(1)
            .returning(|_, _| Err(StoreError::Backend("connection refused".into())));
        let p = protection(store, ExecutionProtectionConfig::default());

        assert!(p.can_attempt_repair("step2", &shape_mismatch()).await);
        assert!(p.prior_failures().await.is_empty());
    }

    #[tokio::test]
    async fn history_not_loaded_when_check_disabled() {
        let config = ExecutionProtectionConfig {
            check_identical_failures: false,
            ..Default::default()
        };
        let p = protection(MockResilienceStore::new(), config);
        assert!(p.can_attempt_repair("step2", &shape_mismatch()).await);
    }
}
