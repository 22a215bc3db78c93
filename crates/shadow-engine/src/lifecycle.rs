//! Agent lifecycle state machine
//!
//! An agent calibrates until one execution succeeds end to end, then runs
//! in production with recovery dormant. A failed production run sends it
//! back to calibration.
//!
//! Transitions are persisted with conditional updates on
//! `production_ready`, so concurrent runs of one agent cannot overwrite
//! each other's transition.

use crate::error::ResilienceError;
use crate::store::ResilienceStore;
use serde::{Deserialize, Serialize};
use shadow_types::{AgentId, AgentLifecycleUpdate, AgentRecord};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Recovery engine active
    Calibrating,
    /// Recovery engine dormant
    Production,
}

impl LifecycleState {
    #[inline]
    #[must_use]
    pub fn from_production_ready(production_ready: bool) -> Self {
        if production_ready {
            Self::Production
        } else {
            Self::Calibrating
        }
    }

    #[inline]
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// States reachable from `from`
#[must_use]
pub fn allowed_transitions(from: LifecycleState) -> Vec<LifecycleState> {
    use LifecycleState::*;
    match from {
        Calibrating => vec![Production],
        Production => vec![Calibrating],
    }
}

/// Validates a lifecycle transition
///
/// # Errors
/// Returns `ResilienceError::IllegalTransition` if `to` is not reachable
pub fn validate_transition(from: LifecycleState, to: LifecycleState) -> Result<(), ResilienceError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(ResilienceError::IllegalTransition { from, to })
    }
}

/// Lifecycle service over the `agents` record
pub struct AgentLifecycle {
    store: Arc<dyn ResilienceStore>,
}

impl AgentLifecycle {
    pub fn new(store: Arc<dyn ResilienceStore>) -> Self {
        Self { store }
    }

    /// Current state; a missing record or a store error means calibrating
    pub async fn state(&self, agent_id: &AgentId) -> LifecycleState {
        match self.record(agent_id).await {
            Ok(record) => LifecycleState::from_production_ready(record.production_ready),
            Err(e) => {
                tracing::warn!("Lifecycle state unavailable for agent {}: {}", agent_id, e);
                LifecycleState::Calibrating
            }
        }
    }

    /// Promote a calibrating agent after a fully successful run
    pub async fn on_execution_success(&self, agent_id: &AgentId) -> LifecycleState {
        match self.try_success(agent_id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Lifecycle update after success failed for agent {}: {}", agent_id, e);
                self.state(agent_id).await
            }
        }
    }

    /// Record a failed run. `ran_in` is the state the run executed in.
    pub async fn on_execution_failure(
        &self,
        agent_id: &AgentId,
        ran_in: LifecycleState,
    ) -> LifecycleState {
        let result = match ran_in {
            LifecycleState::Production => self.try_production_failure(agent_id).await,
            LifecycleState::Calibrating => self.try_calibration_failure(agent_id).await,
        };
        match result {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Lifecycle update after failure failed for agent {}: {}", agent_id, e);
                self.state(agent_id).await
            }
        }
    }

    async fn try_success(&self, agent_id: &AgentId) -> Result<LifecycleState, ResilienceError> {
        let record = self.record(agent_id).await?;
        let current = LifecycleState::from_production_ready(record.production_ready);
        if current.is_production() {
            return Ok(current);
        }

        validate_transition(current, LifecycleState::Production)?;
        let update = AgentLifecycleUpdate {
            production_ready: true,
            calibration_run_count: record.calibration_run_count.saturating_add(1),
        };
        self.apply(agent_id, record.production_ready, update, LifecycleState::Production)
            .await
    }

    async fn try_production_failure(
        &self,
        agent_id: &AgentId,
    ) -> Result<LifecycleState, ResilienceError> {
        let record = self.record(agent_id).await?;
        let current = LifecycleState::from_production_ready(record.production_ready);
        if !current.is_production() {
            return Ok(current);
        }

        validate_transition(current, LifecycleState::Calibrating)?;
        let update = AgentLifecycleUpdate {
            production_ready: false,
            calibration_run_count: 0,
        };
        self.apply(agent_id, true, update, LifecycleState::Calibrating)
            .await
    }

    async fn try_calibration_failure(
        &self,
        agent_id: &AgentId,
    ) -> Result<LifecycleState, ResilienceError> {
        let record = self.record(agent_id).await?;
        if record.production_ready {
            // a concurrent run already promoted the agent
            return Ok(LifecycleState::Production);
        }
        let update = AgentLifecycleUpdate {
            production_ready: false,
            calibration_run_count: record.calibration_run_count.saturating_add(1),
        };
        self.apply(agent_id, false, update, LifecycleState::Calibrating)
            .await
    }

    async fn apply(
        &self,
        agent_id: &AgentId,
        expected_production_ready: bool,
        update: AgentLifecycleUpdate,
        target: LifecycleState,
    ) -> Result<LifecycleState, ResilienceError> {
        let updated = self
            .store
            .update_agent_lifecycle(agent_id, expected_production_ready, update)
            .await?;
        if updated {
            let from = LifecycleState::from_production_ready(expected_production_ready);
            if from != target {
                tracing::info!("Agent {} lifecycle: {:?} -> {:?}", agent_id, from, target);
            }
            return Ok(target);
        }

        tracing::debug!("Lifecycle update for agent {} lost to a concurrent run", agent_id);
        let record = self.record(agent_id).await?;
        Ok(LifecycleState::from_production_ready(record.production_ready))
    }

    async fn record(&self, agent_id: &AgentId) -> Result<AgentRecord, ResilienceError> {
        Ok(self
            .store
            .agent_record(agent_id)
            .await?
            .unwrap_or_else(|| AgentRecord {
                agent_id: agent_id.clone(),
                production_ready: false,
                calibration_run_count: 0,
            }))
    }
}

impl std::fmt::Debug for AgentLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLifecycle").finish_non_exhaustive()
    }
}
