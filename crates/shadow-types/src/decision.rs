//! Decisions returned to the step executor

use crate::classification::FailureClassification;
use crate::context::{ParameterError, StepOutput};
use crate::ids::{AgentId, ExecutionId, RequestId, RuleId, SnapshotId, UserId};
use crate::records::DataDecision;
use crate::repair::RepairResult;
use serde::{Deserialize, Serialize};

/// What the executor should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    RetryStep,
    SkipStep,
    StopExecution,
    /// Substitute [`ResumeDecision::fallback_output`] and carry on
    ContinueWithFallback,
}

impl ResumeAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryStep => "retry_step",
            Self::SkipStep => "skip_step",
            Self::StopExecution => "stop_execution",
            Self::ContinueWithFallback => "continue_with_fallback",
        }
    }
}

impl From<DataDecision> for ResumeAction {
    fn from(decision: DataDecision) -> Self {
        match decision {
            DataDecision::Continue => Self::ContinueWithFallback,
            DataDecision::Skip => Self::SkipStep,
            DataDecision::Stop => Self::StopExecution,
        }
    }
}

/// Decision for one failed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeDecision {
    pub action: ResumeAction,
    /// Human-readable explanation
    pub reason: String,
    pub classification: FailureClassification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_error: Option<ParameterError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_output: Option<StepOutput>,
    #[serde(default)]
    pub rule_applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<u64>,
}

impl ResumeDecision {
    #[must_use]
    pub fn new(
        action: ResumeAction,
        classification: FailureClassification,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action,
            reason: reason.into(),
            classification,
            repair: None,
            parameter_error: None,
            fallback_output: None,
            rule_applied: false,
            rule_id: None,
            request_id: None,
            snapshot_id: None,
            checkpoint_id: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn stop(classification: FailureClassification, reason: impl Into<String>) -> Self {
        Self::new(ResumeAction::StopExecution, classification, reason)
    }

    #[inline]
    #[must_use]
    pub fn retry(classification: FailureClassification, reason: impl Into<String>) -> Self {
        Self::new(ResumeAction::RetryStep, classification, reason)
    }

    /// Generic stop used when the engine itself failed
    #[inline]
    #[must_use]
    pub fn fail_safe(reason: impl Into<String>) -> Self {
        Self::stop(FailureClassification::unknown(), reason)
    }

    #[inline]
    #[must_use]
    pub fn with_repair(mut self, repair: RepairResult) -> Self {
        self.repair = Some(repair);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_parameter_error(mut self, error: ParameterError) -> Self {
        self.parameter_error = Some(error);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_fallback(mut self, output: StepOutput) -> Self {
        self.fallback_output = Some(output);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_trace(mut self, snapshot_id: Option<SnapshotId>, checkpoint_id: Option<u64>) -> Self {
        self.snapshot_id = snapshot_id;
        self.checkpoint_id = checkpoint_id;
        self
    }

    #[inline]
    #[must_use]
    pub fn is_stop(&self) -> bool {
        self.action == ResumeAction::StopExecution
    }
}

/// Result of the data-unavailable protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDecisionResult {
    pub decision: DataDecision,
    pub rule_applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl DataDecisionResult {
    /// Fail-safe stop
    #[inline]
    #[must_use]
    pub fn stop() -> Self {
        Self {
            decision: DataDecision::Stop,
            rule_applied: false,
            rule_id: None,
            request_id: None,
        }
    }
}

/// Identity of one execution under supervision
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionScope {
    pub execution_id: ExecutionId,
    pub agent_id: AgentId,
    pub user_id: UserId,
}

impl ExecutionScope {
    #[must_use]
    pub fn new(
        execution_id: impl Into<ExecutionId>,
        agent_id: impl Into<AgentId>,
        user_id: impl Into<UserId>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Terminal state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
}
