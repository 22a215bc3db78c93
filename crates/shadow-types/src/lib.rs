//! Shadow Types - data model of the execution resilience engine
//!
//! Defines the values exchanged between a step executor and the engine:
//! - Execution context, step definitions and step outputs
//! - Failure classifications
//! - Repair proposals and shape analyses
//! - Checkpoints
//! - Durable records (failure snapshots, decision requests, behavior rules)
//! - Resume decisions
//!
//! Every durable type is metadata-only. Step payloads live in
//! [`StepOutput::data`] and never reach a record.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod checkpoint;
pub mod classification;
pub mod context;
pub mod decision;
pub mod ids;
pub mod records;
pub mod repair;

pub use checkpoint::{CheckpointLevel, InMemoryCheckpoint};
pub use classification::{FailureCategory, FailureClassification, FailureSubType, Severity};
pub use context::{
    ContextAccess, ExecutionContext, ParameterError, ProgressSnapshot, StepDefinition, StepError,
    StepMetadata, StepOutput,
};
pub use decision::{
    DataDecisionResult, ExecutionOutcome, ExecutionScope, ResumeAction, ResumeDecision,
};
pub use ids::{AgentId, ExecutionId, RequestId, RuleId, SnapshotId, UserId};
pub use records::{
    AgentLifecycleUpdate, AgentRecord, BehaviorRule, DataDecision, DataDecisionContext,
    DataDecisionRequest, DataPattern, DecisionStatus, FailureSnapshot, PriorFailure, RuleAction,
    RuleActionType, RuleQuery, RuleStatus, TriggerCondition, UserDecision,
};
pub use repair::{
    RepairAction, RepairProposal, RepairResult, RepairRisk, UpstreamAnalysis, UpstreamShape,
};
