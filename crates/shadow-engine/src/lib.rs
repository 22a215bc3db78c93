//! Shadow Engine - execution resilience for calibrating workflows
//!
//! Supervises a multi-step workflow while its agent is still calibrating.
//! When a step fails the engine decides whether to repair data and retry,
//! skip, stop, or pause and ask a human:
//! 1. **Classify**: map the raw error onto a failure category
//! 2. **Capture**: persist a metadata-only failure snapshot
//! 3. **Checkpoint**: record execution progress in memory
//! 4. **Decide**: repair, retry, ask, or stop
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use shadow_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let orchestrator = ResumeOrchestrator::new(store, ResilienceConfig::default());
//!
//! orchestrator.begin_execution(ExecutionScope::new("exec-1", "agent-1", "user-1")).await;
//! let decision = orchestrator
//!     .handle_step_failure(&execution_id, &step, &error, &mut ctx, None)
//!     .await;
//! orchestrator.finish_execution(&execution_id, ExecutionOutcome::Succeeded).await;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod capture;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod decision;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod protection;
pub mod repair;
pub mod store;

pub use capture::{CaptureResult, FailureCapture};
pub use checkpoint::CheckpointManager;
pub use classifier::{classify, detect_parameter_error, StepContext};
pub use config::{CaptureConfig, DecisionConfig, ExecutionProtectionConfig, ResilienceConfig};
pub use decision::DataDecisionHandler;
pub use error::{ConfigError, ResilienceError, StoreError};
pub use lifecycle::{AgentLifecycle, LifecycleState};
pub use orchestrator::ResumeOrchestrator;
pub use protection::ExecutionProtection;
pub use store::{InMemoryStore, ResilienceStore};

/// Re-export common types for convenience
pub mod prelude {
    pub use crate::config::ResilienceConfig;
    pub use crate::lifecycle::LifecycleState;
    pub use crate::orchestrator::ResumeOrchestrator;
    pub use crate::store::{InMemoryStore, ResilienceStore};
    pub use shadow_types::{
        ContextAccess, ExecutionContext, ExecutionId, ExecutionOutcome, ExecutionScope,
        ResumeAction, ResumeDecision, StepDefinition, StepError, StepOutput,
    };
    pub use std::sync::Arc;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
