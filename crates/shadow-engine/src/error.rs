//! Error types for the resilience engine
//!
//! None of these escape the public entry points of the engine. Store and
//! internal failures are logged and folded into the safest decision.

use crate::lifecycle::LifecycleState;
use shadow_types::{AgentId, ExecutionId, RequestId, RuleId};

/// Persistence backend errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Row does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Write conflicted with a concurrent writer
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Backend unavailable or query failed
    #[error("store backend error: {0}")]
    Backend(String),

    /// Row could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    #[inline]
    #[must_use]
    pub fn request_not_found(id: RequestId) -> Self {
        Self::NotFound {
            kind: "decision request",
            id: id.to_string(),
        }
    }

    #[inline]
    #[must_use]
    pub fn rule_not_found(id: RuleId) -> Self {
        Self::NotFound {
            kind: "behavior rule",
            id: id.to_string(),
        }
    }

    #[inline]
    #[must_use]
    pub fn agent_not_found(id: &AgentId) -> Self {
        Self::NotFound {
            kind: "agent",
            id: id.to_string(),
        }
    }
}

/// Internal engine errors
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// `handle_step_failure` called before `begin_execution`
    #[error("execution not registered: {0}")]
    UnknownExecution(ExecutionId),

    /// Upstream output needed for a repair is not in the context
    #[error("no output cached for upstream step {step_id}")]
    MissingUpstream { step_id: String },

    #[error("illegal lifecycle transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}
