//! In-memory checkpoint snapshots

use crate::context::ProgressSnapshot;
use crate::ids::ExecutionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Boundary at which a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointLevel {
    Step,
    Batch,
    Validation,
}

/// Metadata-only snapshot of execution progress
///
/// Holds copies of the context's id lists, so later context mutation never
/// rewrites history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryCheckpoint {
    /// Monotonically increasing within one execution, starting at 1
    pub checkpoint_id: u64,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub level: CheckpointLevel,
    pub completed_step_ids: Vec<String>,
    pub failed_step_ids: Vec<String>,
    pub skipped_step_ids: Vec<String>,
    pub current_step_id: Option<String>,
    pub tokens_used: u64,
    pub execution_time_ms: u64,
    pub trigger_step_id: Option<String>,
}

impl InMemoryCheckpoint {
    /// Build from a progress copy
    #[must_use]
    pub fn from_progress(
        checkpoint_id: u64,
        execution_id: ExecutionId,
        level: CheckpointLevel,
        progress: ProgressSnapshot,
        trigger_step_id: Option<String>,
    ) -> Self {
        Self {
            checkpoint_id,
            execution_id,
            timestamp: Utc::now(),
            level,
            completed_step_ids: progress.completed_step_ids,
            failed_step_ids: progress.failed_step_ids,
            skipped_step_ids: progress.skipped_step_ids,
            current_step_id: progress.current_step_id,
            tokens_used: progress.tokens_used,
            execution_time_ms: progress.execution_time_ms,
            trigger_step_id,
        }
    }
}
