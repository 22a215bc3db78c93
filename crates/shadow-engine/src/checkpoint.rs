//! Per-execution checkpoint ledger
//!
//! Append-only, in-memory. Lost on process exit; only within-process
//! diagnosis relies on it.

use parking_lot::Mutex;
use shadow_types::{CheckpointLevel, ExecutionId, InMemoryCheckpoint, ProgressSnapshot};

#[derive(Debug)]
pub struct CheckpointManager {
    execution_id: ExecutionId,
    inner: Mutex<Ledger>,
}

#[derive(Debug, Default)]
struct Ledger {
    next_id: u64,
    checkpoints: Vec<InMemoryCheckpoint>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            inner: Mutex::new(Ledger::default()),
        }
    }

    /// Checkpoint at a step boundary
    pub fn create_step_checkpoint(
        &self,
        progress: ProgressSnapshot,
        trigger_step_id: &str,
    ) -> InMemoryCheckpoint {
        self.append(CheckpointLevel::Step, progress, Some(trigger_step_id.to_string()))
    }

    /// Checkpoint after a batch of steps
    pub fn create_batch_checkpoint(
        &self,
        progress: ProgressSnapshot,
        trigger_step_id: Option<&str>,
    ) -> InMemoryCheckpoint {
        self.append(CheckpointLevel::Batch, progress, trigger_step_id.map(str::to_string))
    }

    /// Checkpoint after validating (or repairing) a step's data
    pub fn create_validation_checkpoint(
        &self,
        progress: ProgressSnapshot,
        trigger_step_id: &str,
    ) -> InMemoryCheckpoint {
        self.append(
            CheckpointLevel::Validation,
            progress,
            Some(trigger_step_id.to_string()),
        )
    }

    fn append(
        &self,
        level: CheckpointLevel,
        progress: ProgressSnapshot,
        trigger_step_id: Option<String>,
    ) -> InMemoryCheckpoint {
        let mut ledger = self.inner.lock();
        ledger.next_id += 1;
        let checkpoint = InMemoryCheckpoint::from_progress(
            ledger.next_id,
            self.execution_id.clone(),
            level,
            progress,
            trigger_step_id,
        );
        ledger.checkpoints.push(checkpoint.clone());
        tracing::debug!(
            "Checkpoint {} ({:?}) for execution {}",
            checkpoint.checkpoint_id,
            level,
            self.execution_id
        );
        checkpoint
    }

    /// Most recent checkpoint not triggered by `step_id`
    #[must_use]
    pub fn get_checkpoint_before(&self, step_id: &str) -> Option<InMemoryCheckpoint> {
        self.inner
            .lock()
            .checkpoints
            .iter()
            .rev()
            .find(|cp| cp.trigger_step_id.as_deref() != Some(step_id))
            .cloned()
    }

    #[must_use]
    pub fn get_latest_checkpoint(&self) -> Option<InMemoryCheckpoint> {
        self.inner.lock().checkpoints.last().cloned()
    }

    #[must_use]
    pub fn get_checkpoint_count(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    /// Drop all checkpoints once the execution is terminal. Ids keep
    /// increasing afterwards.
    pub fn clear(&self) {
        self.inner.lock().checkpoints.clear();
    }

    #[inline]
    #[must_use]
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadow_types::{ContextAccess, ExecutionContext, StepOutput};

    fn manager() -> CheckpointManager {
        CheckpointManager::new(ExecutionId::from("exec-1"))
    }

    #[test]
    fn ids_increase_monotonically() {
        let m = manager();
        let ctx = ExecutionContext::new();
        let a = m.create_step_checkpoint(ctx.progress(), "step1");
        let b = m.create_batch_checkpoint(ctx.progress(), None);
        let c = m.create_validation_checkpoint(ctx.progress(), "step2");

        assert_eq!((a.checkpoint_id, b.checkpoint_id, c.checkpoint_id), (1, 2, 3));
        assert_eq!(c.level, CheckpointLevel::Validation);
        assert_eq!(m.get_checkpoint_count(), 3);
    }

    #[test]
    fn checkpoints_hold_copies() {
        let m = manager();
        let mut ctx = ExecutionContext::new();
        ctx.complete_step("step1", StepOutput::new(serde_json::json!([])));
        m.create_step_checkpoint(ctx.progress(), "step2");

        ctx.complete_step("step2", StepOutput::new(serde_json::json!([])));
        ctx.fail_step("step3");

        let latest = m.get_latest_checkpoint().unwrap();
        assert_eq!(latest.completed_step_ids, vec!["step1"]);
        assert!(latest.failed_step_ids.is_empty());
    }

    #[test]
    fn checkpoint_before_skips_same_trigger() {
        let m = manager();
        let ctx = ExecutionContext::new();
        m.create_step_checkpoint(ctx.progress(), "step1");
        m.create_step_checkpoint(ctx.progress(), "step2");
        m.create_step_checkpoint(ctx.progress(), "step3");
        m.create_step_checkpoint(ctx.progress(), "step3");

        let before = m.get_checkpoint_before("step3").unwrap();
        assert_eq!(before.trigger_step_id.as_deref(), Some("step2"));
        assert_eq!(before.checkpoint_id, 2);
        assert!(manager().get_checkpoint_before("step1").is_none());
    }

    #[test]
    fn clear_empties_ledger() {
        let m = manager();
        let ctx = ExecutionContext::new();
        m.create_step_checkpoint(ctx.progress(), "step1");
        m.clear();

        assert_eq!(m.get_checkpoint_count(), 0);
        assert!(m.get_latest_checkpoint().is_none());
        assert_eq!(m.create_step_checkpoint(ctx.progress(), "step2").checkpoint_id, 2);
    }
}
