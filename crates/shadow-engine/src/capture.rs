//! Failure snapshot capture
//!
//! Builds the metadata-only [`FailureSnapshot`] for a failed step and
//! persists it. Error messages are sanitised first: inline JSON fragments
//! and e-mail addresses are redacted and the result is truncated.

use crate::config::CaptureConfig;
use crate::store::ResilienceStore;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use shadow_types::{
    ExecutionScope, FailureClassification, FailureSnapshot, ProgressSnapshot, SnapshotId,
    StepDefinition, StepError,
};
use std::sync::Arc;

static JSON_FRAGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{[^{}]*"[^{}]*\}|\[[^\[\]]*[{"][^\[\]]*\]"#).expect("valid regex"));

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
});

const REDACTED_DATA: &str = "[data]";
const REDACTED_EMAIL: &str = "[email]";

/// Outcome of one capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotId>,
    pub persisted: bool,
    pub sanitized_message: String,
}

pub struct FailureCapture {
    store: Arc<dyn ResilienceStore>,
    config: CaptureConfig,
}

impl FailureCapture {
    /// Create capture service
    pub fn new(store: Arc<dyn ResilienceStore>, config: CaptureConfig) -> Self {
        Self { store, config }
    }

    /// Persist a snapshot of the failure. Never fails; a store error is
    /// reported through `persisted = false`.
    pub async fn capture(
        &self,
        scope: &ExecutionScope,
        step: &StepDefinition,
        error: &StepError,
        classification: &FailureClassification,
        progress: &ProgressSnapshot,
        retry_count: u32,
    ) -> CaptureResult {
        let sanitized_message = sanitize_message(&error.message, self.config.max_error_message_len);
        let now = Utc::now();

        let mut failed_step_ids = progress.failed_step_ids.clone();
        if !failed_step_ids.iter().any(|id| *id == step.id) {
            failed_step_ids.push(step.id.clone());
        }

        let snapshot = FailureSnapshot {
            id: SnapshotId::new(),
            execution_id: scope.execution_id.clone(),
            agent_id: scope.agent_id.clone(),
            user_id: scope.user_id.clone(),
            failed_step_id: step.id.clone(),
            failed_step_name: step.name.clone(),
            failed_step_type: step.step_type.clone(),
            failure_category: classification.category,
            failure_sub_type: classification.sub_type,
            severity: classification.severity,
            is_auto_retryable: classification.is_auto_retryable,
            error_message: sanitized_message.clone(),
            completed_step_ids: progress.completed_step_ids.clone(),
            failed_step_ids,
            retry_count,
            tokens_before_failure: progress.tokens_used,
            time_before_failure_ms: progress.execution_time_ms,
            failed_at: now,
            created_at: now,
        };

        match self.store.insert_failure_snapshot(snapshot).await {
            Ok(id) => {
                tracing::debug!(
                    "Captured failure snapshot {} for step {} ({})",
                    id,
                    step.id,
                    classification
                );
                CaptureResult {
                    snapshot_id: Some(id),
                    persisted: true,
                    sanitized_message,
                }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to persist failure snapshot for execution {} step {}: {}",
                    scope.execution_id,
                    step.id,
                    e
                );
                CaptureResult {
                    snapshot_id: None,
                    persisted: false,
                    sanitized_message,
                }
            }
        }
    }
}

impl std::fmt::Debug for FailureCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureCapture")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Redact payload fragments and addresses, then keep at most `max_len` chars
#[must_use]
pub fn sanitize_message(message: &str, max_len: usize) -> String {
    let without_json = JSON_FRAGMENT.replace_all(message, REDACTED_DATA);
    let redacted = EMAIL.replace_all(&without_json, REDACTED_EMAIL);
    truncate_chars(&redacted, max_len).to_string()
}

fn truncate_chars(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{InMemoryStore, MockResilienceStore};
    use shadow_types::{ContextAccess, ExecutionContext, FailureCategory, Severity, StepOutput};

    fn scope() -> ExecutionScope {
        ExecutionScope::new("exec-1", "agent-1", "user-1")
    }

    fn classification() -> FailureClassification {
        FailureClassification::new(FailureCategory::DataShapeMismatch, Severity::High)
    }

    #[test]
    fn redacts_json_fragments() {
        let msg = r#"Invalid input {"name": "Ada", "salary": 100} for step"#;
        assert_eq!(sanitize_message(msg, 1000), "Invalid input [data] for step");

        let msg = r#"got [{"id": 1}] instead"#;
        assert_eq!(sanitize_message(msg, 1000), "got [data] instead");
    }

    #[test]
    fn keeps_plain_brackets() {
        let msg = "expected array [] but received object";
        assert_eq!(sanitize_message(msg, 1000), msg);
    }

    #[test]
    fn redacts_email_addresses() {
        let msg = "Mailbox ada.lovelace@example.com rejected the message";
        assert_eq!(
            sanitize_message(msg, 1000),
            "Mailbox [email] rejected the message"
        );
    }

    #[test]
    fn truncates_by_chars() {
        let msg = "é".repeat(10);
        assert_eq!(sanitize_message(&msg, 5), "ééééé");
        assert_eq!(sanitize_message(&"x".repeat(2000), 1000).len(), 1000);

        let out = sanitize_message(&"é".repeat(1200), 1000);
        assert_eq!(out.chars().count(), 1000);
        assert_eq!(out.len(), 2000);
        assert_eq!(sanitize_message("short", 1000), "short");
    }

    #[tokio::test]
    async fn capture_persists_metadata_only_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let capture = FailureCapture::new(store.clone(), CaptureConfig::default());

        let mut ctx = ExecutionContext::new();
        ctx.complete_step("step1", StepOutput::new(serde_json::json!([{"secret": 1}])));
        ctx.add_usage(120, 450);
        let step = StepDefinition::new("step2", "Transform").with_type("transform");

        let result = capture
            .capture(
                &scope(),
                &step,
                &StepError::new(r#"expected array, got {"secret": 1}"#),
                &classification(),
                &ctx.progress(),
                1,
            )
            .await;

        assert!(result.persisted);
        assert_eq!(result.sanitized_message, "expected array, got [data]");

        let rows = store.snapshots_for(&scope().execution_id);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(Some(row.id), result.snapshot_id);
        assert_eq!(row.completed_step_ids, vec!["step1"]);
        assert_eq!(row.failed_step_ids, vec!["step2"]);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.tokens_before_failure, 120);
        assert_eq!(row.time_before_failure_ms, 450);
        assert_eq!(row.failed_step_type.as_deref(), Some("transform"));
    }

    #[tokio::test]
    async fn store_failure_is_reported_not_raised() {
        let mut store = MockResilienceStore::new();
        store
            .expect_insert_failure_snapshot()
            .times(1)
            .returning(|_| Err(StoreError::Backend("disk full".into())));
        let capture = FailureCapture::new(Arc::new(store), CaptureConfig::default());

        let result = capture
            .capture(
                &scope(),
                &StepDefinition::new("step2", "Transform"),
                &StepError::new("expected array"),
                &classification(),
                &ProgressSnapshot::default(),
                0,
            )
            .await;

        assert!(!result.persisted);
        assert!(result.snapshot_id.is_none());
        assert_eq!(result.sanitized_message, "expected array");
    }
}
