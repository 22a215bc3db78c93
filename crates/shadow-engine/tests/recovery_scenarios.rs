//! End-to-end recovery scenarios through the orchestrator

use pretty_assertions::assert_eq;
use serde_json::json;
use shadow_engine::prelude::*;
use shadow_engine::store::InMemoryStore;
use shadow_test_utils::{context_with_outputs, dependent_step, init_tracing, output_data, test_scope};
use shadow_types::{
    BehaviorRule, DataDecision, DataPattern, DecisionStatus, FailureCategory, FailureSubType,
    RepairAction, RuleAction, RuleActionType, RuleId, RuleStatus, Severity, TriggerCondition,
    UserDecision, UserId,
};
use std::time::Duration;

fn orchestrator(store: &Arc<InMemoryStore>) -> ResumeOrchestrator {
    ResumeOrchestrator::new(store.clone(), ResilienceConfig::default())
}

fn contacts_step() -> StepDefinition {
    dependent_step("step7", "Fetch contacts", "hubspot", "step6")
}

fn contacts_output() -> StepOutput {
    StepOutput::new(json!({ "contacts": [] })).with_source("hubspot", "list_contacts")
}

fn no_data_error() -> StepError {
    StepError::new("No data returned from list_contacts").with_code("NO_DATA")
}

#[tokio::test]
async fn transform_input_is_repaired_and_retried() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let o = orchestrator(&store);
    let scope = test_scope("exec-transform");
    o.begin_execution(scope.clone()).await;

    let mut ctx = context_with_outputs(&[
        ("step1", json!({ "query": "in:inbox" })),
        ("step2", json!({ "emails": [{ "id": 1 }], "totalEmails": 1 })),
    ]);
    let step = dependent_step("step3", "Summarize emails", "transform", "step2");
    let error = StepError::new("expected array").with_code("INVALID_TRANSFORM_INPUT");

    let decision = o
        .handle_step_failure(&scope.execution_id, &step, &error, &mut ctx, None)
        .await;

    assert_eq!(decision.action, ResumeAction::RetryStep);
    assert_eq!(decision.classification.category, FailureCategory::DataShapeMismatch);
    assert_eq!(decision.classification.sub_type, Some(FailureSubType::TransformInput));
    assert_eq!(decision.classification.severity, Severity::High);

    let repair = decision.repair.expect("repair result");
    assert_eq!(repair.proposal.action, RepairAction::ExtractSingleArray);
    assert_eq!(repair.proposal.extract_field.as_deref(), Some("emails"));
    assert_eq!(repair.proposal.target_step_id, "step2");
    assert!(repair.applied && repair.data_modified);
    assert_eq!(repair.repaired_item_count, Some(1));

    assert_eq!(output_data(&ctx, "step2"), json!([{ "id": 1 }]));
    assert_eq!(o.repair_count(&scope.execution_id), Some(1));
    // step checkpoint plus validation checkpoint after the repair
    assert_eq!(o.checkpoint_count(&scope.execution_id), Some(2));
    assert_eq!(store.snapshot_count(), 1);
}

#[tokio::test]
async fn missing_spreadsheet_is_a_parameter_error() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let o = orchestrator(&store);
    let scope = test_scope("exec-sheets");
    o.begin_execution(scope.clone()).await;

    let mut ctx = context_with_outputs(&[("step4", json!([{ "row": 1 }]))]);
    let step = dependent_step("step5", "Append rows", "google_sheets", "step4");
    let error = StepError::new("Spreadsheet 'abc123' not found");

    let decision = o
        .handle_step_failure(&scope.execution_id, &step, &error, &mut ctx, None)
        .await;

    assert_eq!(decision.action, ResumeAction::StopExecution);
    assert_eq!(decision.classification.category, FailureCategory::ExecutionError);
    assert_ne!(decision.classification.sub_type, Some(FailureSubType::Auth));
    assert!(!decision.classification.is_auto_retryable);

    let parameter_error = decision.parameter_error.expect("parameter error");
    assert_eq!(parameter_error.parameter_name, "spreadsheet_id");
    assert_eq!(parameter_error.problematic_value, "abc123");

    let cached = &ctx.step_outputs["step5"];
    assert_eq!(cached.metadata.parameter_error.as_ref(), Some(&parameter_error));
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_and_stops() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let o = orchestrator(&store);
    let scope = test_scope("exec-contacts");
    o.begin_execution(scope.clone()).await;

    let mut ctx = context_with_outputs(&[("step6", json!({ "list": "newsletter" }))]);
    let output = contacts_output();
    let started = tokio::time::Instant::now();

    let decision = o
        .handle_step_failure(
            &scope.execution_id,
            &contacts_step(),
            &no_data_error(),
            &mut ctx,
            Some(&output),
        )
        .await;

    assert!(started.elapsed() >= Duration::from_secs(600));
    assert_eq!(decision.action, ResumeAction::StopExecution);
    assert_eq!(decision.classification.category, FailureCategory::DataUnavailable);
    assert!(!decision.rule_applied);

    let request_id = decision.request_id.expect("decision request");
    let request = store
        .get_decision_request(request_id)
        .await
        .unwrap()
        .expect("request row");
    assert_eq!(request.status, DecisionStatus::Timeout);
    assert_eq!(request.decision_context.data_field, "contacts");
    assert_eq!(request.decision_context.operator, "is_empty");
    assert_eq!(request.decision_context.plugin.as_deref(), Some("hubspot"));

    // terminal transition already taken
    assert!(!store.mark_decision_timeout(request_id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn matching_rule_applies_without_pause() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let rule_id = store
        .insert_behavior_rule(BehaviorRule {
            id: RuleId::new(),
            user_id: UserId::from("user-1"),
            agent_id: None,
            rule_type: RuleActionType::SkipOnEmpty,
            trigger_condition: TriggerCondition {
                step_name: None,
                data_pattern: DataPattern {
                    field: "contacts".into(),
                    operator: "is_empty".into(),
                },
            },
            action: RuleAction {
                action_type: RuleActionType::SkipOnEmpty,
                params: json!({ "decision": "skip" }),
            },
            status: RuleStatus::Active,
            applied_count: 0,
            last_applied_at: None,
            created_from_decision_id: None,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let o = orchestrator(&store);
    let scope = test_scope("exec-rule");
    o.begin_execution(scope.clone()).await;
    let mut ctx = context_with_outputs(&[("step6", json!({ "list": "newsletter" }))]);
    let output = contacts_output();
    let started = tokio::time::Instant::now();

    let decision = o
        .handle_step_failure(
            &scope.execution_id,
            &contacts_step(),
            &no_data_error(),
            &mut ctx,
            Some(&output),
        )
        .await;

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(decision.action, ResumeAction::SkipStep);
    assert!(decision.rule_applied);
    assert_eq!(decision.rule_id, Some(rule_id));
    assert!(decision.request_id.is_none());
    assert!(store.pending_requests(&scope.execution_id).is_empty());

    tokio::task::yield_now().await;
    assert_eq!(store.rule(rule_id).unwrap().applied_count, 1);
}

#[tokio::test(start_paused = true)]
async fn remembered_answer_is_reused_by_next_run() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let o = orchestrator(&store);

    let first = test_scope("exec-first");
    o.begin_execution(first.clone()).await;
    let responder = {
        let store = store.clone();
        let execution_id = first.execution_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(8)).await;
            let pending = store.pending_requests(&execution_id);
            let answer = UserDecision {
                action: DataDecision::Continue,
                remember: true,
            };
            store
                .respond_to_decision_request(pending[0].id, answer)
                .await
                .unwrap()
        })
    };

    let mut ctx = context_with_outputs(&[("step6", json!({ "list": "newsletter" }))]);
    let output = contacts_output();
    let decision = o
        .handle_step_failure(
            &first.execution_id,
            &contacts_step(),
            &no_data_error(),
            &mut ctx,
            Some(&output),
        )
        .await;
    assert!(responder.await.unwrap());

    assert_eq!(decision.action, ResumeAction::ContinueWithFallback);
    assert!(!decision.rule_applied);
    let fallback = decision.fallback_output.expect("fallback output");
    assert_eq!(fallback.data, json!([]));
    assert_eq!(fallback.metadata.plugin.as_deref(), Some("hubspot"));
    assert_eq!(fallback.metadata.action.as_deref(), Some("list_contacts"));
    let learned = decision.rule_id.expect("learned rule");

    let second = test_scope("exec-second");
    o.begin_execution(second.clone()).await;
    let mut ctx = context_with_outputs(&[("step6", json!({ "list": "newsletter" }))]);
    let started = tokio::time::Instant::now();
    let decision = o
        .handle_step_failure(
            &second.execution_id,
            &contacts_step(),
            &no_data_error(),
            &mut ctx,
            Some(&output),
        )
        .await;

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(decision.action, ResumeAction::ContinueWithFallback);
    assert!(decision.rule_applied);
    assert_eq!(decision.rule_id, Some(learned));
}

#[tokio::test]
async fn repair_budget_is_enforced_per_step() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let o = orchestrator(&store);
    let scope = test_scope("exec-budget");
    o.begin_execution(scope.clone()).await;

    let original = context_with_outputs(&[("step1", json!({ "items": [1, 2, 3], "count": 3 }))]);
    let step = dependent_step("step2", "Loop items", "loop", "step1");
    let error = StepError::new("Input is not iterable");

    let mut actions = Vec::new();
    for _ in 0..3 {
        let mut ctx = original.clone();
        let decision = o
            .handle_step_failure(&scope.execution_id, &step, &error, &mut ctx, None)
            .await;
        actions.push(decision.action);
        if decision.action == ResumeAction::RetryStep {
            assert_eq!(output_data(&ctx, "step1"), json!([1, 2, 3]));
        } else {
            assert!(decision.reason.contains("budget"), "{}", decision.reason);
        }
    }

    assert_eq!(
        actions,
        vec![
            ResumeAction::RetryStep,
            ResumeAction::RetryStep,
            ResumeAction::StopExecution
        ]
    );
    assert_eq!(o.repair_count(&scope.execution_id), Some(2));

    let snapshots = store.snapshots_for(&scope.execution_id);
    let mut retry_counts: Vec<_> = snapshots.iter().map(|s| s.retry_count).collect();
    retry_counts.sort_unstable();
    assert_eq!(retry_counts, vec![0, 1, 2]);
}

#[tokio::test]
async fn repair_failed_in_prior_run_is_not_repeated() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let o = orchestrator(&store);
    let original = context_with_outputs(&[("step1", json!({ "items": [1, 2, 3], "count": 3 }))]);
    let step = dependent_step("step2", "Loop items", "loop", "step1");
    let error = StepError::new("Input is not iterable");

    let first = test_scope("exec-a");
    o.begin_execution(first.clone()).await;
    let mut ctx = original.clone();
    let decision = o
        .handle_step_failure(&first.execution_id, &step, &error, &mut ctx, None)
        .await;
    assert_eq!(decision.action, ResumeAction::RetryStep);
    o.finish_execution(&first.execution_id, ExecutionOutcome::Failed)
        .await;

    let second = test_scope("exec-b");
    o.begin_execution(second.clone()).await;
    let mut ctx = original.clone();
    let decision = o
        .handle_step_failure(&second.execution_id, &step, &error, &mut ctx, None)
        .await;

    assert_eq!(decision.action, ResumeAction::StopExecution);
    assert_eq!(output_data(&ctx, "step1"), json!({ "items": [1, 2, 3], "count": 3 }));
}

#[tokio::test]
async fn irreparable_payload_stops_without_spending_budget() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let o = orchestrator(&store);
    let scope = test_scope("exec-scalar");
    o.begin_execution(scope.clone()).await;

    let mut ctx = context_with_outputs(&[("step1", json!("plain text"))]);
    let step = dependent_step("step2", "Loop", "loop", "step1");
    let decision = o
        .handle_step_failure(
            &scope.execution_id,
            &step,
            &StepError::new("expected array but received string"),
            &mut ctx,
            None,
        )
        .await;

    assert!(decision.is_stop());
    let repair = decision.repair.expect("repair result");
    assert_eq!(repair.proposal.action, RepairAction::None);
    assert!(!repair.applied);
    assert_eq!(o.repair_count(&scope.execution_id), Some(0));
}
