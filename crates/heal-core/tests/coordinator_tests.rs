//! Functional tests for the healing coordinator.
//!
//! These tests drive the Coordinator over the in-memory bus with scripted
//! collaborators and anchor its workflow guarantees:
//! - One record and exactly one heal.completed per correlation id.
//! - Duplicate failure and diagnosis events never start a second pipeline.
//! - Guardrail rejection stops the pipeline before Apply.
//! - Verification failure rolls back exactly once.
//! - Timeouts, panics and shutdown all end in a Failed completion.

use heal_core::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, DiagnosisMode, Dispatch, FailureReason,
    GuardrailCheck, HealCompletion, IgnoreReason, ServiceError, Stage, WorkflowStatus,
};
use heal_events::{CorrelationId, Event, EventBus, EventFilter, EventType, InMemoryEventBus, Subscription};
use heal_test_utils::{
    diagnosis_event, drain, failure_event, return_failure_event, sample_diagnosis, wait_for_completions,
    wait_until, Behavior, FakeGuardrails, Fakes, SAMPLE_FILE,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(100);

struct Harness {
    bus: Arc<InMemoryEventBus>,
    fakes: Fakes,
    coordinator: Coordinator,
    completions: Subscription,
}

/// Helper: coordinator over a fresh bus with default fakes.
fn harness(config: CoordinatorConfig) -> Harness {
    harness_with(config, Fakes::new())
}

fn harness_with(config: CoordinatorConfig, fakes: Fakes) -> Harness {
    let bus = Arc::new(InMemoryEventBus::default());
    let completions = bus.subscribe(EventFilter::types([EventType::HealCompleted]));
    let coordinator = Coordinator::new(config, bus.clone(), fakes.services());
    Harness {
        bus,
        fakes,
        coordinator,
        completions,
    }
}

fn await_mode() -> CoordinatorConfig {
    CoordinatorConfig::new().with_diagnosis_mode(DiagnosisMode::AwaitEvent)
}

async fn single_completion(h: &mut Harness) -> (CorrelationId, HealCompletion) {
    let mut completions = wait_for_completions(&mut h.completions, 1, WAIT).await;
    let extra = drain(&mut h.completions, QUIET).await;
    assert!(extra.is_empty(), "unexpected extra completions: {extra:?}");
    completions.remove(0)
}

async fn started(h: &Harness) -> CoordinatorHandle {
    h.coordinator.start().expect("coordinator starts")
}

/// Tenet: the reference scenario heals end to end through the bus.
///
/// A schema mismatch for `t1` on catalog_sync/return_policy, diagnosed as
/// OutOfDateCatalogPolicy with risk 0.15, yields one Succeeded completion.
#[tokio::test]
async fn end_to_end_success_through_bus() {
    let mut h = harness(CoordinatorConfig::default());
    let handle = started(&h).await;

    h.bus.publish(failure_event("t1")).await.unwrap();

    let (id, completion) = single_completion(&mut h).await;
    assert_eq!(id.as_str(), "t1");
    assert_eq!(completion.status, WorkflowStatus::Succeeded);
    assert_eq!(completion.reason, None);
    assert_eq!(
        completion.stages_involved,
        vec!["diagnosis", "patch_generator", "guardrails", "patch_applier", "verifier"]
    );
    assert!(completion.duration_seconds >= 0.0);

    assert_eq!(h.fakes.applier.applies(), vec![(SAMPLE_FILE.to_string(), id.clone())]);
    assert_eq!(h.fakes.applier.reads(), vec![SAMPLE_FILE.to_string()]);
    assert_eq!(h.fakes.patch.calls()[0].1, heal_test_utils::SAMPLE_SOURCE);
    let (_, context) = &h.fakes.verifier.calls()[0];
    assert_eq!(context.field.as_deref(), Some("return_policy"));
    assert!(h.coordinator.active_workflows().is_empty());

    let report = handle.shutdown().await;
    assert_eq!(report.cancelled, 0);
}

/// Tenet: lifecycle events are published in stage order, ending with the
/// terminal completion carrying the `healing_complete` hint.
#[tokio::test]
async fn lifecycle_events_follow_stage_order() {
    let mut h = harness(CoordinatorConfig::default());
    assert_eq!(h.coordinator.handle_event(return_failure_event("t1")).await, Dispatch::Started);
    single_completion(&mut h).await;

    let history = h.bus.history(&"t1".into()).await;
    let started = history
        .iter()
        .find(|e| e.event_type == EventType::HealStarted)
        .expect("heal.started published");
    assert_eq!(started.payload["trigger"], json!("return_api.failure"));

    let stages: Vec<String> = history
        .iter()
        .filter(|e| e.event_type == EventType::HealProgress)
        .filter_map(|e| e.payload_str("stage").map(str::to_string))
        .collect();
    assert_eq!(
        stages,
        vec!["diagnosing", "generating", "validating", "applying", "verifying"]
    );

    let last = history.last().unwrap();
    assert_eq!(last.event_type, EventType::HealCompleted);
    assert_eq!(last.ui_hint.as_deref(), Some("healing_complete"));
}

/// Tenet: a duplicate failure while a workflow is in progress is a no-op.
#[tokio::test]
async fn duplicate_failure_while_in_progress_is_noop() {
    let mut h = harness(CoordinatorConfig::default());
    h.fakes
        .diagnosis
        .set(Behavior::Delay(Duration::from_millis(200), Some(sample_diagnosis())));

    assert_eq!(h.coordinator.handle_event(failure_event("t1")).await, Dispatch::Started);
    assert_eq!(h.coordinator.active_workflows().len(), 1);
    assert_eq!(
        h.coordinator.handle_event(failure_event("t1")).await,
        Dispatch::Ignored(IgnoreReason::AlreadyInProgress)
    );
    assert_eq!(h.coordinator.active_workflows().len(), 1);

    single_completion(&mut h).await;
    assert_eq!(h.fakes.diagnosis.call_count(), 1);
    assert_eq!(h.fakes.applier.applies().len(), 1);
}

/// Tenet: guardrail rejection is a normal terminal outcome and never
/// invokes Apply or Verify.
#[tokio::test]
async fn guardrail_rejection_skips_apply_and_verify() {
    let fakes = Fakes {
        guardrails: Arc::new(FakeGuardrails::rejecting("no_dangerous_ops", 0.9)),
        ..Fakes::new()
    };
    let mut h = harness_with(CoordinatorConfig::default(), fakes);

    h.coordinator.handle_event(failure_event("t1")).await;
    let (_, completion) = single_completion(&mut h).await;

    assert_eq!(completion.status, WorkflowStatus::Failed);
    assert_eq!(completion.reason, Some(FailureReason::SafetyRejected));
    assert!(completion.message.contains("safety"), "{}", completion.message);
    assert!(h.fakes.applier.applies().is_empty());
    assert_eq!(h.fakes.verifier.call_count(), 0);
    assert_eq!(completion.stages_involved, vec!["diagnosis", "patch_generator", "guardrails"]);
}

/// Tenet: failing checks at or below the threshold do not block a patch.
#[tokio::test]
async fn low_risk_failures_do_not_block() {
    let fakes = Fakes {
        guardrails: Arc::new(FakeGuardrails::rejecting("patch_size", 0.5)),
        ..Fakes::new()
    };
    let mut h = harness_with(CoordinatorConfig::default(), fakes);

    h.coordinator.handle_event(failure_event("t1")).await;
    let (_, completion) = single_completion(&mut h).await;
    assert_eq!(completion.status, WorkflowStatus::Succeeded);
}

/// Tenet: verification failure rolls back exactly once with the same file
/// and correlation id used for apply.
#[tokio::test]
async fn verification_failure_rolls_back_once() {
    let mut h = harness(CoordinatorConfig::default());
    h.fakes.verifier.set(Behavior::Return(Some(heal_core::HealOutcome::fail(
        5,
        json!({}),
        json!({}),
    ))));

    h.coordinator.handle_event(failure_event("t1")).await;
    let (_, completion) = single_completion(&mut h).await;

    assert_eq!(completion.status, WorkflowStatus::Failed);
    assert_eq!(completion.reason, Some(FailureReason::VerificationFailed));
    assert!(completion.message.contains("verification failed"));
    assert_eq!(h.fakes.applier.rollbacks(), h.fakes.applier.applies());
    assert_eq!(h.fakes.applier.rollbacks().len(), 1);
}

/// Tenet: a verification error is treated like a failed replay, and a
/// failing rollback is reported in the completion message.
#[tokio::test]
async fn verification_error_with_failed_rollback_still_completes() {
    let mut h = harness(CoordinatorConfig::default());
    h.fakes
        .verifier
        .set(Behavior::Fail(ServiceError::Unavailable("replay host down".into())));
    h.fakes
        .applier
        .set_rollback(Behavior::Fail(ServiceError::Internal("disk full".into())));

    h.coordinator.handle_event(failure_event("t1")).await;
    let (_, completion) = single_completion(&mut h).await;

    assert_eq!(completion.reason, Some(FailureReason::VerificationFailed));
    assert_eq!(completion.message, "verification failed; rollback failed");
    assert_eq!(h.fakes.applier.rollbacks().len(), 1);
}

/// Tenet: with an autonomous diagnosis watcher, a failure followed by two
/// diagnosis-ready events yields one pipeline, one apply and one completion.
#[tokio::test]
async fn failure_then_two_diagnoses_in_await_mode() {
    let mut h = harness(await_mode());
    let diagnosis = sample_diagnosis();

    assert_eq!(
        h.coordinator.handle_event(failure_event("t1")).await,
        Dispatch::AwaitingDiagnosis
    );
    assert_eq!(
        h.coordinator.workflow(&"t1".into()).unwrap().stage,
        Stage::AwaitingDiagnosis
    );
    assert_eq!(
        h.coordinator.handle_event(diagnosis_event("t1", &diagnosis)).await,
        Dispatch::Resumed
    );
    let second = h.coordinator.handle_event(diagnosis_event("t1", &diagnosis)).await;
    assert!(
        matches!(
            second,
            Dispatch::Absorbed | Dispatch::Ignored(IgnoreReason::RecentlyCompleted)
        ),
        "second diagnosis must not start a pipeline: {second:?}"
    );

    let (_, completion) = single_completion(&mut h).await;
    assert_eq!(completion.status, WorkflowStatus::Succeeded);
    assert_eq!(h.fakes.applier.applies().len(), 1);
    assert_eq!(h.fakes.diagnosis.call_count(), 0);
}

/// Tenet: inline diagnosis and a watcher may both run; the watcher's
/// diagnoses are absorbed instead of duplicating work.
#[tokio::test]
async fn failure_then_two_diagnoses_in_inline_mode() {
    let mut h = harness(CoordinatorConfig::default());
    h.fakes
        .diagnosis
        .set(Behavior::Delay(Duration::from_millis(100), Some(sample_diagnosis())));
    let diagnosis = sample_diagnosis();

    assert_eq!(h.coordinator.handle_event(failure_event("t1")).await, Dispatch::Started);
    assert_eq!(
        h.coordinator.handle_event(diagnosis_event("t1", &diagnosis)).await,
        Dispatch::Absorbed
    );
    assert_eq!(
        h.coordinator.handle_event(diagnosis_event("t1", &diagnosis)).await,
        Dispatch::Absorbed
    );

    single_completion(&mut h).await;
    assert_eq!(h.fakes.applier.applies().len(), 1);
}

/// Tenet: a diagnosis for an unseen id opens the workflow on the fly, and
/// verification recovers the originating failure from bus history.
#[tokio::test]
async fn diagnosis_without_record_recovers_context_from_history() {
    let mut h = harness(await_mode());
    // Published but never dispatched to the coordinator
    h.bus.publish(failure_event("t5")).await.unwrap();

    assert_eq!(
        h.coordinator
            .handle_event(diagnosis_event("t5", &sample_diagnosis()))
            .await,
        Dispatch::Started
    );
    let (_, completion) = single_completion(&mut h).await;

    assert_eq!(completion.status, WorkflowStatus::Succeeded);
    let (id, context) = &h.fakes.verifier.calls()[0];
    assert_eq!(id.as_str(), "t5");
    assert_eq!(context.sku.as_deref(), Some("SKU-1001"));
}

/// Tenet: a workflow that never receives a diagnosis fails after the
/// diagnosis timeout, and late diagnoses are dropped.
#[tokio::test(start_paused = true)]
async fn diagnosis_timeout_fails_waiting_workflow() {
    let mut h = harness(await_mode().with_diagnosis_timeout_secs(5));

    h.coordinator.handle_event(failure_event("t1")).await;
    let mut completions = wait_for_completions(&mut h.completions, 1, Duration::from_secs(60)).await;
    let (_, completion) = completions.remove(0);

    assert_eq!(completion.reason, Some(FailureReason::DiagnosisTimedOut));
    assert!(completion.message.contains("diagnosis timed out"));
    assert!(completion.stages_involved.is_empty());
    assert_eq!(
        h.coordinator
            .handle_event(diagnosis_event("t1", &sample_diagnosis()))
            .await,
        Dispatch::Ignored(IgnoreReason::RecentlyCompleted)
    );
    assert!(h.fakes.applier.applies().is_empty());
}

/// Tenet: every collaborator call is bounded by the stage timeout.
#[tokio::test(start_paused = true)]
async fn hung_collaborator_times_out() {
    let mut h = harness(CoordinatorConfig::new().with_stage_timeout_secs(2));
    h.fakes.patch.set(Behavior::Hang);

    h.coordinator.handle_event(failure_event("t1")).await;
    let mut completions = wait_for_completions(&mut h.completions, 1, Duration::from_secs(60)).await;
    let (_, completion) = completions.remove(0);

    assert_eq!(completion.reason, Some(FailureReason::ServiceUnavailable));
    assert!(completion.message.contains("timed out"), "{}", completion.message);
    assert!(h.fakes.applier.applies().is_empty());
}

/// Tenet: a panicking collaborator fails only its own workflow.
#[tokio::test]
async fn panics_are_contained_at_pipeline_boundary() {
    let mut h = harness(CoordinatorConfig::default());
    h.fakes.patch.set(Behavior::Panic("generator exploded"));

    h.coordinator.handle_event(failure_event("t1")).await;
    let (_, completion) = single_completion(&mut h).await;
    assert_eq!(completion.reason, Some(FailureReason::Panicked));
    assert!(completion.message.contains("generator exploded"));

    h.fakes.patch.set(Behavior::Return(Some(heal_test_utils::sample_patch())));
    h.coordinator.handle_event(failure_event("t2")).await;
    let (id, completion) = single_completion(&mut h).await;
    assert_eq!(id.as_str(), "t2");
    assert_eq!(completion.status, WorkflowStatus::Succeeded);
}

/// Tenet: a panic after Apply compensates by rolling the patch back.
#[tokio::test]
async fn panic_after_apply_rolls_back() {
    let mut h = harness(CoordinatorConfig::default());
    h.fakes.verifier.set(Behavior::Panic("replay crashed"));

    h.coordinator.handle_event(failure_event("t1")).await;
    let (_, completion) = single_completion(&mut h).await;

    assert_eq!(completion.reason, Some(FailureReason::Panicked));
    assert_eq!(h.fakes.applier.rollbacks(), vec![(SAMPLE_FILE.to_string(), CorrelationId::from("t1"))]);
}

/// Tenet: events for a recently completed id cannot start a second workflow.
#[tokio::test]
async fn late_duplicates_are_suppressed() {
    let mut h = harness(CoordinatorConfig::default());
    h.coordinator.handle_event(failure_event("t1")).await;
    single_completion(&mut h).await;

    assert_eq!(
        h.coordinator.handle_event(failure_event("t1")).await,
        Dispatch::Ignored(IgnoreReason::RecentlyCompleted)
    );
    assert_eq!(
        h.coordinator
            .handle_event(diagnosis_event("t1", &sample_diagnosis()))
            .await,
        Dispatch::Ignored(IgnoreReason::RecentlyCompleted)
    );
    assert!(drain(&mut h.completions, QUIET).await.is_empty());
    assert_eq!(h.fakes.diagnosis.call_count(), 1);
}

/// Tenet: each pre-apply failure maps to its own reason and stops early.
#[tokio::test]
async fn pre_apply_failures_stop_the_pipeline() {
    let mut h = harness(CoordinatorConfig::default());

    h.fakes.diagnosis.set(Behavior::Return(None));
    h.coordinator.handle_event(failure_event("no-diagnosis")).await;
    let (_, completion) = single_completion(&mut h).await;
    assert_eq!(completion.reason, Some(FailureReason::DiagnosisFailed));

    h.fakes.diagnosis.set(Behavior::Return(Some(sample_diagnosis())));
    h.fakes.patch.set(Behavior::Return(None));
    h.coordinator.handle_event(failure_event("no-patch")).await;
    let (_, completion) = single_completion(&mut h).await;
    assert_eq!(completion.reason, Some(FailureReason::PatchGenerationFailed));
    assert!(completion.message.contains("patch generation failed"));

    h.fakes.applier.remove_source(SAMPLE_FILE);
    h.coordinator.handle_event(failure_event("no-source")).await;
    let (_, completion) = single_completion(&mut h).await;
    assert_eq!(completion.reason, Some(FailureReason::SourceUnavailable));
    assert_eq!(h.fakes.patch.call_count(), 1);
    assert!(h.fakes.applier.applies().is_empty());
}

/// Tenet: an apply that reports failure is not rolled back or verified.
#[tokio::test]
async fn apply_failure_skips_verification() {
    let mut h = harness(CoordinatorConfig::default());
    h.fakes.applier.set_apply(Behavior::Return(false));

    h.coordinator.handle_event(failure_event("t1")).await;
    let (_, completion) = single_completion(&mut h).await;

    assert_eq!(completion.reason, Some(FailureReason::ApplyFailed));
    assert!(completion.message.contains("patch application failed"));
    assert_eq!(h.fakes.verifier.call_count(), 0);
    assert!(h.fakes.applier.rollbacks().is_empty());
}

/// Tenet: many correlation ids heal concurrently, each exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workflows_complete_exactly_once() {
    let mut h = harness(CoordinatorConfig::default());
    let handle = started(&h).await;

    let ids: Vec<String> = (0..20).map(|i| format!("t{i}")).collect();
    for id in &ids {
        h.bus.publish(failure_event(id)).await.unwrap();
        h.bus.publish(failure_event(id)).await.unwrap();
    }

    let completions = wait_for_completions(&mut h.completions, ids.len(), WAIT).await;
    let mut seen: Vec<String> = completions.iter().map(|(id, _)| id.to_string()).collect();
    seen.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(seen, expected);
    assert!(drain(&mut h.completions, QUIET).await.is_empty());
    assert_eq!(h.fakes.applier.applies().len(), ids.len());
    assert_eq!(h.coordinator.stats().succeeded, 20);

    handle.shutdown().await;
}

/// Tenet: events without a correlation id never open a workflow.
#[tokio::test]
async fn uncorrelated_events_are_dropped() {
    let mut h = harness(CoordinatorConfig::default());
    let handle = started(&h).await;

    h.bus
        .publish(Event::new(EventType::SchemaMismatch, "order_1", json!({})))
        .await
        .unwrap();
    assert!(drain(&mut h.completions, QUIET).await.is_empty());
    assert!(h.coordinator.active_workflows().is_empty());
    assert!(wait_until(|| h.coordinator.stats().ignored == 1, WAIT).await);

    handle.shutdown().await;
}

/// Tenet: shutdown rolls back a workflow caught in Verify and reports it
/// as cancelled.
#[tokio::test(start_paused = true)]
async fn shutdown_rolls_back_in_flight_verification() {
    let mut h = harness(
        CoordinatorConfig::new()
            .with_stage_timeout_secs(600)
            .with_shutdown_grace_secs(1),
    );
    h.fakes.verifier.set(Behavior::Hang);
    let handle = started(&h).await;

    h.bus.publish(failure_event("t1")).await.unwrap();
    let coordinator = h.coordinator.clone();
    assert!(
        wait_until(
            || coordinator.workflow(&"t1".into()).map(|r| r.stage) == Some(Stage::Verifying),
            Duration::from_secs(30),
        )
        .await
    );

    let report = handle.shutdown().await;
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.rolled_back, 1);
    assert_eq!(report.completed, 0);

    let (_, completion) = single_completion(&mut h).await;
    assert_eq!(completion.reason, Some(FailureReason::Cancelled));
    assert_eq!(completion.message, "cancelled during shutdown");
    assert_eq!(h.fakes.applier.rollbacks(), vec![(SAMPLE_FILE.to_string(), CorrelationId::from("t1"))]);
    assert!(!h.coordinator.is_running());
}

/// Tenet: pipelines that have not reached Apply stop at the next stage
/// boundary once shutdown begins.
#[tokio::test(start_paused = true)]
async fn shutdown_stops_pre_apply_pipelines() {
    let mut h = harness(CoordinatorConfig::new().with_shutdown_grace_secs(30));
    h.fakes
        .diagnosis
        .set(Behavior::Delay(Duration::from_secs(5), Some(sample_diagnosis())));
    let handle = started(&h).await;

    h.bus.publish(failure_event("t1")).await.unwrap();
    let coordinator = h.coordinator.clone();
    assert!(wait_until(|| coordinator.workflow(&"t1".into()).is_some(), Duration::from_secs(1)).await);

    let report = handle.shutdown().await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.cancelled, 0);

    let (_, completion) = single_completion(&mut h).await;
    assert_eq!(completion.reason, Some(FailureReason::ShuttingDown));
    assert_eq!(completion.message, "coordinator shutting down");
    assert!(h.fakes.applier.applies().is_empty());

    assert_eq!(
        h.coordinator.handle_event(failure_event("t2")).await,
        Dispatch::Ignored(IgnoreReason::ShuttingDown)
    );
}

/// Tenet: guardrail checks seen by the coordinator reach the completion
/// message by rule name.
#[tokio::test]
async fn rejection_message_names_rules() {
    let mut h = harness(CoordinatorConfig::default());
    h.fakes.guardrails.set(Behavior::Return(vec![
        GuardrailCheck::fail("file_allowlist", "not allowlisted", 0.8),
        GuardrailCheck::fail("no_secrets", "api key", 1.0),
    ]));

    h.coordinator.handle_event(failure_event("t1")).await;
    let (_, completion) = single_completion(&mut h).await;
    assert!(completion.message.contains("file_allowlist"));
    assert!(completion.message.contains("no_secrets"));
}
