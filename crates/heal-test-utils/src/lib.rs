//! Testing utilities for the self-heal workspace
//!
//! Scripted collaborator fakes that record every call, event fixtures, and
//! helpers for waiting on completions.

#![allow(missing_docs)]

use async_trait::async_trait;
use heal_core::{
    ApplyService, Diagnosis, DiagnosisService, FailureContext, GuardrailCheck, GuardrailService,
    HealCompletion, HealOutcome, HealingServices, Patch, PatchService, ServiceError,
    VerificationService,
};
use heal_events::{CorrelationId, Event, EventType, Subscription};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const SAMPLE_FILE: &str = "services/catalog_sync.py";
pub const SAMPLE_SOURCE: &str = "POLICY_FIELDS = [\"price\", \"inventory\", \"category\"]\n";
pub const PATCHED_SOURCE: &str =
    "POLICY_FIELDS = [\"price\", \"inventory\", \"category\", \"return_policy\"]\n";

/// Scripted response of a fake collaborator
#[derive(Debug, Clone)]
pub enum Behavior<T> {
    Return(T),
    Fail(ServiceError),
    /// Return after a delay
    Delay(Duration, T),
    /// Never return
    Hang,
    Panic(&'static str),
}

impl<T: Clone> Behavior<T> {
    async fn run(self) -> Result<T, ServiceError> {
        match self {
            Behavior::Return(value) => Ok(value),
            Behavior::Fail(err) => Err(err),
            Behavior::Delay(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::Panic(message) => panic!("{message}"),
        }
    }
}

pub fn sample_failure() -> FailureContext {
    FailureContext {
        endpoint: Some("CheckReturnEligibility".into()),
        sku: Some("SKU-1001".into()),
        order_id: Some("ORD-1".into()),
        error_type: Some("SchemaMismatch".into()),
        field: Some("return_policy".into()),
        detail: Some("return_policy field missing from catalog sync".into()),
        file: Some(SAMPLE_FILE.into()),
        ..FailureContext::default()
    }
}

pub fn sample_diagnosis() -> Diagnosis {
    Diagnosis::new(
        "OutOfDateCatalogPolicy",
        "catalog sync does not include return_policy in POLICY_FIELDS",
    )
    .with_patch_spec(json!({
        "file": SAMPLE_FILE,
        "anchor": "POLICY_FIELDS",
        "change": "+ 'return_policy'",
        "type": "add_field",
        "field": "return_policy"
    }))
    .with_scores(0.15, 0.85)
}

pub fn sample_patch() -> Patch {
    Patch::new(SAMPLE_FILE, SAMPLE_SOURCE, PATCHED_SOURCE)
}

pub fn passing_outcome() -> HealOutcome {
    HealOutcome::pass(
        12,
        json!({ "return_policy": null }),
        json!({ "return_policy": "FINAL_SALE_NO_RETURNS" }),
    )
}

pub fn failure_event(id: &str) -> Event {
    Event::for_correlation(EventType::SchemaMismatch, id, sample_failure().to_payload())
        .with_ui_hint("schema_error")
}

pub fn return_failure_event(id: &str) -> Event {
    Event::for_correlation(EventType::ReturnApiFailure, id, sample_failure().to_payload())
}

pub fn diagnosis_event(id: &str, diagnosis: &Diagnosis) -> Event {
    Event::for_correlation(EventType::DiagnosisReady, id, diagnosis.to_payload())
        .with_ui_hint("rca_complete")
}

#[derive(Debug)]
pub struct FakeDiagnosis {
    behavior: Mutex<Behavior<Option<Diagnosis>>>,
    calls: Mutex<Vec<(CorrelationId, FailureContext)>>,
}

impl FakeDiagnosis {
    pub fn new(behavior: Behavior<Option<Diagnosis>>) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, behavior: Behavior<Option<Diagnosis>>) {
        *self.behavior.lock() = behavior;
    }

    pub fn calls(&self) -> Vec<(CorrelationId, FailureContext)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for FakeDiagnosis {
    fn default() -> Self {
        Self::new(Behavior::Return(Some(sample_diagnosis())))
    }
}

#[async_trait]
impl DiagnosisService for FakeDiagnosis {
    async fn analyze(
        &self,
        failure: &FailureContext,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Diagnosis>, ServiceError> {
        self.calls.lock().push((correlation_id.clone(), failure.clone()));
        let behavior = self.behavior.lock().clone();
        behavior.run().await
    }
}

#[derive(Debug)]
pub struct FakePatch {
    behavior: Mutex<Behavior<Option<Patch>>>,
    calls: Mutex<Vec<(CorrelationId, String)>>,
}

impl FakePatch {
    pub fn new(behavior: Behavior<Option<Patch>>) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, behavior: Behavior<Option<Patch>>) {
        *self.behavior.lock() = behavior;
    }

    /// (correlation id, source text) per call
    pub fn calls(&self) -> Vec<(CorrelationId, String)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for FakePatch {
    fn default() -> Self {
        Self::new(Behavior::Return(Some(sample_patch())))
    }
}

#[async_trait]
impl PatchService for FakePatch {
    async fn generate(
        &self,
        _diagnosis: &Diagnosis,
        source_text: &str,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Patch>, ServiceError> {
        self.calls
            .lock()
            .push((correlation_id.clone(), source_text.to_string()));
        let behavior = self.behavior.lock().clone();
        behavior.run().await
    }
}

#[derive(Debug)]
pub struct FakeGuardrails {
    behavior: Mutex<Behavior<Vec<GuardrailCheck>>>,
    calls: Mutex<Vec<Patch>>,
}

impl FakeGuardrails {
    pub fn new(behavior: Behavior<Vec<GuardrailCheck>>) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Guardrails that reject with one failing check of the given risk
    pub fn rejecting(rule: &str, risk: f64) -> Self {
        Self::new(Behavior::Return(vec![
            GuardrailCheck::pass("file_allowlist", "file is allowlisted"),
            GuardrailCheck::fail(rule, "rejected by test", risk),
        ]))
    }

    pub fn set(&self, behavior: Behavior<Vec<GuardrailCheck>>) {
        *self.behavior.lock() = behavior;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for FakeGuardrails {
    fn default() -> Self {
        Self::new(Behavior::Return(vec![
            GuardrailCheck::pass("file_allowlist", "file is allowlisted"),
            GuardrailCheck::pass("patch_size", "patch is small"),
        ]))
    }
}

#[async_trait]
impl GuardrailService for FakeGuardrails {
    async fn validate(&self, patch: &Patch) -> Result<Vec<GuardrailCheck>, ServiceError> {
        self.calls.lock().push(patch.clone());
        let behavior = self.behavior.lock().clone();
        behavior.run().await
    }
}

#[derive(Debug)]
pub struct FakeApplier {
    sources: Mutex<HashMap<String, String>>,
    apply_behavior: Mutex<Behavior<bool>>,
    rollback_behavior: Mutex<Behavior<bool>>,
    applies: Mutex<Vec<(String, CorrelationId)>>,
    rollbacks: Mutex<Vec<(String, CorrelationId)>>,
    reads: Mutex<Vec<String>>,
}

impl FakeApplier {
    pub fn new() -> Self {
        let mut sources = HashMap::new();
        sources.insert(SAMPLE_FILE.to_string(), SAMPLE_SOURCE.to_string());
        Self {
            sources: Mutex::new(sources),
            apply_behavior: Mutex::new(Behavior::Return(true)),
            rollback_behavior: Mutex::new(Behavior::Return(true)),
            applies: Mutex::new(Vec::new()),
            rollbacks: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
        }
    }

    pub fn set_apply(&self, behavior: Behavior<bool>) {
        *self.apply_behavior.lock() = behavior;
    }

    pub fn set_rollback(&self, behavior: Behavior<bool>) {
        *self.rollback_behavior.lock() = behavior;
    }

    pub fn remove_source(&self, path: &str) {
        self.sources.lock().remove(path);
    }

    /// (file, correlation id) per apply call
    pub fn applies(&self) -> Vec<(String, CorrelationId)> {
        self.applies.lock().clone()
    }

    /// (file, correlation id) per rollback call
    pub fn rollbacks(&self) -> Vec<(String, CorrelationId)> {
        self.rollbacks.lock().clone()
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().clone()
    }
}

impl Default for FakeApplier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApplyService for FakeApplier {
    async fn apply(&self, patch: &Patch, correlation_id: &CorrelationId) -> Result<bool, ServiceError> {
        self.applies
            .lock()
            .push((patch.target_file.clone(), correlation_id.clone()));
        let behavior = self.apply_behavior.lock().clone();
        behavior.run().await
    }

    async fn read_source(&self, path: &str) -> Result<String, ServiceError> {
        self.reads.lock().push(path.to_string());
        self.sources
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(path.to_string()))
    }

    async fn rollback(&self, path: &str, correlation_id: &CorrelationId) -> Result<bool, ServiceError> {
        self.rollbacks
            .lock()
            .push((path.to_string(), correlation_id.clone()));
        let behavior = self.rollback_behavior.lock().clone();
        behavior.run().await
    }
}

#[derive(Debug)]
pub struct FakeVerifier {
    behavior: Mutex<Behavior<Option<HealOutcome>>>,
    calls: Mutex<Vec<(CorrelationId, FailureContext)>>,
}

impl FakeVerifier {
    pub fn new(behavior: Behavior<Option<HealOutcome>>) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, behavior: Behavior<Option<HealOutcome>>) {
        *self.behavior.lock() = behavior;
    }

    /// (correlation id, verification context) per call
    pub fn calls(&self) -> Vec<(CorrelationId, FailureContext)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for FakeVerifier {
    fn default() -> Self {
        Self::new(Behavior::Return(Some(passing_outcome())))
    }
}

#[async_trait]
impl VerificationService for FakeVerifier {
    async fn verify(
        &self,
        correlation_id: &CorrelationId,
        failure: &FailureContext,
    ) -> Result<Option<HealOutcome>, ServiceError> {
        self.calls.lock().push((correlation_id.clone(), failure.clone()));
        let behavior = self.behavior.lock().clone();
        behavior.run().await
    }
}

/// Every fake, shared with the coordinator under test
#[derive(Debug, Clone, Default)]
pub struct Fakes {
    pub diagnosis: Arc<FakeDiagnosis>,
    pub patch: Arc<FakePatch>,
    pub guardrails: Arc<FakeGuardrails>,
    pub applier: Arc<FakeApplier>,
    pub verifier: Arc<FakeVerifier>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> HealingServices {
        HealingServices::new(
            self.diagnosis.clone(),
            self.patch.clone(),
            self.guardrails.clone(),
            self.applier.clone(),
            self.verifier.clone(),
        )
    }
}

/// Collect `count` completions, failing the test after `timeout`
pub async fn wait_for_completions(
    subscription: &mut Subscription,
    count: usize,
    timeout: Duration,
) -> Vec<(CorrelationId, HealCompletion)> {
    let mut completions = Vec::with_capacity(count);
    let collect = async {
        while completions.len() < count {
            let Some(event) = subscription.recv().await else {
                break;
            };
            if event.event_type != EventType::HealCompleted {
                continue;
            }
            let id = event.correlation_id().cloned().expect("completion carries id");
            let completion = HealCompletion::from_event(&event).expect("valid completion payload");
            completions.push((id, completion));
        }
    };
    if tokio::time::timeout(timeout, collect).await.is_err() {
        panic!(
            "expected {count} completions within {timeout:?}, got {}",
            completions.len()
        );
    }
    completions
}

/// Drain every event already delivered, waiting `quiet` for stragglers
pub async fn drain(subscription: &mut Subscription, quiet: Duration) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(quiet, subscription.recv()).await {
        events.push(event);
    }
    events
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
