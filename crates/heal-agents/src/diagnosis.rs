//! Diagnosis agents
//!
//! Provides:
//! - Rule-based root-cause analysis over known playbooks
//! - A fallback wrapper that answers when the primary errors or stalls
//! - An autonomous watcher that diagnoses failures straight off the bus

use crate::catalog::{CATALOG_SYNC_FILE, REQUIRED_FIELD};
use async_trait::async_trait;
use heal_core::{Diagnosis, DiagnosisService, FailureContext, ServiceError};
use heal_events::{CorrelationId, Event, EventBus, EventFilter, EventType, Subscription};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Confidence reported for every playbook match
pub const PLAYBOOK_CONFIDENCE: f64 = 0.85;

/// Upper bound of a rule-based risk score
pub const MAX_RULE_RISK: f64 = 0.5;

/// Known remediation strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playbook {
    /// Catalog sync no longer copies `return_policy`
    OutOfDateCatalogPolicy,
    /// Response missing some other required field
    SchemaMismatch,
    /// Downstream call exceeded its timeout
    TimeoutError,
}

impl Playbook {
    /// Playbook name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Playbook::OutOfDateCatalogPolicy => "OutOfDateCatalogPolicy",
            Playbook::SchemaMismatch => "SchemaMismatch",
            Playbook::TimeoutError => "TimeoutError",
        }
    }

    /// Match a failure against the known playbooks
    #[must_use]
    pub fn matching(failure: &FailureContext) -> Option<Self> {
        let schema_mismatch = failure.error_type.as_deref() == Some("SchemaMismatch");
        if schema_mismatch && failure.field.as_deref() == Some(REQUIRED_FIELD) {
            Some(Playbook::OutOfDateCatalogPolicy)
        } else if schema_mismatch {
            Some(Playbook::SchemaMismatch)
        } else if failure
            .detail
            .as_deref()
            .is_some_and(|detail| detail.to_lowercase().contains("timeout"))
        {
            Some(Playbook::TimeoutError)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Playbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk of an edit: lower is safer
///
/// Base 0.1, plus file risk (catalog sync 0.05, handlers 0.1, else 0.3),
/// plus change risk (`add_field` 0.05, `add_default` 0.1, else 0.2),
/// capped at [`MAX_RULE_RISK`].
#[must_use]
pub fn risk_score(file: &str, change_type: &str) -> f64 {
    let file_risk: f64 = if file.contains("catalog_sync") {
        0.05
    } else if file.contains("handlers") {
        0.1
    } else {
        0.3
    };
    let change_risk: f64 = match change_type {
        "add_field" => 0.05,
        "add_default" => 0.1,
        _ => 0.2,
    };
    (0.1 + file_risk + change_risk).min(MAX_RULE_RISK)
}

/// Pattern-matching diagnosis over [`Playbook`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedDiagnosis;

impl RuleBasedDiagnosis {
    /// Create new rule-based diagnosis
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Diagnose synchronously; `None` when no playbook matches
    #[must_use]
    pub fn diagnose(&self, failure: &FailureContext) -> Option<Diagnosis> {
        let playbook = Playbook::matching(failure)?;
        let endpoint = failure.endpoint.as_deref().unwrap_or("unknown");
        let field = failure.field.as_deref().unwrap_or("unknown_field");

        let (cause, spec) = match playbook {
            Playbook::OutOfDateCatalogPolicy => (
                format!(
                    "Catalog sync omitted '{REQUIRED_FIELD}' for SKU {}. Field exists in catalog delta but missing from local DB.",
                    failure.sku.as_deref().unwrap_or("unknown")
                ),
                json!({
                    "file": failure.file.as_deref().unwrap_or(CATALOG_SYNC_FILE),
                    "anchor": "POLICY_FIELDS",
                    "change": format!("+ '{REQUIRED_FIELD}'"),
                    "type": "add_field",
                    "field": REQUIRED_FIELD,
                    "target_line_pattern": r"POLICY_FIELDS = \[.*\]"
                }),
            ),
            Playbook::SchemaMismatch => (
                format!("API response validation failed: required field '{field}' is missing or invalid."),
                json!({
                    "file": format!("handlers/{}.py", endpoint.to_lowercase()),
                    "anchor": format!("def {endpoint}"),
                    "change": format!("# Add default for {field}"),
                    "type": "add_default",
                    "field": field
                }),
            ),
            Playbook::TimeoutError => (
                format!("External service call to {endpoint} exceeded timeout threshold."),
                json!({
                    "file": "unknown",
                    "change": "manual_fix_required",
                    "type": "manual"
                }),
            ),
        };

        let file = spec.get("file").and_then(Value::as_str).unwrap_or_default();
        let change_type = spec.get("type").and_then(Value::as_str).unwrap_or_default();
        let risk = risk_score(file, change_type);

        Some(
            Diagnosis::new(playbook.as_str(), cause)
                .with_patch_spec(spec)
                .with_scores(risk, PLAYBOOK_CONFIDENCE),
        )
    }
}

#[async_trait]
impl DiagnosisService for RuleBasedDiagnosis {
    async fn analyze(
        &self,
        failure: &FailureContext,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Diagnosis>, ServiceError> {
        let diagnosis = self.diagnose(failure);
        match &diagnosis {
            Some(diagnosis) => debug!(
                correlation_id = %correlation_id,
                playbook = %diagnosis.playbook,
                risk_score = diagnosis.risk_score,
                "playbook matched"
            ),
            None => debug!(correlation_id = %correlation_id, "no playbook matched"),
        }
        Ok(diagnosis)
    }
}

/// Primary diagnosis with a fallback for errors and stalls
pub struct FallbackDiagnosis {
    primary: Arc<dyn DiagnosisService>,
    fallback: Arc<dyn DiagnosisService>,
    primary_timeout: Duration,
}

impl FallbackDiagnosis {
    /// Create new fallback wrapper
    #[must_use]
    pub fn new(primary: Arc<dyn DiagnosisService>, fallback: Arc<dyn DiagnosisService>) -> Self {
        Self {
            primary,
            fallback,
            primary_timeout: Duration::from_secs(10),
        }
    }

    /// With primary timeout
    #[inline]
    #[must_use]
    pub fn with_primary_timeout(mut self, timeout: Duration) -> Self {
        self.primary_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for FallbackDiagnosis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackDiagnosis")
            .field("primary_timeout", &self.primary_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DiagnosisService for FallbackDiagnosis {
    async fn analyze(
        &self,
        failure: &FailureContext,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Diagnosis>, ServiceError> {
        match tokio::time::timeout(self.primary_timeout, self.primary.analyze(failure, correlation_id)).await {
            Ok(Ok(diagnosis)) => return Ok(diagnosis),
            Ok(Err(err)) => {
                warn!(correlation_id = %correlation_id, error = %err, "primary diagnosis failed; using fallback");
            }
            Err(_) => {
                warn!(
                    correlation_id = %correlation_id,
                    timeout = ?self.primary_timeout,
                    "primary diagnosis timed out; using fallback"
                );
            }
        }
        self.fallback.analyze(failure, correlation_id).await
    }
}

/// Autonomous diagnosis agent
///
/// Subscribes to failure events and publishes `rca.ready` for each one it
/// can diagnose. Pair with a coordinator in await-event mode.
pub struct DiagnosisWatcher {
    bus: Arc<dyn EventBus>,
    diagnosis: Arc<dyn DiagnosisService>,
}

impl DiagnosisWatcher {
    /// Create new watcher
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, diagnosis: Arc<dyn DiagnosisService>) -> Self {
        Self { bus, diagnosis }
    }

    /// Subscribe and run until the bus closes
    ///
    /// The subscription exists before this returns.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        let subscription = self.bus.subscribe(EventFilter::failures());
        info!("diagnosis watcher started");
        tokio::spawn(self.run(subscription))
    }

    async fn run(self, mut subscription: Subscription) {
        while let Some(event) = subscription.recv().await {
            self.handle(&event).await;
        }
        debug!("diagnosis watcher stopped");
    }

    /// Diagnose one failure event, publishing the result
    pub async fn handle(&self, event: &Event) -> Option<Diagnosis> {
        let id = event.correlation_id()?.clone();
        let failure = match FailureContext::from_payload(&event.payload) {
            Ok(failure) => failure,
            Err(err) => {
                warn!(correlation_id = %id, error = %err, "malformed failure payload skipped");
                return None;
            }
        };

        let diagnosis = match self.diagnosis.analyze(&failure, &id).await {
            Ok(Some(diagnosis)) => diagnosis,
            Ok(None) => {
                debug!(correlation_id = %id, "failure left undiagnosed");
                return None;
            }
            Err(err) => {
                warn!(correlation_id = %id, error = %err, "diagnosis failed");
                return None;
            }
        };

        let ready = Event::for_correlation(EventType::DiagnosisReady, &id, diagnosis.to_payload())
            .with_ui_hint("rca_complete");
        if let Err(err) = self.bus.publish(ready).await {
            warn!(correlation_id = %id, error = %err, "failed to publish diagnosis");
        }
        Some(diagnosis)
    }
}

impl std::fmt::Debug for DiagnosisWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosisWatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heal_events::InMemoryEventBus;
    use heal_test_utils::{failure_event, sample_failure, Behavior, FakeDiagnosis};
    use pretty_assertions::assert_eq;

    #[test]
    fn return_policy_mismatch_is_out_of_date_catalog() {
        let diagnosis = RuleBasedDiagnosis::new().diagnose(&sample_failure()).unwrap();

        assert_eq!(diagnosis.playbook, "OutOfDateCatalogPolicy");
        assert!(diagnosis.cause.contains("SKU-1001"));
        assert_eq!(diagnosis.target_file(), Some(CATALOG_SYNC_FILE));
        assert_eq!(diagnosis.patch_spec["type"], json!("add_field"));
        assert_eq!(diagnosis.patch_spec["field"], json!("return_policy"));
        assert!((diagnosis.risk_score - 0.2).abs() < 1e-9);
        assert!((diagnosis.confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn other_schema_mismatch_adds_default_in_handler() {
        let failure = sample_failure().with_field("warranty");
        let diagnosis = RuleBasedDiagnosis::new().diagnose(&failure).unwrap();

        assert_eq!(diagnosis.playbook, "SchemaMismatch");
        assert_eq!(diagnosis.target_file(), Some("handlers/checkreturneligibility.py"));
        assert_eq!(diagnosis.patch_spec["anchor"], json!("def CheckReturnEligibility"));
        assert!((diagnosis.risk_score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn timeouts_and_unknown_failures() {
        let timeout = FailureContext {
            error_type: Some("UpstreamError".into()),
            detail: Some("Request TIMEOUT after 30s".into()),
            ..FailureContext::default()
        };
        let diagnosis = RuleBasedDiagnosis::new().diagnose(&timeout).unwrap();
        assert_eq!(diagnosis.playbook, "TimeoutError");
        assert!((diagnosis.risk_score - MAX_RULE_RISK).abs() < 1e-9);

        assert!(RuleBasedDiagnosis::new().diagnose(&FailureContext::default()).is_none());
    }

    #[test]
    fn risk_is_capped() {
        assert!((risk_score("services/catalog_sync.py", "add_field") - 0.2).abs() < 1e-9);
        assert!((risk_score("handlers/x.py", "add_default") - 0.3).abs() < 1e-9);
        assert!((risk_score("lib/x.py", "rewrite") - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fallback_answers_when_primary_fails() {
        let primary = Arc::new(FakeDiagnosis::new(Behavior::Fail(ServiceError::Unavailable("llm".into()))));
        let service = FallbackDiagnosis::new(primary.clone(), Arc::new(RuleBasedDiagnosis::new()));

        let diagnosis = service.analyze(&sample_failure(), &"t1".into()).await.unwrap();
        assert_eq!(diagnosis.unwrap().playbook, "OutOfDateCatalogPolicy");
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_answers_when_primary_stalls() {
        let primary = Arc::new(FakeDiagnosis::new(Behavior::Hang));
        let service = FallbackDiagnosis::new(primary, Arc::new(RuleBasedDiagnosis::new()))
            .with_primary_timeout(Duration::from_secs(2));

        let diagnosis = service.analyze(&sample_failure(), &"t1".into()).await.unwrap();
        assert!(diagnosis.is_some());
    }

    #[tokio::test]
    async fn watcher_publishes_diagnosis_ready() {
        let bus = Arc::new(InMemoryEventBus::default());
        let mut ready = bus.subscribe(EventFilter::types([EventType::DiagnosisReady]));
        let watcher = DiagnosisWatcher::new(bus.clone(), Arc::new(RuleBasedDiagnosis::new())).spawn();

        bus.publish(failure_event("t7")).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), ready.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.correlation_id().unwrap().as_str(), "t7");
        assert_eq!(event.ui_hint.as_deref(), Some("rca_complete"));
        let diagnosis = Diagnosis::from_payload(&event.payload).unwrap();
        assert_eq!(diagnosis.playbook, "OutOfDateCatalogPolicy");

        bus.close();
        watcher.await.unwrap();
    }
}
