//! Replay verifier
//!
//! Re-runs the failing return-eligibility request against the source as it
//! stands after Apply.

use crate::catalog::{check_return_eligibility, sync_product, CATALOG_SYNC_FILE, REQUIRED_FIELD};
use async_trait::async_trait;
use heal_core::{ApplyService, FailureContext, HealOutcome, ServiceError, VerificationService};
use heal_events::{CorrelationId, Event, EventBus, EventType};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Commit reference recorded for a verified heal
#[must_use]
pub fn commit_ref(correlation_id: &CorrelationId) -> String {
    let prefix: String = correlation_id.as_str().chars().take(8).collect();
    format!("selfheal_{prefix}")
}

/// Verifier that replays the return-eligibility check
pub struct ReplayVerifier {
    sources: Arc<dyn ApplyService>,
    bus: Option<Arc<dyn EventBus>>,
}

impl ReplayVerifier {
    /// Create new verifier reading source text through `sources`
    #[must_use]
    pub fn new(sources: Arc<dyn ApplyService>) -> Self {
        Self { sources, bus: None }
    }

    /// With a bus for `verify.replay.*` events
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(event).await {
                warn!(error = %err, "failed to publish replay event");
            }
        }
    }
}

impl std::fmt::Debug for ReplayVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayVerifier")
            .field("publishes", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl VerificationService for ReplayVerifier {
    async fn verify(
        &self,
        correlation_id: &CorrelationId,
        failure: &FailureContext,
    ) -> Result<Option<HealOutcome>, ServiceError> {
        let started = Instant::now();
        let file = failure.file.as_deref().unwrap_or(CATALOG_SYNC_FILE);
        let field = failure.field.as_deref().unwrap_or(REQUIRED_FIELD);
        let sku = failure.sku.as_deref().unwrap_or("unknown");
        let order_id = failure.order_id.as_deref().unwrap_or("unknown");

        let source = self.sources.read_source(file).await?;
        let product = sync_product(&source, sku)
            .map_err(|err| ServiceError::Internal(err.to_string()))?;

        let fixed = product.get(field).is_some_and(|value| !value.is_null());
        let after = if fixed && field == REQUIRED_FIELD {
            check_return_eligibility(&source, sku, order_id)
                .map(|eligibility| eligibility.to_value())
                .unwrap_or_else(|_| Value::Object(product.clone()))
        } else {
            Value::Object(product)
        };
        let mut before = Map::new();
        before.insert(field.to_string(), Value::Null);
        before.insert("error".to_string(), json!(failure.detail));
        let before = Value::Object(before);
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if fixed {
            info!(correlation_id = %correlation_id, %field, latency_ms, "replay passed");
            self.emit(
                Event::for_correlation(
                    EventType::VerifyReplayPass,
                    correlation_id,
                    json!({
                        "replay_latency_ms": latency_ms,
                        "before": before,
                        "after": after,
                        "field_fixed": field,
                    }),
                )
                .with_ui_hint("verification_passed"),
            )
            .await;
            Ok(Some(
                HealOutcome::pass(latency_ms, before, after).with_commit_ref(commit_ref(correlation_id)),
            ))
        } else {
            warn!(correlation_id = %correlation_id, %field, "replay still fails");
            self.emit(
                Event::for_correlation(
                    EventType::VerifyReplayFail,
                    correlation_id,
                    json!({
                        "replay_latency_ms": latency_ms,
                        "expected_field": field,
                        "actual_result": after,
                    }),
                )
                .with_ui_hint("verification_failed"),
            )
            .await;
            Ok(Some(HealOutcome::fail(latency_ms, before, after)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::InMemoryPatchApplier;
    use crate::catalog::CATALOG_SYNC_SOURCE;
    use heal_core::Patch;
    use heal_events::{EventFilter, InMemoryEventBus};
    use heal_test_utils::{drain, sample_failure};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn fixed() -> String {
        CATALOG_SYNC_SOURCE.replace("\"category\"]", "\"category\", \"return_policy\"]")
    }

    #[test]
    fn commit_ref_uses_id_prefix() {
        assert_eq!(commit_ref(&"0123456789abcdef".into()), "selfheal_01234567");
        assert_eq!(commit_ref(&"t1".into()), "selfheal_t1");
    }

    #[tokio::test]
    async fn replay_fails_before_fix() {
        let applier = Arc::new(InMemoryPatchApplier::with_demo_sources());
        let outcome = ReplayVerifier::new(applier)
            .verify(&"t1".into(), &sample_failure())
            .await
            .unwrap()
            .unwrap();

        assert!(!outcome.is_pass());
        assert_eq!(outcome.commit_ref, None);
    }

    #[tokio::test]
    async fn replay_passes_after_fix() {
        let bus = Arc::new(InMemoryEventBus::default());
        let mut events = bus.subscribe(EventFilter::types([EventType::VerifyReplayPass]));
        let applier = Arc::new(InMemoryPatchApplier::with_demo_sources());
        applier
            .apply(&Patch::new(CATALOG_SYNC_FILE, CATALOG_SYNC_SOURCE, fixed()), &"t1".into())
            .await
            .unwrap();

        let outcome = ReplayVerifier::new(applier)
            .with_bus(bus.clone())
            .verify(&"t1".into(), &sample_failure())
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.is_pass());
        assert_eq!(outcome.commit_ref.as_deref(), Some("selfheal_t1"));
        assert_eq!(outcome.after["return_policy"], json!("FINAL_SALE_NO_RETURNS"));
        assert_eq!(outcome.after["eligible"], json!(false));
        assert_eq!(drain(&mut events, Duration::from_millis(50)).await.len(), 1);
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let verifier = ReplayVerifier::new(Arc::new(InMemoryPatchApplier::new()));
        assert!(matches!(
            verifier.verify(&"t1".into(), &sample_failure()).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
