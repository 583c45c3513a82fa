//! Return-eligibility monitor
//!
//! Simulates customer return requests against the catalog model and turns
//! schema failures into `return_api.failure` events that start a heal.

use crate::catalog::{check_return_eligibility, EligibilityError, CATALOG_SYNC_FILE, REQUIRED_FIELD};
use heal_core::{ApplyService, FailureContext, ServiceError};
use heal_events::{CorrelationId, Event, EventBus, EventType};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a simulated return request
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnRequest {
    /// Request answered
    Served(Value),
    /// Request failed and a heal was triggered
    Failed {
        /// Correlation id of the published failure
        correlation_id: CorrelationId,
        /// Error shown to the customer
        error: String,
    },
}

impl ReturnRequest {
    /// Correlation id of the triggered heal, if any
    #[must_use]
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            ReturnRequest::Served(_) => None,
            ReturnRequest::Failed { correlation_id, .. } => Some(correlation_id),
        }
    }
}

/// Monitor for the return-eligibility endpoint
pub struct ReturnEligibilityMonitor {
    bus: Arc<dyn EventBus>,
    sources: Arc<dyn ApplyService>,
}

impl ReturnEligibilityMonitor {
    /// Create new monitor
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, sources: Arc<dyn ApplyService>) -> Self {
        Self { bus, sources }
    }

    /// Run one return request for `sku` on `order_id`
    ///
    /// # Errors
    /// Returns [`ServiceError`] if the sync source cannot be read or the
    /// failure event cannot be published.
    pub async fn simulate_return_request(&self, sku: &str, order_id: &str) -> Result<ReturnRequest, ServiceError> {
        let source = self.sources.read_source(CATALOG_SYNC_FILE).await?;
        match check_return_eligibility(&source, sku, order_id) {
            Ok(eligibility) => {
                info!(%sku, %order_id, eligible = eligibility.eligible, "return request served");
                Ok(ReturnRequest::Served(eligibility.to_value()))
            }
            Err(err @ EligibilityError::MissingField { .. }) => {
                let correlation_id = self.report_failure(sku, order_id, &err.to_string()).await?;
                Ok(ReturnRequest::Failed {
                    correlation_id,
                    error: err.to_string(),
                })
            }
            Err(err) => Err(ServiceError::Internal(err.to_string())),
        }
    }

    async fn report_failure(&self, sku: &str, order_id: &str, error: &str) -> Result<CorrelationId, ServiceError> {
        let correlation_id = CorrelationId::generate();
        let mut failure = FailureContext {
            endpoint: Some("CheckReturnEligibility".into()),
            sku: Some(sku.into()),
            order_id: Some(order_id.into()),
            error_type: Some("SchemaMismatch".into()),
            field: Some(REQUIRED_FIELD.into()),
            detail: Some(format!("{REQUIRED_FIELD} field missing from catalog sync")),
            file: Some(CATALOG_SYNC_FILE.into()),
            ..FailureContext::default()
        };
        failure
            .extra
            .insert("customer_impact".into(), json!("Unable to process return request"));

        let event = Event::new(EventType::ReturnApiFailure, format!("order_{order_id}"), failure.to_payload())
            .with_correlation_id(&correlation_id)
            .with_ui_hint("return_api_failure");
        self.bus
            .publish(event)
            .await
            .map_err(|err| ServiceError::Unavailable(err.to_string()))?;

        warn!(correlation_id = %correlation_id, %sku, %order_id, %error, "return request failed; heal requested");
        Ok(correlation_id)
    }
}

impl std::fmt::Debug for ReturnEligibilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReturnEligibilityMonitor").finish_non_exhaustive()
    }
}
