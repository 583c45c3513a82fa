//! Collaborator contracts
//!
//! The coordinator drives five external services. Each is an async trait so
//! that simulated, rule-based and remote implementations are interchangeable.

use crate::error::ServiceError;
use crate::types::{Diagnosis, FailureContext, GuardrailCheck, HealOutcome, Patch};
use async_trait::async_trait;
use heal_events::CorrelationId;
use std::sync::Arc;

/// Root-cause analysis
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiagnosisService: Send + Sync {
    /// Diagnose a failure; `Ok(None)` when no playbook matches
    async fn analyze(
        &self,
        failure: &FailureContext,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Diagnosis>, ServiceError>;
}

/// Patch generation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PatchService: Send + Sync {
    /// Turn a diagnosis and the current source into an edit
    async fn generate(
        &self,
        diagnosis: &Diagnosis,
        source_text: &str,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Patch>, ServiceError>;
}

/// Static safety checks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GuardrailService: Send + Sync {
    /// Run every rule over a patch
    async fn validate(&self, patch: &Patch) -> Result<Vec<GuardrailCheck>, ServiceError>;
}

/// Patch persistence with reversible backups
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApplyService: Send + Sync {
    /// Apply a patch, keeping a backup keyed by correlation id
    async fn apply(&self, patch: &Patch, correlation_id: &CorrelationId) -> Result<bool, ServiceError>;

    /// Read the current text of a source file
    async fn read_source(&self, path: &str) -> Result<String, ServiceError>;

    /// Restore the backup taken for `correlation_id`; `Ok(false)` if none exists
    async fn rollback(&self, path: &str, correlation_id: &CorrelationId) -> Result<bool, ServiceError>;
}

/// Replay verification
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VerificationService: Send + Sync {
    /// Replay the failing operation
    async fn verify(
        &self,
        correlation_id: &CorrelationId,
        failure: &FailureContext,
    ) -> Result<Option<HealOutcome>, ServiceError>;
}

/// Collaborators injected into the coordinator
#[derive(Clone)]
pub struct HealingServices {
    /// Diagnosis service
    pub diagnosis: Arc<dyn DiagnosisService>,
    /// Patch service
    pub patch: Arc<dyn PatchService>,
    /// Guardrail service
    pub guardrails: Arc<dyn GuardrailService>,
    /// Apply / rollback service
    pub applier: Arc<dyn ApplyService>,
    /// Verification service
    pub verifier: Arc<dyn VerificationService>,
}

impl HealingServices {
    /// Bundle collaborators
    #[must_use]
    pub fn new(
        diagnosis: Arc<dyn DiagnosisService>,
        patch: Arc<dyn PatchService>,
        guardrails: Arc<dyn GuardrailService>,
        applier: Arc<dyn ApplyService>,
        verifier: Arc<dyn VerificationService>,
    ) -> Self {
        Self {
            diagnosis,
            patch,
            guardrails,
            applier,
            verifier,
        }
    }
}

impl std::fmt::Debug for HealingServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealingServices").finish_non_exhaustive()
    }
}
