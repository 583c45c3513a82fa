//! Heal Agents - reference collaborators for the self-heal pipeline
//!
//! Concrete implementations of every heal-core service contract, wired
//! around a small e-commerce catalog whose sync module drops
//! `return_policy`:
//! - [`RuleBasedDiagnosis`], [`FallbackDiagnosis`] and the autonomous [`DiagnosisWatcher`]
//! - [`TemplatePatchGenerator`] for `add_field` / `add_default` edits
//! - [`GuardrailEngine`] with the five static safety rules
//! - [`InMemoryPatchApplier`] with per-correlation-id backups
//! - [`ReplayVerifier`] re-running the failing request
//! - [`ReturnEligibilityMonitor`] emitting the failure that starts it all
//!
//! # Example
//!
//! ```rust,ignore
//! use heal_agents::ReferenceAgents;
//!
//! let agents = ReferenceAgents::new(bus.clone(), GuardrailConfig::default());
//! let coordinator = Coordinator::new(config, bus.clone(), agents.services());
//! let handle = coordinator.start()?;
//! agents.monitor().simulate_return_request("SKU-1001", "ORD-1").await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod applier;
pub mod catalog;
pub mod diagnosis;
pub mod guardrails;
pub mod monitor;
pub mod patch;
pub mod verifier;

pub use applier::InMemoryPatchApplier;
pub use catalog::{check_return_eligibility, synced_fields, EligibilityError, CATALOG_SYNC_FILE, CATALOG_SYNC_SOURCE};
pub use diagnosis::{DiagnosisWatcher, FallbackDiagnosis, Playbook, RuleBasedDiagnosis};
pub use guardrails::{GuardrailEngine, GuardrailVerdict};
pub use monitor::{ReturnEligibilityMonitor, ReturnRequest};
pub use patch::TemplatePatchGenerator;
pub use verifier::ReplayVerifier;

use heal_core::{GuardrailConfig, HealingServices};
use heal_events::EventBus;
use std::sync::Arc;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every reference collaborator, sharing one bus and one source store
#[derive(Clone)]
pub struct ReferenceAgents {
    bus: Arc<dyn EventBus>,
    pub diagnosis: Arc<RuleBasedDiagnosis>,
    pub patch: Arc<TemplatePatchGenerator>,
    pub guardrails: Arc<GuardrailEngine>,
    pub applier: Arc<InMemoryPatchApplier>,
    pub verifier: Arc<ReplayVerifier>,
}

impl ReferenceAgents {
    /// Create new agents over the demo sources
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, guardrails: GuardrailConfig) -> Self {
        let applier = Arc::new(InMemoryPatchApplier::with_demo_sources().with_bus(Arc::clone(&bus)));
        let verifier = ReplayVerifier::new(applier.clone()).with_bus(Arc::clone(&bus));
        Self {
            diagnosis: Arc::new(RuleBasedDiagnosis::new()),
            patch: Arc::new(TemplatePatchGenerator::new().with_bus(Arc::clone(&bus))),
            guardrails: Arc::new(GuardrailEngine::new(guardrails)),
            applier,
            verifier: Arc::new(verifier),
            bus,
        }
    }

    /// Service bundle for a coordinator
    #[must_use]
    pub fn services(&self) -> HealingServices {
        HealingServices::new(
            self.diagnosis.clone(),
            self.patch.clone(),
            self.guardrails.clone(),
            self.applier.clone(),
            self.verifier.clone(),
        )
    }

    /// Monitor reading the shared source store
    #[must_use]
    pub fn monitor(&self) -> ReturnEligibilityMonitor {
        ReturnEligibilityMonitor::new(Arc::clone(&self.bus), self.applier.clone())
    }

    /// Watcher publishing rule-based diagnoses
    #[must_use]
    pub fn watcher(&self) -> DiagnosisWatcher {
        DiagnosisWatcher::new(Arc::clone(&self.bus), self.diagnosis.clone())
    }
}

impl std::fmt::Debug for ReferenceAgents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceAgents")
            .field("applier", &self.applier)
            .field("guardrails", &self.guardrails.config())
            .finish_non_exhaustive()
    }
}
