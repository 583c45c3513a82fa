//! Heal Core - event-driven healing workflow coordinator
//!
//! Turns failure events into verified fixes:
//! - Diagnosis: root cause and patch spec for a failure
//! - Generation: a concrete source edit
//! - Validation: guardrail checks, rejecting risky edits
//! - Apply: persist the edit with a reversible backup
//! - Verify: replay the failing request, rolling back on failure
//!
//! # Architecture
//!
//! ```text
//! failure event ──► Coordinator ──► WorkflowTable (one record per id)
//!                        │
//!                        └─► pipeline task: diagnose → generate → validate → apply → verify
//!                                    │
//!                                    └─► heal.completed (exactly once per id)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use heal_core::{Coordinator, CoordinatorConfig, HealingServices};
//!
//! let coordinator = Coordinator::new(CoordinatorConfig::default(), bus, services);
//! let handle = coordinator.start()?;
//! // ... failure events flow through the bus ...
//! let report = handle.shutdown().await;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod guardrail;
mod pipeline;
pub mod services;
pub mod state_machine;
pub mod types;
pub mod workflow;

pub use config::{CoordinatorConfig, DiagnosisMode, GuardrailConfig, SelfHealConfig};
pub use coordinator::{
    Coordinator, CoordinatorHandle, CoordinatorStats, Dispatch, IgnoreReason, ShutdownReport,
};
pub use error::{ConfigError, HealError, PayloadError, ServiceError};
pub use guardrail::{is_safe, rejected_rules, total_risk, SAFETY_RISK_THRESHOLD};
pub use services::{
    ApplyService, DiagnosisService, GuardrailService, HealingServices, PatchService,
    VerificationService,
};
pub use types::{
    Diagnosis, FailureContext, FailureReason, GuardrailCheck, HealCompletion, HealOutcome,
    OutcomeStatus, Patch, Stage, StageFailure, WorkflowStatus,
};
pub use workflow::{Claim, WorkflowRecord, WorkflowTable};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
