//! Workflow stage state machine
//!
//! Stages advance strictly in pipeline order; any stage may terminate
//! directly. Skipping a stage is illegal.

use crate::error::HealError;
use crate::types::Stage;

/// Validates a stage transition
///
/// # Errors
/// Returns [`HealError::IllegalTransition`] if `to` is not reachable from
/// `from` in one step.
pub fn validate_transition(from: Stage, to: Stage) -> Result<(), HealError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(HealError::IllegalTransition { from, to })
    }
}

/// Stages reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: Stage) -> Vec<Stage> {
    use Stage::*;
    match from {
        AwaitingDiagnosis => vec![Diagnosing, Done],
        Diagnosing => vec![Generating, Done],
        Generating => vec![Validating, Done],
        Validating => vec![Applying, Done],
        Applying => vec![Verifying, Done],
        Verifying => vec![Done],
        Done => vec![],
    }
}

fn allowed(from: Stage, to: Stage) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
