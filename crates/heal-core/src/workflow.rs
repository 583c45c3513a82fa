//! Workflow table
//!
//! Concurrent map from correlation id to the in-flight workflow record:
//! - At most one record per correlation id
//! - Open, claim and remove are atomic per key
//! - Every stage change goes through the state machine

use crate::error::HealError;
use crate::state_machine::validate_transition;
use crate::types::{FailureContext, Stage, WorkflowStatus};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use heal_events::CorrelationId;
use indexmap::IndexSet;
use std::time::{Duration, Instant};

/// In-flight workflow state
#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    /// Correlation id
    pub correlation_id: CorrelationId,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Current stage
    pub stage: Stage,
    /// Stages entered so far, in order
    pub involved_stages: IndexSet<Stage>,
    /// Status
    pub status: WorkflowStatus,
    /// Failure the workflow was opened with
    pub failure: Option<FailureContext>,
    /// File being patched, known once Apply starts
    pub target_file: Option<String>,
    started: Instant,
}

impl WorkflowRecord {
    /// Create new record in `AwaitingDiagnosis`
    #[must_use]
    pub fn new(correlation_id: CorrelationId, failure: Option<FailureContext>) -> Self {
        Self {
            correlation_id,
            started_at: Utc::now(),
            stage: Stage::AwaitingDiagnosis,
            involved_stages: IndexSet::new(),
            status: WorkflowStatus::InProgress,
            failure,
            target_file: None,
            started: Instant::now(),
        }
    }

    /// Move to `to`, recording the stage
    ///
    /// # Errors
    /// Returns [`HealError::IllegalTransition`] for skipped or backward moves.
    pub fn enter(&mut self, to: Stage) -> Result<(), HealError> {
        validate_transition(self.stage, to)?;
        self.stage = to;
        if to.agent_label().is_some() {
            self.involved_stages.insert(to);
        }
        Ok(())
    }

    /// Close the record: stage `Done`, status `Succeeded` or `Failed`
    pub fn close(&mut self, succeeded: bool) {
        self.stage = Stage::Done;
        self.status = if succeeded {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Failed
        };
    }

    /// Time since the record was opened
    #[inline]
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Collaborator labels of every stage entered
    #[must_use]
    pub fn stages_involved(&self) -> Vec<String> {
        self.involved_stages
            .iter()
            .filter_map(Stage::agent_label)
            .map(str::to_string)
            .collect()
    }
}

/// Outcome of a diagnosis-ready claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// No record existed; one was opened already claimed
    Opened,
    /// Waiting record claimed
    Claimed,
    /// Pipeline already holds a diagnosis
    AlreadyClaimed,
}

/// Correlation id to workflow record
#[derive(Debug, Default)]
pub struct WorkflowTable {
    records: DashMap<CorrelationId, WorkflowRecord>,
}

impl WorkflowTable {
    /// Create empty table
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a record for a failure; `false` if one already exists
    ///
    /// With `claimed`, the record enters `Diagnosing` before it becomes
    /// visible.
    pub fn try_open(&self, id: &CorrelationId, failure: Option<FailureContext>, claimed: bool) -> bool {
        match self.records.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let mut record = WorkflowRecord::new(id.clone(), failure);
                if claimed {
                    // AwaitingDiagnosis -> Diagnosing is always legal
                    let _ = record.enter(Stage::Diagnosing);
                }
                slot.insert(record);
                true
            }
        }
    }

    /// Claim a workflow for a diagnosis, opening it when absent
    pub fn claim_or_open(&self, id: &CorrelationId) -> Claim {
        match self.records.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.stage == Stage::AwaitingDiagnosis && record.enter(Stage::Diagnosing).is_ok() {
                    Claim::Claimed
                } else {
                    Claim::AlreadyClaimed
                }
            }
            Entry::Vacant(slot) => {
                let mut record = WorkflowRecord::new(id.clone(), None);
                let _ = record.enter(Stage::Diagnosing);
                slot.insert(record);
                Claim::Opened
            }
        }
    }

    /// Advance a record to `to`
    ///
    /// # Errors
    /// Returns [`HealError::UnknownWorkflow`] if the record is gone, or
    /// [`HealError::IllegalTransition`].
    pub fn advance(&self, id: &CorrelationId, to: Stage) -> Result<(), HealError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| HealError::UnknownWorkflow(id.clone()))?;
        record.enter(to)
    }

    /// Remember the file being patched
    pub fn set_target_file(&self, id: &CorrelationId, file: &str) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.target_file = Some(file.to_string());
        }
    }

    /// Remove a record, handing ownership to the caller
    pub fn take(&self, id: &CorrelationId) -> Option<WorkflowRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    /// Remove a record only if it never received a diagnosis
    pub fn take_if_awaiting(&self, id: &CorrelationId) -> Option<WorkflowRecord> {
        self.records
            .remove_if(id, |_, record| record.stage == Stage::AwaitingDiagnosis)
            .map(|(_, record)| record)
    }

    /// Failure context the record was opened with
    #[must_use]
    pub fn failure_context(&self, id: &CorrelationId) -> Option<FailureContext> {
        self.records.get(id).and_then(|record| record.failure.clone())
    }

    /// Current stage of a record
    #[must_use]
    pub fn stage(&self, id: &CorrelationId) -> Option<Stage> {
        self.records.get(id).map(|record| record.stage)
    }

    /// Copy of a record
    #[must_use]
    pub fn snapshot(&self, id: &CorrelationId) -> Option<WorkflowRecord> {
        self.records.get(id).map(|record| record.clone())
    }

    /// Ids of every open record
    #[must_use]
    pub fn ids(&self) -> Vec<CorrelationId> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Check if a record exists
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of open records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no record is open
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
