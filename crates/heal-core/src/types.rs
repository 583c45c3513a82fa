//! Core types for the healing pipeline
//!
//! Defines the data that flows between the coordinator and its collaborators:
//! - Pipeline stages and workflow status
//! - Failure context, diagnosis, patch, guardrail checks and heal outcome
//! - The terminal completion payload and its failure reasons

use crate::error::PayloadError;
use heal_events::{Event, EventType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pipeline stage of a workflow record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Opened by a failure event, no diagnosis yet
    AwaitingDiagnosis,
    /// Diagnosis being produced or absorbed
    Diagnosing,
    /// Loading source and generating a patch
    Generating,
    /// Running guardrail checks
    Validating,
    /// Applying the patch
    Applying,
    /// Replaying the failing request
    Verifying,
    /// Terminal
    Done,
}

impl Stage {
    /// Every stage in pipeline order
    pub const ALL: [Stage; 7] = [
        Stage::AwaitingDiagnosis,
        Stage::Diagnosing,
        Stage::Generating,
        Stage::Validating,
        Stage::Applying,
        Stage::Verifying,
        Stage::Done,
    ];

    /// Snake-case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AwaitingDiagnosis => "awaiting_diagnosis",
            Stage::Diagnosing => "diagnosing",
            Stage::Generating => "generating",
            Stage::Validating => "validating",
            Stage::Applying => "applying",
            Stage::Verifying => "verifying",
            Stage::Done => "done",
        }
    }

    /// Label of the collaborator doing the work in this stage
    #[must_use]
    pub fn agent_label(&self) -> Option<&'static str> {
        match self {
            Stage::Diagnosing => Some("diagnosis"),
            Stage::Generating => Some("patch_generator"),
            Stage::Validating => Some("guardrails"),
            Stage::Applying => Some("patch_applier"),
            Stage::Verifying => Some("verifier"),
            Stage::AwaitingDiagnosis | Stage::Done => None,
        }
    }

    /// Check if a patch may already be live in this stage
    #[inline]
    #[must_use]
    pub fn is_post_apply(&self) -> bool {
        matches!(self, Stage::Applying | Stage::Verifying)
    }

    /// Check if stage is terminal
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Pipeline running
    InProgress,
    /// Patch applied and verified
    Succeeded,
    /// Terminated without a verified fix
    Failed,
}

impl WorkflowStatus {
    /// Check if status is terminal
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::InProgress)
    }
}

/// Typed view of a failure event payload
///
/// Every field is optional; keys the pipeline does not know are kept in
/// `extra` and forwarded to verification untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Failing endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Product SKU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    /// Order id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Error class reported by the producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Field involved in the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Source file suspected by the producer
    #[serde(
        default,
        rename = "catalog_sync_file",
        alias = "file",
        skip_serializing_if = "Option::is_none"
    )]
    pub file: Option<String>,
    /// Unknown keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FailureContext {
    /// Parse a failure payload
    ///
    /// # Errors
    /// Returns [`PayloadError`] if the payload is not an object or a known
    /// field has the wrong type.
    pub fn from_payload(payload: &Value) -> Result<Self, PayloadError> {
        if !payload.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        Ok(serde_json::from_value(payload.clone())?)
    }

    /// Render back into an event payload
    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// With field
    #[inline]
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// With SKU
    #[inline]
    #[must_use]
    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    /// Check if nothing is known about the failure
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Root-cause diagnosis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Named remediation strategy
    pub playbook: String,
    /// Human-readable cause
    pub cause: String,
    /// Edit recipe, forwarded opaquely to the patch service
    #[serde(default)]
    pub patch_spec: Map<String, Value>,
    /// Risk estimate in [0, 1]
    pub risk_score: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl Diagnosis {
    /// Create new diagnosis
    #[must_use]
    pub fn new(playbook: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            playbook: playbook.into(),
            cause: cause.into(),
            patch_spec: Map::new(),
            risk_score: 0.0,
            confidence: 0.0,
        }
    }

    /// With patch spec
    #[must_use]
    pub fn with_patch_spec(mut self, spec: Value) -> Self {
        if let Value::Object(map) = spec {
            self.patch_spec = map;
        }
        self
    }

    /// With scores
    #[inline]
    #[must_use]
    pub fn with_scores(mut self, risk_score: f64, confidence: f64) -> Self {
        self.risk_score = risk_score;
        self.confidence = confidence;
        self
    }

    /// Parse and validate a diagnosis-ready payload
    ///
    /// # Errors
    /// Returns [`PayloadError`] for non-object payloads, missing playbook or
    /// cause, and scores outside [0, 1].
    pub fn from_payload(payload: &Value) -> Result<Self, PayloadError> {
        let object = payload.as_object().ok_or(PayloadError::NotAnObject)?;
        if !object.contains_key("playbook") {
            return Err(PayloadError::Missing("playbook"));
        }
        if !object.contains_key("cause") {
            return Err(PayloadError::Missing("cause"));
        }
        let diagnosis: Self = serde_json::from_value(payload.clone())?;
        diagnosis.validate()?;
        Ok(diagnosis)
    }

    /// Check field invariants
    ///
    /// # Errors
    /// Returns [`PayloadError`] describing the first violated invariant.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.playbook.trim().is_empty() {
            return Err(PayloadError::Missing("playbook"));
        }
        if self.cause.trim().is_empty() {
            return Err(PayloadError::Missing("cause"));
        }
        for (field, value) in [("risk_score", self.risk_score), ("confidence", self.confidence)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PayloadError::OutOfRange { field, value });
            }
        }
        Ok(())
    }

    /// Source file named by the patch spec
    #[must_use]
    pub fn target_file(&self) -> Option<&str> {
        self.patch_spec
            .get("file")
            .and_then(Value::as_str)
            .filter(|file| !file.is_empty())
    }

    /// Render into an event payload
    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Proposed source edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// File the edit applies to
    pub target_file: String,
    /// Source before the edit
    pub original_text: String,
    /// Source after the edit
    pub updated_text: String,
    /// `-`/`+` prefixed changed lines
    pub diff_lines: Vec<String>,
    /// Number of added or removed lines
    pub changed_line_count: usize,
}

impl Patch {
    /// Create new patch, deriving the diff from both texts
    #[must_use]
    pub fn new(
        target_file: impl Into<String>,
        original_text: impl Into<String>,
        updated_text: impl Into<String>,
    ) -> Self {
        let original_text = original_text.into();
        let updated_text = updated_text.into();
        let diff_lines = line_diff(&original_text, &updated_text);
        let changed_line_count = count_changed_lines(&diff_lines);
        Self {
            target_file: target_file.into(),
            original_text,
            updated_text,
            diff_lines,
            changed_line_count,
        }
    }

    /// Check if the patch changes nothing
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed_line_count == 0 || self.original_text == self.updated_text
    }

    /// Lines the patch adds (without the `+` marker)
    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.diff_lines
            .iter()
            .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
            .map(|line| &line[1..])
    }

    /// Short `+N -M` summary
    #[must_use]
    pub fn diff_summary(&self) -> String {
        let added = self.diff_lines.iter().filter(|l| l.starts_with('+')).count();
        let removed = self.diff_lines.iter().filter(|l| l.starts_with('-')).count();
        format!("{}: +{added} -{removed}", self.target_file)
    }
}

/// Line-level diff of two texts
///
/// Emits only changed lines, `-` for removed and `+` for added, in source
/// order (longest-common-subsequence alignment).
#[must_use]
pub fn line_diff(original: &str, updated: &str) -> Vec<String> {
    let old: Vec<&str> = original.lines().collect();
    let new: Vec<&str> = updated.lines().collect();
    let (n, m) = (old.len(), new.len());

    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut diff = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            diff.push(format!("-{}", old[i]));
            i += 1;
        } else {
            diff.push(format!("+{}", new[j]));
            j += 1;
        }
    }
    diff.extend(old[i..].iter().map(|line| format!("-{line}")));
    diff.extend(new[j..].iter().map(|line| format!("+{line}")));
    diff
}

/// Count `+`/`-` lines, ignoring `+++`/`---` file headers
#[must_use]
pub fn count_changed_lines(diff_lines: &[String]) -> usize {
    diff_lines
        .iter()
        .filter(|line| {
            (line.starts_with('+') && !line.starts_with("+++"))
                || (line.starts_with('-') && !line.starts_with("---"))
        })
        .count()
}

/// Result of one guardrail rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailCheck {
    /// Rule name
    pub rule_name: String,
    /// Whether the rule passed
    pub passed: bool,
    /// Explanation
    pub message: String,
    /// Risk in [0, 1], lower is safer
    pub risk_score: f64,
}

impl GuardrailCheck {
    /// Passing check with zero risk
    #[must_use]
    pub fn pass(rule_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            passed: true,
            message: message.into(),
            risk_score: 0.0,
        }
    }

    /// Failing check
    #[must_use]
    pub fn fail(rule_name: impl Into<String>, message: impl Into<String>, risk_score: f64) -> Self {
        Self {
            rule_name: rule_name.into(),
            passed: false,
            message: message.into(),
            risk_score: risk_score.clamp(0.0, 1.0),
        }
    }
}

/// Replay verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Replay succeeded
    Pass,
    /// Replay still fails
    Fail,
}

/// Result of replaying the failing request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealOutcome {
    /// Verdict
    pub status: OutcomeStatus,
    /// Replay latency
    pub replay_latency_ms: u64,
    /// Observed state before the patch
    #[serde(default)]
    pub before: Value,
    /// Observed state after the patch
    #[serde(default)]
    pub after: Value,
    /// Synthetic reference for a passing heal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
}

impl HealOutcome {
    /// Passing outcome
    #[must_use]
    pub fn pass(replay_latency_ms: u64, before: Value, after: Value) -> Self {
        Self {
            status: OutcomeStatus::Pass,
            replay_latency_ms,
            before,
            after,
            commit_ref: None,
        }
    }

    /// Failing outcome
    #[must_use]
    pub fn fail(replay_latency_ms: u64, before: Value, after: Value) -> Self {
        Self {
            status: OutcomeStatus::Fail,
            ..Self::pass(replay_latency_ms, before, after)
        }
    }

    /// With commit reference
    #[inline]
    #[must_use]
    pub fn with_commit_ref(mut self, commit_ref: impl Into<String>) -> Self {
        self.commit_ref = Some(commit_ref.into());
        self
    }

    /// Check if replay passed
    #[inline]
    #[must_use]
    pub fn is_pass(&self) -> bool {
        self.status == OutcomeStatus::Pass
    }
}

/// Machine-readable reason a workflow failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Diagnosis service produced nothing
    DiagnosisFailed,
    /// No diagnosis arrived in time
    DiagnosisTimedOut,
    /// Target source could not be loaded
    SourceUnavailable,
    /// Patch service produced no usable patch
    PatchGenerationFailed,
    /// Guardrails rejected the patch
    SafetyRejected,
    /// Patch could not be applied
    ApplyFailed,
    /// Replay failed after apply
    VerificationFailed,
    /// A collaborator errored or timed out
    ServiceUnavailable,
    /// Pipeline panicked
    Panicked,
    /// Coordinator stopped before apply
    ShuttingDown,
    /// Cancelled by shutdown after the grace period
    Cancelled,
    /// Coordinator invariant broken
    Internal,
}

/// Failure carried from the stage that raised it to the completion event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StageFailure {
    /// Machine-readable reason
    pub reason: FailureReason,
    /// Completion message
    pub message: String,
}

impl StageFailure {
    /// Create new stage failure
    #[inline]
    #[must_use]
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Payload of the terminal `heal.completed` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealCompletion {
    /// Terminal status
    pub status: WorkflowStatus,
    /// Human-readable message
    pub message: String,
    /// Failure reason, absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Wall-clock duration of the workflow
    pub duration_seconds: f64,
    /// Collaborators involved, in order
    pub stages_involved: Vec<String>,
    /// Replay outcome, present on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<HealOutcome>,
}

impl HealCompletion {
    /// Successful completion
    #[must_use]
    pub fn succeeded(duration_seconds: f64, stages_involved: Vec<String>, outcome: HealOutcome) -> Self {
        Self {
            status: WorkflowStatus::Succeeded,
            message: "all healing steps completed successfully".to_string(),
            reason: None,
            duration_seconds,
            stages_involved,
            outcome: Some(outcome),
        }
    }

    /// Failed completion
    #[must_use]
    pub fn failed(duration_seconds: f64, stages_involved: Vec<String>, failure: StageFailure) -> Self {
        Self {
            status: WorkflowStatus::Failed,
            message: failure.message,
            reason: Some(failure.reason),
            duration_seconds,
            stages_involved,
            outcome: None,
        }
    }

    /// Render into an event payload
    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Parse from a `heal.completed` event
    ///
    /// # Errors
    /// Returns [`PayloadError`] if the event has another type or the payload
    /// does not decode.
    pub fn from_event(event: &Event) -> Result<Self, PayloadError> {
        if event.event_type != EventType::HealCompleted {
            return Err(PayloadError::Decode(format!(
                "expected heal.completed, got {}",
                event.event_type
            )));
        }
        Ok(serde_json::from_value(event.payload.clone())?)
    }

    /// Check if the workflow succeeded
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }
}
