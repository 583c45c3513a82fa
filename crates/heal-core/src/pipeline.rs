//! Healing pipeline
//!
//! Diagnose, generate, validate, apply and verify in strict sequence. The
//! first hard failure ends the run; every exit path, panics included, ends
//! in exactly one `heal.completed` event.

use crate::coordinator::CoordinatorInner;
use crate::error::{HealError, ServiceError};
use crate::guardrail::{is_safe, rejected_rules, total_risk};
use crate::types::{
    Diagnosis, FailureContext, FailureReason, HealCompletion, HealOutcome, Patch, Stage, StageFailure,
};
use crate::workflow::WorkflowRecord;
use futures::FutureExt;
use heal_events::{CorrelationId, Event, EventType};
use serde_json::json;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn service_failure(what: &str, err: &ServiceError) -> StageFailure {
    StageFailure::new(FailureReason::ServiceUnavailable, format!("{what} failed: {err}"))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl CoordinatorInner {
    /// Run one workflow to completion
    pub(crate) async fn run_workflow(self: Arc<Self>, id: CorrelationId, diagnosis: Option<Diagnosis>) {
        let result = match AssertUnwindSafe(self.run_pipeline(&id, diagnosis))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(correlation_id = %id, panic = %message, "healing pipeline panicked");
                self.compensate(&id).await;
                Err(StageFailure::new(
                    FailureReason::Panicked,
                    format!("pipeline panicked: {message}"),
                ))
            }
        };
        self.finish(&id, result).await;
    }

    async fn run_pipeline(
        &self,
        id: &CorrelationId,
        diagnosis: Option<Diagnosis>,
    ) -> Result<HealOutcome, StageFailure> {
        self.progress(id, Stage::Diagnosing).await;
        let diagnosis = match diagnosis {
            Some(diagnosis) => diagnosis,
            None => self.diagnose(id).await?,
        };
        debug!(
            correlation_id = %id,
            playbook = %diagnosis.playbook,
            risk_score = diagnosis.risk_score,
            "diagnosis accepted"
        );

        self.enter(id, Stage::Generating).await?;
        let patch = self.generate(id, &diagnosis).await?;

        self.enter(id, Stage::Validating).await?;
        self.validate(id, &patch).await?;

        self.enter(id, Stage::Applying).await?;
        self.apply(id, &patch).await?;

        self.enter(id, Stage::Verifying).await?;
        self.verify(id, &patch).await
    }

    /// Advance the record and announce the stage
    ///
    /// Stages up to Apply are refused once shutdown has begun.
    async fn enter(&self, id: &CorrelationId, stage: Stage) -> Result<(), StageFailure> {
        if stage <= Stage::Applying && self.is_shutting_down() {
            return Err(StageFailure::new(
                FailureReason::ShuttingDown,
                "coordinator shutting down",
            ));
        }
        self.table.advance(id, stage).map_err(|err| match err {
            HealError::UnknownWorkflow(_) => {
                StageFailure::new(FailureReason::Cancelled, "workflow no longer tracked")
            }
            other => StageFailure::new(FailureReason::Internal, other.to_string()),
        })?;
        self.progress(id, stage).await;
        Ok(())
    }

    async fn progress(&self, id: &CorrelationId, stage: Stage) {
        debug!(correlation_id = %id, %stage, "stage started");
        self.publish(Event::for_correlation(
            EventType::HealProgress,
            id,
            json!({ "stage": stage.as_str(), "agent": stage.agent_label() }),
        ))
        .await;
    }

    /// Bound a collaborator call by the stage timeout
    async fn call<T, F>(&self, service: &'static str, call: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        tokio::time::timeout(self.config.stage_timeout(), call)
            .await
            .unwrap_or_else(|_| {
                Err(ServiceError::Timeout {
                    service: service.to_string(),
                    duration_secs: self.config.stage_timeout_secs,
                })
            })
    }

    async fn diagnose(&self, id: &CorrelationId) -> Result<Diagnosis, StageFailure> {
        let failure = self.table.failure_context(id).unwrap_or_default();
        match self
            .call("diagnosis", self.services.diagnosis.analyze(&failure, id))
            .await
        {
            Ok(Some(diagnosis)) => {
                diagnosis.validate().map_err(|err| {
                    StageFailure::new(FailureReason::DiagnosisFailed, format!("invalid diagnosis: {err}"))
                })?;
                Ok(diagnosis)
            }
            Ok(None) => Err(StageFailure::new(FailureReason::DiagnosisFailed, "diagnosis failed")),
            Err(err) => Err(service_failure("diagnosis", &err)),
        }
    }

    async fn generate(&self, id: &CorrelationId, diagnosis: &Diagnosis) -> Result<Patch, StageFailure> {
        let file = diagnosis.target_file().ok_or_else(|| {
            StageFailure::new(FailureReason::SourceUnavailable, "diagnosis names no target file")
        })?;
        let source = self
            .call("source", self.services.applier.read_source(file))
            .await
            .map_err(|err| {
                StageFailure::new(FailureReason::SourceUnavailable, format!("could not load {file}: {err}"))
            })?;

        match self
            .call("patch", self.services.patch.generate(diagnosis, &source, id))
            .await
        {
            Ok(Some(patch)) if !patch.is_empty() => {
                info!(correlation_id = %id, diff = %patch.diff_summary(), "patch generated");
                Ok(patch)
            }
            Ok(_) => Err(StageFailure::new(
                FailureReason::PatchGenerationFailed,
                "patch generation failed",
            )),
            Err(err) => Err(service_failure("patch generation", &err)),
        }
    }

    async fn validate(&self, id: &CorrelationId, patch: &Patch) -> Result<(), StageFailure> {
        let checks = self
            .call("guardrails", self.services.guardrails.validate(patch))
            .await
            .map_err(|err| service_failure("guardrail validation", &err))?;

        if is_safe(&checks) {
            info!(
                correlation_id = %id,
                checks = checks.len(),
                total_risk = total_risk(&checks),
                "patch passed guardrails"
            );
            Ok(())
        } else {
            let rules = rejected_rules(&checks).join(", ");
            warn!(correlation_id = %id, %rules, "patch rejected by guardrails");
            Err(StageFailure::new(
                FailureReason::SafetyRejected,
                format!("patch failed safety checks ({rules})"),
            ))
        }
    }

    async fn apply(&self, id: &CorrelationId, patch: &Patch) -> Result<(), StageFailure> {
        self.table.set_target_file(id, &patch.target_file);
        match self.call("apply", self.services.applier.apply(patch, id)).await {
            Ok(true) => {
                info!(correlation_id = %id, file = %patch.target_file, "patch applied");
                Ok(())
            }
            Ok(false) => Err(StageFailure::new(
                FailureReason::ApplyFailed,
                "patch application failed",
            )),
            Err(err) => Err(StageFailure::new(
                FailureReason::ApplyFailed,
                format!("patch application failed: {err}"),
            )),
        }
    }

    async fn verify(&self, id: &CorrelationId, patch: &Patch) -> Result<HealOutcome, StageFailure> {
        let context = self.verification_context(id).await;
        let verdict = self
            .call("verification", self.services.verifier.verify(id, &context))
            .await;

        let detail = match verdict {
            Ok(Some(outcome)) if outcome.is_pass() => return Ok(outcome),
            Ok(Some(_)) => "replay still fails".to_string(),
            Ok(None) => "no verification result".to_string(),
            Err(err) => err.to_string(),
        };
        warn!(correlation_id = %id, %detail, "verification failed; rolling back");
        let message = if self.rollback(id, &patch.target_file).await {
            "verification failed; patch rolled back"
        } else {
            "verification failed; rollback failed"
        };
        Err(StageFailure::new(FailureReason::VerificationFailed, message))
    }

    /// Failure context for replay, recovered from bus history when the
    /// record was opened by a diagnosis
    async fn verification_context(&self, id: &CorrelationId) -> FailureContext {
        if let Some(failure) = self.table.failure_context(id) {
            return failure;
        }
        self.bus
            .history(id)
            .await
            .iter()
            .find(|event| event.event_type.is_failure())
            .and_then(|event| FailureContext::from_payload(&event.payload).ok())
            .unwrap_or_default()
    }

    /// Best-effort rollback; failures are only logged
    pub(crate) async fn rollback(&self, id: &CorrelationId, file: &str) -> bool {
        match self.call("rollback", self.services.applier.rollback(file, id)).await {
            Ok(true) => {
                info!(correlation_id = %id, %file, "patch rolled back");
                true
            }
            Ok(false) => {
                warn!(correlation_id = %id, %file, "no backup to roll back");
                false
            }
            Err(err) => {
                error!(correlation_id = %id, %file, error = %err, "rollback failed");
                false
            }
        }
    }

    /// Undo a patch that may be live after a panic
    async fn compensate(&self, id: &CorrelationId) {
        let Some(record) = self.table.snapshot(id) else {
            return;
        };
        if record.stage.is_post_apply() {
            if let Some(file) = record.target_file.as_deref() {
                self.rollback(id, file).await;
            }
        }
    }

    /// Terminate a workflow this task owns
    pub(crate) async fn finish(&self, id: &CorrelationId, result: Result<HealOutcome, StageFailure>) {
        // Mark completed before removal so a racing event cannot reopen the id
        self.completed.insert(id.clone(), ()).await;
        match self.table.take(id) {
            Some(record) => self.complete(record, result).await,
            None => debug!(correlation_id = %id, "workflow already completed"),
        }
    }

    /// Publish the terminal event for a record already removed from the table
    pub(crate) async fn complete(&self, mut record: WorkflowRecord, result: Result<HealOutcome, StageFailure>) {
        let id = record.correlation_id.clone();
        self.completed.insert(id.clone(), ()).await;
        record.close(result.is_ok());
        debug!(correlation_id = %id, status = ?record.status, "workflow record closed");

        let duration = record.elapsed().as_secs_f64();
        let stages = record.stages_involved();
        let completion = match result {
            Ok(outcome) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(correlation_id = %id, duration_secs = duration, "healing succeeded");
                HealCompletion::succeeded(duration, stages, outcome)
            }
            Err(failure) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = %id,
                    reason = ?failure.reason,
                    message = %failure.message,
                    duration_secs = duration,
                    "healing failed"
                );
                HealCompletion::failed(duration, stages, failure)
            }
        };

        self.publish(
            Event::for_correlation(EventType::HealCompleted, &id, completion.to_payload())
                .with_ui_hint("healing_complete"),
        )
        .await;
    }
}
