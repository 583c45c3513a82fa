//! Healing coordinator
//!
//! Owns the correlation id to workflow mapping and runs the healing pipeline
//! exactly once per correlation id:
//! - Dispatch of failure and diagnosis-ready events
//! - One tokio task per pipeline, never awaited by the dispatch loop
//! - Bounded memory of completed ids to drop late duplicates
//! - Graceful shutdown with rollback of applied-but-unverified patches

use crate::config::{CoordinatorConfig, DiagnosisMode};
use crate::error::HealError;
use crate::services::HealingServices;
use crate::types::{Diagnosis, FailureContext, FailureReason, Stage, StageFailure};
use crate::workflow::{Claim, WorkflowRecord, WorkflowTable};
use heal_events::{CorrelationId, Event, EventBus, EventFilter, EventType, Subscription};
use moka::future::Cache;
use parking_lot::Mutex;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Event types the coordinator subscribes to
pub const SUBSCRIBED_TYPES: [EventType; 3] = [
    EventType::ReturnApiFailure,
    EventType::SchemaMismatch,
    EventType::DiagnosisReady,
];

/// How an incoming event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// New workflow opened and pipeline started
    Started,
    /// Waiting workflow claimed by a diagnosis
    Resumed,
    /// Duplicate diagnosis for a running pipeline, accepted without effect
    Absorbed,
    /// Workflow opened, waiting for a diagnosis-ready event
    AwaitingDiagnosis,
    /// Event dropped
    Ignored(IgnoreReason),
}

/// Why an event was dropped at dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No usable correlation id
    MissingCorrelationId,
    /// Event type outside the subscription
    UnsubscribedType,
    /// Payload failed validation
    MalformedPayload,
    /// Failure for a workflow already in progress
    AlreadyInProgress,
    /// Correlation id completed recently
    RecentlyCompleted,
    /// Coordinator is stopping
    ShuttingDown,
}

/// Coordinator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Workflows opened
    pub started: u64,
    /// Workflows that succeeded
    pub succeeded: u64,
    /// Workflows that failed
    pub failed: u64,
    /// Events dropped at dispatch
    pub ignored: u64,
    /// Workflows currently open
    pub active: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) started: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) ignored: AtomicU64,
}

/// Result of a graceful shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workflows that finished during the grace period
    pub completed: usize,
    /// Workflows terminated by shutdown
    pub cancelled: usize,
    /// Applied patches reverted during cancellation
    pub rolled_back: usize,
}

pub(crate) struct CoordinatorInner {
    pub(crate) config: CoordinatorConfig,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) services: HealingServices,
    pub(crate) table: WorkflowTable,
    pub(crate) completed: Cache<CorrelationId, ()>,
    pub(crate) stats: StatsCounters,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    running: AtomicBool,
}

/// Healing coordinator
///
/// Cheap to clone; clones share the same workflow table.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Create new coordinator
    #[must_use]
    pub fn new(config: CoordinatorConfig, bus: Arc<dyn EventBus>, services: HealingServices) -> Self {
        let completed = Cache::builder()
            .max_capacity(config.completed_retention_capacity)
            .time_to_live(config.completed_retention())
            .build();
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                bus,
                services,
                table: WorkflowTable::new(),
                completed,
                stats: StatsCounters::default(),
                shutdown,
                tasks: Mutex::new(JoinSet::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to the bus and start the dispatch loop
    ///
    /// The subscription exists before this returns, so no event published
    /// afterwards is missed. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`HealError::AlreadyRunning`] on a second call and
    /// [`HealError::Stopped`] after shutdown.
    pub fn start(&self) -> Result<CoordinatorHandle, HealError> {
        if self.inner.is_shutting_down() {
            return Err(HealError::Stopped);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(HealError::AlreadyRunning);
        }

        let subscription = self.inner.bus.subscribe(EventFilter::types(SUBSCRIBED_TYPES));
        let inner = Arc::clone(&self.inner);
        let dispatcher = tokio::spawn(inner.dispatch_loop(subscription));

        info!(
            mode = %self.inner.config.diagnosis_mode,
            "healing coordinator started"
        );
        Ok(CoordinatorHandle {
            inner: Arc::clone(&self.inner),
            dispatcher,
        })
    }

    /// Dispatch one event directly, bypassing the bus subscription
    pub async fn handle_event(&self, event: Event) -> Dispatch {
        self.inner.dispatch(event).await
    }

    /// Correlation ids of open workflows
    #[must_use]
    pub fn active_workflows(&self) -> Vec<CorrelationId> {
        self.inner.table.ids()
    }

    /// Snapshot of one workflow record
    #[must_use]
    pub fn workflow(&self, id: &CorrelationId) -> Option<WorkflowRecord> {
        self.inner.table.snapshot(id)
    }

    /// Check if the dispatch loop is running
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Get coordinator statistics
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        let stats = &self.inner.stats;
        CoordinatorStats {
            started: stats.started.load(Ordering::Relaxed),
            succeeded: stats.succeeded.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            ignored: stats.ignored.load(Ordering::Relaxed),
            active: self.inner.table.len(),
        }
    }

    /// Get configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.inner.config)
            .field("active", &self.inner.table.len())
            .finish_non_exhaustive()
    }
}

/// Handle to a started coordinator
pub struct CoordinatorHandle {
    inner: Arc<CoordinatorInner>,
    dispatcher: JoinHandle<()>,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("active", &self.inner.table.len())
            .field("finished", &self.dispatcher.is_finished())
            .finish()
    }
}

impl CoordinatorHandle {
    /// Stop accepting events and drain in-flight workflows
    ///
    /// Pipelines that have not reached Apply stop at their next stage
    /// boundary. After the grace period the rest are aborted; their patches
    /// are rolled back if Apply had started, and each gets a `Failed`
    /// completion.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self { inner, dispatcher } = self;
        inner.shutdown.send_replace(true);
        if let Err(err) = dispatcher.await {
            warn!(error = %err, "dispatch loop ended abnormally");
        }

        let in_flight = inner.table.len();
        let mut tasks = std::mem::take(&mut *inner.tasks.lock());
        let deadline = tokio::time::Instant::now() + inner.config.shutdown_grace();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = tasks.len(), "shutdown grace period elapsed; aborting pipelines");
                    break;
                }
            }
        }
        tasks.shutdown().await;

        let mut report = ShutdownReport::default();
        for id in inner.table.ids() {
            let Some(record) = inner.table.take(&id) else {
                continue;
            };
            if record.stage.is_post_apply() {
                if let Some(file) = record.target_file.as_deref() {
                    if inner.rollback(&id, file).await {
                        report.rolled_back += 1;
                    }
                }
            }
            inner
                .complete(
                    record,
                    Err(StageFailure::new(FailureReason::Cancelled, "cancelled during shutdown")),
                )
                .await;
            report.cancelled += 1;
        }
        report.completed = in_flight.saturating_sub(report.cancelled);

        inner.running.store(false, Ordering::SeqCst);
        info!(
            completed = report.completed,
            cancelled = report.cancelled,
            rolled_back = report.rolled_back,
            "healing coordinator stopped"
        );
        report
    }

    /// Check if the dispatch loop has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.dispatcher.is_finished()
    }
}

/// Resolve once shutdown has been signalled
async fn stopped(stop: &mut watch::Receiver<bool>) {
    // The returned guard is not Send; drop it here
    let _ = stop.wait_for(|stopping| *stopping).await;
}

impl CoordinatorInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn dispatch_loop(self: Arc<Self>, mut subscription: Subscription) {
        let mut stop = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                () = stopped(&mut stop) => break,
                event = subscription.recv() => match event {
                    Some(event) => {
                        let event_type = event.event_type;
                        let outcome = self.dispatch(event).await;
                        debug!(%event_type, ?outcome, "event dispatched");
                        self.reap();
                    }
                    None => {
                        warn!("event bus closed; dispatch loop stopping");
                        break;
                    }
                },
            }
        }
    }

    /// Collect finished pipeline tasks
    fn reap(&self) {
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            if let Err(err) = result {
                if err.is_panic() {
                    error!("healing task panicked outside the pipeline boundary");
                }
            }
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().spawn(task);
    }

    async fn dispatch(self: &Arc<Self>, event: Event) -> Dispatch {
        let outcome = self.route(event).await;
        if let Dispatch::Ignored(reason) = outcome {
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            debug!(?reason, "event ignored");
        }
        outcome
    }

    async fn route(self: &Arc<Self>, event: Event) -> Dispatch {
        let Some(id) = event.correlation_id().cloned() else {
            return Dispatch::Ignored(IgnoreReason::MissingCorrelationId);
        };
        if self.is_shutting_down() {
            return Dispatch::Ignored(IgnoreReason::ShuttingDown);
        }
        if self.completed.contains_key(&id) {
            debug!(correlation_id = %id, "event for recently completed workflow dropped");
            return Dispatch::Ignored(IgnoreReason::RecentlyCompleted);
        }

        match event.event_type {
            event_type if event_type.is_failure() => self.on_failure(id, &event).await,
            EventType::DiagnosisReady => self.on_diagnosis(id, &event).await,
            _ => Dispatch::Ignored(IgnoreReason::UnsubscribedType),
        }
    }

    async fn on_failure(self: &Arc<Self>, id: CorrelationId, event: &Event) -> Dispatch {
        let failure = match FailureContext::from_payload(&event.payload) {
            Ok(failure) => failure,
            Err(err) => {
                warn!(correlation_id = %id, error = %err, "malformed failure payload dropped");
                return Dispatch::Ignored(IgnoreReason::MalformedPayload);
            }
        };

        let inline = self.config.diagnosis_mode == DiagnosisMode::Inline;
        if !self.table.try_open(&id, Some(failure), inline) {
            debug!(correlation_id = %id, "failure for in-progress workflow discarded");
            return Dispatch::Ignored(IgnoreReason::AlreadyInProgress);
        }
        if !self.keep_opened(&id) {
            return Dispatch::Ignored(IgnoreReason::RecentlyCompleted);
        }

        self.stats.started.fetch_add(1, Ordering::Relaxed);
        info!(correlation_id = %id, trigger = %event.event_type, "healing workflow opened");
        self.announce_start(&id, event.event_type).await;

        if inline {
            self.spawn_pipeline(id, None);
            Dispatch::Started
        } else {
            self.spawn_diagnosis_deadline(id);
            Dispatch::AwaitingDiagnosis
        }
    }

    async fn on_diagnosis(self: &Arc<Self>, id: CorrelationId, event: &Event) -> Dispatch {
        let diagnosis = match Diagnosis::from_payload(&event.payload) {
            Ok(diagnosis) => diagnosis,
            Err(err) => {
                warn!(correlation_id = %id, error = %err, "malformed diagnosis payload dropped");
                return Dispatch::Ignored(IgnoreReason::MalformedPayload);
            }
        };

        match self.table.claim_or_open(&id) {
            Claim::Opened => {
                if !self.keep_opened(&id) {
                    return Dispatch::Ignored(IgnoreReason::RecentlyCompleted);
                }
                self.stats.started.fetch_add(1, Ordering::Relaxed);
                info!(correlation_id = %id, playbook = %diagnosis.playbook, "healing workflow opened from diagnosis");
                self.announce_start(&id, event.event_type).await;
                self.spawn_pipeline(id, Some(diagnosis));
                Dispatch::Started
            }
            Claim::Claimed => {
                info!(correlation_id = %id, playbook = %diagnosis.playbook, "diagnosis received; resuming workflow");
                self.spawn_pipeline(id, Some(diagnosis));
                Dispatch::Resumed
            }
            Claim::AlreadyClaimed => {
                debug!(correlation_id = %id, "duplicate diagnosis absorbed");
                Dispatch::Absorbed
            }
        }
    }

    fn spawn_pipeline(self: &Arc<Self>, id: CorrelationId, diagnosis: Option<Diagnosis>) {
        let inner = Arc::clone(self);
        self.spawn(async move { inner.run_workflow(id, diagnosis).await });
    }

    fn spawn_diagnosis_deadline(self: &Arc<Self>, id: CorrelationId) {
        let inner = Arc::clone(self);
        let timeout = self.config.diagnosis_timeout();
        let mut stop = self.shutdown.subscribe();
        self.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => inner.expire_diagnosis_wait(&id).await,
                () = stopped(&mut stop) => {}
            }
        });
    }

    /// End a workflow still waiting for its diagnosis
    ///
    /// The id is marked completed before the record leaves the table.
    async fn expire_diagnosis_wait(&self, id: &CorrelationId) {
        if self.table.stage(id) != Some(Stage::AwaitingDiagnosis) {
            return;
        }
        self.completed.insert(id.clone(), ()).await;
        if let Some(record) = self.table.take_if_awaiting(id) {
            warn!(correlation_id = %id, "no diagnosis arrived in time");
            self.complete(
                record,
                Err(StageFailure::new(FailureReason::DiagnosisTimedOut, "diagnosis timed out")),
            )
            .await;
        }
    }

    /// Undo a record opened for an id that completed meanwhile
    ///
    /// Returns `false` (and drops the record) if the id is marked completed.
    fn keep_opened(&self, id: &CorrelationId) -> bool {
        if !self.completed.contains_key(id) {
            return true;
        }
        self.table.take(id);
        debug!(correlation_id = %id, "reopened workflow for completed id dropped");
        false
    }

    async fn announce_start(&self, id: &CorrelationId, trigger: EventType) {
        let stage = self.table.stage(id).map(|stage| stage.as_str());
        self.publish(
            Event::for_correlation(
                EventType::HealStarted,
                id,
                json!({ "trigger": trigger.as_str(), "stage": stage }),
            )
            .with_ui_hint("healing_started"),
        )
        .await;
    }

    /// Publish, logging instead of failing
    pub(crate) async fn publish(&self, event: Event) {
        let event_type = event.event_type;
        if let Err(err) = self.bus.publish(event).await {
            warn!(%event_type, error = %err, "failed to publish event");
        }
    }
}
