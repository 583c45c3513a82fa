//! In-memory patch applier
//!
//! The only component that writes source text. Every apply keeps a backup
//! keyed by correlation id so a later rollback can restore it exactly once.

use crate::catalog::{CATALOG_SYNC_FILE, CATALOG_SYNC_SOURCE};
use async_trait::async_trait;
use dashmap::DashMap;
use heal_core::{ApplyService, Patch, ServiceError};
use heal_events::{CorrelationId, Event, EventBus, EventType};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct Backup {
    file: String,
    original_text: String,
}

/// Source store with reversible edits
#[derive(Default)]
pub struct InMemoryPatchApplier {
    files: DashMap<String, String>,
    backups: DashMap<CorrelationId, Backup>,
    bus: Option<Arc<dyn EventBus>>,
}

impl InMemoryPatchApplier {
    /// Create new empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the demo catalog sync module
    #[must_use]
    pub fn with_demo_sources() -> Self {
        Self::new().with_file(CATALOG_SYNC_FILE, CATALOG_SYNC_SOURCE)
    }

    /// With a file
    #[must_use]
    pub fn with_file(self, path: impl Into<String>, text: impl Into<String>) -> Self {
        self.files.insert(path.into(), text.into());
        self
    }

    /// With a bus for `reload.done` / `rollback.done` events
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Current text of a file
    #[must_use]
    pub fn file(&self, path: &str) -> Option<String> {
        self.files.get(path).map(|text| text.clone())
    }

    /// Check if a backup is held for `correlation_id`
    #[must_use]
    pub fn has_backup(&self, correlation_id: &CorrelationId) -> bool {
        self.backups.contains_key(correlation_id)
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(event).await {
                warn!(error = %err, "failed to publish applier event");
            }
        }
    }
}

impl std::fmt::Debug for InMemoryPatchApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPatchApplier")
            .field("files", &self.files.len())
            .field("backups", &self.backups.len())
            .finish_non_exhaustive()
    }
}

fn service_name(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().unwrap_or(name)
}

#[async_trait]
impl ApplyService for InMemoryPatchApplier {
    async fn apply(&self, patch: &Patch, correlation_id: &CorrelationId) -> Result<bool, ServiceError> {
        let file = patch.target_file.as_str();
        {
            let mut current = self
                .files
                .get_mut(file)
                .ok_or_else(|| ServiceError::NotFound(file.to_string()))?;

            if *current != patch.original_text {
                warn!(correlation_id = %correlation_id, %file, "source changed since patch was generated");
                return Ok(false);
            }

            // First apply for an id owns the backup
            self.backups
                .entry(correlation_id.clone())
                .or_insert_with(|| Backup {
                    file: file.to_string(),
                    original_text: current.clone(),
                });
            current.clone_from(&patch.updated_text);
        }

        info!(correlation_id = %correlation_id, %file, lines = patch.changed_line_count, "patch applied");
        self.emit(
            Event::for_correlation(
                EventType::ReloadDone,
                correlation_id,
                json!({ "file": file, "service": service_name(file), "status": "reloaded" }),
            )
            .with_ui_hint("service_reloaded"),
        )
        .await;
        Ok(true)
    }

    async fn read_source(&self, path: &str) -> Result<String, ServiceError> {
        self.file(path)
            .ok_or_else(|| ServiceError::NotFound(path.to_string()))
    }

    async fn rollback(&self, path: &str, correlation_id: &CorrelationId) -> Result<bool, ServiceError> {
        let Some((_, backup)) = self.backups.remove_if(correlation_id, |_, backup| backup.file == path) else {
            warn!(correlation_id = %correlation_id, %path, "no backup to restore");
            return Ok(false);
        };

        self.files.insert(backup.file.clone(), backup.original_text);
        info!(correlation_id = %correlation_id, file = %backup.file, "patch rolled back");
        self.emit(
            Event::for_correlation(
                EventType::RollbackDone,
                correlation_id,
                json!({ "file": backup.file }),
            )
            .with_ui_hint("rolled_back"),
        )
        .await;
        Ok(true)
    }
}
