//! Template patch generator
//!
//! Turns a diagnosis patch spec into a concrete source edit. Supported
//! change types:
//! - `add_field`: append a field to a `NAME = [...]` list
//! - `add_default`: insert a default assignment after an anchor line
//!
//! Anything else yields no patch.

use async_trait::async_trait;
use heal_core::{Diagnosis, Patch, PatchService, ServiceError};
use heal_events::{CorrelationId, Event, EventBus, EventType};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Append `field` to the list assigned to `anchor`
///
/// Returns `None` if the list is absent or already holds the field.
#[must_use]
pub fn add_field(source: &str, anchor: &str, field: &str) -> Option<String> {
    let pattern = format!(r"(?m)^(\s*{}\s*=\s*\[)([^\]]*)(\])", regex::escape(anchor));
    let re = Regex::new(&pattern).ok()?;
    let captures = re.captures(source)?;
    let body = captures.get(2)?;

    let already_listed = body
        .as_str()
        .split(',')
        .any(|item| item.trim().trim_matches(|c| c == '"' || c == '\'') == field);
    if already_listed {
        return None;
    }

    let text = body.as_str();
    let (items, tail) = text.split_at(text.trim_end().len());
    let new_body = if items.trim().is_empty() {
        format!("\"{field}\"{tail}")
    } else if items.ends_with(',') {
        format!("{items} \"{field}\"{tail}")
    } else {
        format!("{items}, \"{field}\"{tail}")
    };

    let mut updated = String::with_capacity(source.len() + field.len() + 4);
    updated.push_str(&source[..body.start()]);
    updated.push_str(&new_body);
    updated.push_str(&source[body.end()..]);
    Some(updated)
}

/// Insert a default for `field` on the line after `anchor`
///
/// The new line is indented one level deeper than the anchor. Returns
/// `None` if no line contains the anchor.
#[must_use]
pub fn add_default(source: &str, anchor: &str, field: &str) -> Option<String> {
    let mut lines: Vec<&str> = source.lines().collect();
    let at = lines.iter().position(|line| line.contains(anchor))?;
    let indent: String = lines[at].chars().take_while(|c| c.is_whitespace()).collect();
    let default_line = format!("{indent}    data.setdefault(\"{field}\", None)");
    lines.insert(at + 1, &default_line);

    let mut updated = lines.join("\n");
    if source.ends_with('\n') {
        updated.push('\n');
    }
    Some(updated)
}

fn spec_str<'a>(diagnosis: &'a Diagnosis, key: &str) -> Option<&'a str> {
    diagnosis.patch_spec.get(key).and_then(Value::as_str)
}

/// Field a spec asks for, from `field` or the `+ 'name'` change text
fn spec_field(diagnosis: &Diagnosis) -> Option<String> {
    spec_str(diagnosis, "field")
        .map(str::to_string)
        .or_else(|| {
            spec_str(diagnosis, "change").map(|change| {
                change
                    .trim_start_matches('+')
                    .trim()
                    .trim_matches(|c| c == '"' || c == '\'')
                    .to_string()
            })
        })
        .filter(|field| !field.is_empty())
}

/// Patch generator driven by change-type templates
#[derive(Default)]
pub struct TemplatePatchGenerator {
    bus: Option<Arc<dyn EventBus>>,
}

impl TemplatePatchGenerator {
    /// Create new generator
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a bus for `patch.log` / `patch.generated` events
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Apply the diagnosis template to `source`
    ///
    /// # Errors
    /// Returns [`ServiceError::InvalidInput`] if the spec names no file.
    pub fn render(&self, diagnosis: &Diagnosis, source: &str) -> Result<Option<Patch>, ServiceError> {
        let file = diagnosis
            .target_file()
            .ok_or_else(|| ServiceError::InvalidInput("patch spec names no file".to_string()))?;
        let change_type = spec_str(diagnosis, "type").unwrap_or("unknown");
        let field = spec_field(diagnosis);

        let updated = match (change_type, field.as_deref()) {
            ("add_field", Some(field)) => {
                add_field(source, spec_str(diagnosis, "anchor").unwrap_or("POLICY_FIELDS"), field)
            }
            ("add_default", Some(field)) => spec_str(diagnosis, "anchor")
                .and_then(|anchor| add_default(source, anchor, field)),
            _ => None,
        };

        Ok(updated
            .filter(|updated| updated != source)
            .map(|updated| Patch::new(file, source, updated)))
    }

    async fn log(&self, id: &CorrelationId, line: String) {
        self.emit(Event::for_correlation(
            EventType::PatchLog,
            id,
            json!({ "message": line }),
        ))
        .await;
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(event).await {
                warn!(error = %err, "failed to publish patch event");
            }
        }
    }
}

impl std::fmt::Debug for TemplatePatchGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplatePatchGenerator")
            .field("publishes", &self.bus.is_some())
            .finish()
    }
}

#[async_trait]
impl PatchService for TemplatePatchGenerator {
    async fn generate(
        &self,
        diagnosis: &Diagnosis,
        source_text: &str,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Patch>, ServiceError> {
        let change_type = spec_str(diagnosis, "type").unwrap_or("unknown");
        self.log(
            correlation_id,
            format!(
                "generating {change_type} patch for {}",
                diagnosis.target_file().unwrap_or("unknown")
            ),
        )
        .await;

        let patch = self.render(diagnosis, source_text)?;
        match &patch {
            Some(patch) => {
                info!(correlation_id = %correlation_id, diff = %patch.diff_summary(), "template applied");
                self.log(
                    correlation_id,
                    format!("{} lines changed", patch.changed_line_count),
                )
                .await;
                let preview: Vec<&String> = patch.diff_lines.iter().take(10).collect();
                self.emit(
                    Event::for_correlation(
                        EventType::PatchGenerated,
                        correlation_id,
                        json!({
                            "file": patch.target_file,
                            "changed_line_count": patch.changed_line_count,
                            "diff_preview": preview,
                        }),
                    )
                    .with_ui_hint("patch_generated"),
                )
                .await;
            }
            None => {
                debug!(correlation_id = %correlation_id, %change_type, "template produced no change");
                self.log(correlation_id, format!("no change produced for {change_type}"))
                    .await;
            }
        }
        Ok(patch)
    }
}
