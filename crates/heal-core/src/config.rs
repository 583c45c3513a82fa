//! Configuration
//!
//! [`SelfHealConfig`] gathers coordinator, guardrail and bus settings. Every
//! section has defaults, so a TOML file only needs the keys it overrides.

use crate::error::ConfigError;
use heal_events::BusConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the coordinator obtains a diagnosis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisMode {
    /// Coordinator calls the diagnosis service itself
    #[default]
    Inline,
    /// Coordinator waits for a diagnosis-ready event
    AwaitEvent,
}

impl std::str::FromStr for DiagnosisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(Self::Inline),
            "await_event" | "await-event" => Ok(Self::AwaitEvent),
            other => Err(format!("unknown diagnosis mode: {other}")),
        }
    }
}

impl std::fmt::Display for DiagnosisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Inline => "inline",
            Self::AwaitEvent => "await_event",
        })
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Diagnosis topology
    pub diagnosis_mode: DiagnosisMode,
    /// Bound on every collaborator call
    pub stage_timeout_secs: u64,
    /// Wait for a diagnosis-ready event in `await_event` mode
    pub diagnosis_timeout_secs: u64,
    /// Drain period for in-flight pipelines on shutdown
    pub shutdown_grace_secs: u64,
    /// How long completed ids are remembered
    pub completed_retention_secs: u64,
    /// How many completed ids are remembered
    pub completed_retention_capacity: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            diagnosis_mode: DiagnosisMode::Inline,
            stage_timeout_secs: 30,
            diagnosis_timeout_secs: 60,
            shutdown_grace_secs: 10,
            completed_retention_secs: 300,
            completed_retention_capacity: 10_000,
        }
    }
}

impl CoordinatorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With diagnosis mode
    #[inline]
    #[must_use]
    pub fn with_diagnosis_mode(mut self, mode: DiagnosisMode) -> Self {
        self.diagnosis_mode = mode;
        self
    }

    /// With stage timeout
    #[inline]
    #[must_use]
    pub fn with_stage_timeout_secs(mut self, secs: u64) -> Self {
        self.stage_timeout_secs = secs;
        self
    }

    /// With diagnosis timeout
    #[inline]
    #[must_use]
    pub fn with_diagnosis_timeout_secs(mut self, secs: u64) -> Self {
        self.diagnosis_timeout_secs = secs;
        self
    }

    /// With shutdown grace period
    #[inline]
    #[must_use]
    pub fn with_shutdown_grace_secs(mut self, secs: u64) -> Self {
        self.shutdown_grace_secs = secs;
        self
    }

    /// With completed-id retention
    #[inline]
    #[must_use]
    pub fn with_completed_retention_secs(mut self, secs: u64) -> Self {
        self.completed_retention_secs = secs;
        self
    }

    #[inline]
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    #[inline]
    #[must_use]
    pub fn diagnosis_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnosis_timeout_secs)
    }

    #[inline]
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    #[inline]
    #[must_use]
    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    /// Check value bounds
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for zero timeouts or capacities.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("coordinator.stage_timeout_secs", self.stage_timeout_secs),
            ("coordinator.diagnosis_timeout_secs", self.diagnosis_timeout_secs),
            ("coordinator.completed_retention_secs", self.completed_retention_secs),
            (
                "coordinator.completed_retention_capacity",
                self.completed_retention_capacity,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Guardrail configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Maximum changed lines per patch
    pub max_patch_size_lines: usize,
    /// Maximum files touched by one patch
    pub max_files_per_patch: usize,
    /// Glob-style patterns a patch target must match
    pub allowed_file_patterns: Vec<String>,
    /// Glob-style patterns a patch target must not match
    pub forbidden_file_patterns: Vec<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_patch_size_lines: 30,
            max_files_per_patch: 2,
            allowed_file_patterns: vec![
                "services/catalog_sync.*".to_string(),
                "mappings/policy_fields.*".to_string(),
                "handlers/return_policy.*".to_string(),
            ],
            forbidden_file_patterns: vec![
                "*.env".to_string(),
                "config/*".to_string(),
                "secrets/*".to_string(),
                "infrastructure/*".to_string(),
            ],
        }
    }
}

impl GuardrailConfig {
    /// With maximum patch size
    #[inline]
    #[must_use]
    pub fn with_max_patch_size_lines(mut self, lines: usize) -> Self {
        self.max_patch_size_lines = lines;
        self
    }

    /// With an additional allowed pattern
    #[must_use]
    pub fn allow(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_file_patterns.push(pattern.into());
        self
    }

    /// Check value bounds
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for a zero size limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_patch_size_lines == 0 {
            return Err(ConfigError::Invalid {
                field: "guardrails.max_patch_size_lines",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_files_per_patch == 0 {
            return Err(ConfigError::Invalid {
                field: "guardrails.max_files_per_patch",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfHealConfig {
    /// Coordinator settings
    pub coordinator: CoordinatorConfig,
    /// Guardrail settings
    pub guardrails: GuardrailConfig,
    /// In-memory bus settings
    pub bus: BusConfig,
}

impl SelfHealConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With coordinator settings
    #[inline]
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// With guardrail settings
    #[inline]
    #[must_use]
    pub fn with_guardrails(mut self, guardrails: GuardrailConfig) -> Self {
        self.guardrails = guardrails;
        self
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns [`ConfigError`] on syntax errors or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Returns [`ConfigError::Render`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every section
    ///
    /// # Errors
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate()?;
        self.guardrails.validate()?;
        if self.bus.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.channel_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.bus.history_max_correlations == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.history_max_correlations",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
