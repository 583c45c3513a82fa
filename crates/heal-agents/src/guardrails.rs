//! Guardrail engine
//!
//! Static safety checks over a proposed patch. Risk is lower-is-safer; a
//! failing check above the safety threshold blocks the patch.
//!
//! Rules, in order:
//! - `file_allowlist`: target must match an allowed pattern (0.8 on miss)
//! - `file_forbidden`: target must not match a forbidden pattern (1.0)
//! - `patch_size`: changed lines within the limit
//! - `no_secrets`: no credential-looking literals (1.0)
//! - `no_dangerous_ops`: no shell, eval or destructive calls (0.9)

use async_trait::async_trait;
use dashmap::DashMap;
use heal_core::{is_safe, total_risk, GuardrailCheck, GuardrailConfig, GuardrailService, Patch, ServiceError};
use regex::Regex;
use tracing::{debug, warn};

const SECRET_PATTERNS: [&str; 5] = [
    r#"password\s*=\s*["'][^"']+["']"#,
    r#"api_key\s*=\s*["'][^"']+["']"#,
    r#"secret\s*=\s*["'][^"']+["']"#,
    r#"token\s*=\s*["'][^"']+["']"#,
    r#"["'][a-f0-9]{32,}["']"#,
];

const DANGEROUS_PATTERNS: [&str; 8] = [
    r"os\.system\s*\(",
    r"subprocess\.",
    r"eval\s*\(",
    r"exec\s*\(",
    r"__import__\s*\(",
    r#"open\s*\(.+["']w["']"#,
    r"rm\s+-rf",
    r"delete\s+from\s+\w+\s*;",
];

type Rule = fn(&GuardrailEngine, &Patch) -> Result<GuardrailCheck, regex::Error>;

const RULES: [(&str, Rule); 5] = [
    ("file_allowlist", GuardrailEngine::check_file_allowlist),
    ("file_forbidden", GuardrailEngine::check_file_forbidden),
    ("patch_size", GuardrailEngine::check_patch_size),
    ("no_secrets", GuardrailEngine::check_no_secrets),
    ("no_dangerous_ops", GuardrailEngine::check_no_dangerous_ops),
];

/// Anchored regex for a file pattern
///
/// `*` matches any run of characters; the rest of the pattern is regex
/// syntax, so a malformed pattern fails its rule.
#[must_use]
pub fn glob_to_regex(pattern: &str) -> String {
    format!("^{}$", pattern.replace('*', ".*"))
}

/// Outcome of a full guardrail run
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailVerdict {
    /// Every check, in rule order
    pub checks: Vec<GuardrailCheck>,
    /// Whether the patch may be applied
    pub safe: bool,
    /// Mean failed risk over all checks
    pub total_risk: f64,
}

/// Rule-based guardrail battery
#[derive(Debug)]
pub struct GuardrailEngine {
    config: GuardrailConfig,
    compiled: DashMap<String, Regex>,
}

impl GuardrailEngine {
    /// Create new engine
    #[must_use]
    pub fn new(config: GuardrailConfig) -> Self {
        Self {
            config,
            compiled: DashMap::new(),
        }
    }

    /// Get configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// Run every rule; a rule that errors fails with risk 1.0
    #[must_use]
    pub fn run(&self, patch: &Patch) -> Vec<GuardrailCheck> {
        RULES
            .iter()
            .map(|(name, rule)| {
                rule(self, patch).unwrap_or_else(|err| {
                    warn!(rule = *name, error = %err, "guardrail rule errored");
                    GuardrailCheck::fail(*name, format!("guardrail check failed: {err}"), 1.0)
                })
            })
            .collect()
    }

    /// Run every rule and summarize
    #[must_use]
    pub fn evaluate(&self, patch: &Patch) -> GuardrailVerdict {
        let checks = self.run(patch);
        GuardrailVerdict {
            safe: is_safe(&checks),
            total_risk: total_risk(&checks),
            checks,
        }
    }

    fn regex(&self, pattern: &str) -> Result<Regex, regex::Error> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern)?;
        self.compiled.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    fn first_glob_match<'a>(&self, patterns: &'a [String], path: &str) -> Result<Option<&'a str>, regex::Error> {
        for pattern in patterns {
            if self.regex(&glob_to_regex(pattern))?.is_match(path) {
                return Ok(Some(pattern));
            }
        }
        Ok(None)
    }

    fn check_file_allowlist(&self, patch: &Patch) -> Result<GuardrailCheck, regex::Error> {
        let file = &patch.target_file;
        Ok(match self.first_glob_match(&self.config.allowed_file_patterns, file)? {
            Some(pattern) => GuardrailCheck::pass(
                "file_allowlist",
                format!("File {file} matches allowed pattern {pattern}"),
            ),
            None => GuardrailCheck::fail(
                "file_allowlist",
                format!("File {file} not in allowed patterns"),
                0.8,
            ),
        })
    }

    fn check_file_forbidden(&self, patch: &Patch) -> Result<GuardrailCheck, regex::Error> {
        let file = &patch.target_file;
        Ok(match self.first_glob_match(&self.config.forbidden_file_patterns, file)? {
            Some(pattern) => GuardrailCheck::fail(
                "file_forbidden",
                format!("File {file} matches forbidden pattern {pattern}"),
                1.0,
            ),
            None => GuardrailCheck::pass(
                "file_forbidden",
                format!("File {file} not in forbidden patterns"),
            ),
        })
    }

    #[allow(clippy::unnecessary_wraps, clippy::cast_precision_loss)]
    fn check_patch_size(&self, patch: &Patch) -> Result<GuardrailCheck, regex::Error> {
        let changed = patch.changed_line_count;
        let max = self.config.max_patch_size_lines;
        if changed <= max {
            return Ok(GuardrailCheck::pass(
                "patch_size",
                format!("Patch size {changed} lines within limit {max}"),
            ));
        }
        let risk = ((changed - max) as f64 / max as f64).min(1.0);
        Ok(GuardrailCheck::fail(
            "patch_size",
            format!("Patch size {changed} lines exceeds limit {max}"),
            risk,
        ))
    }

    fn check_no_secrets(&self, patch: &Patch) -> Result<GuardrailCheck, regex::Error> {
        let content = patch.updated_text.to_lowercase();
        for pattern in SECRET_PATTERNS {
            if self.regex(pattern)?.is_match(&content) {
                return Ok(GuardrailCheck::fail(
                    "no_secrets",
                    "Potential secret detected in patch",
                    1.0,
                ));
            }
        }
        Ok(GuardrailCheck::pass("no_secrets", "No secrets detected"))
    }

    fn check_no_dangerous_ops(&self, patch: &Patch) -> Result<GuardrailCheck, regex::Error> {
        let content = patch.updated_text.to_lowercase();
        for pattern in DANGEROUS_PATTERNS {
            if self.regex(pattern)?.is_match(&content) {
                return Ok(GuardrailCheck::fail(
                    "no_dangerous_ops",
                    format!("Dangerous operation detected: {pattern}"),
                    0.9,
                ));
            }
        }
        Ok(GuardrailCheck::pass(
            "no_dangerous_ops",
            "No dangerous operations detected",
        ))
    }
}

impl Default for GuardrailEngine {
    fn default() -> Self {
        Self::new(GuardrailConfig::default())
    }
}

#[async_trait]
impl GuardrailService for GuardrailEngine {
    async fn validate(&self, patch: &Patch) -> Result<Vec<GuardrailCheck>, ServiceError> {
        let checks = self.run(patch);
        debug!(
            file = %patch.target_file,
            failed = checks.iter().filter(|check| !check.passed).count(),
            "guardrails evaluated"
        );
        Ok(checks)
    }
}
