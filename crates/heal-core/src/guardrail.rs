//! Guardrail safety rule
//!
//! Risk scores are lower-is-safer. A patch is safe iff no failing check
//! carries a risk above [`SAFETY_RISK_THRESHOLD`].

use crate::types::GuardrailCheck;

/// Failing checks above this risk reject a patch
pub const SAFETY_RISK_THRESHOLD: f64 = 0.5;

/// Check whether a set of guardrail results allows applying the patch
#[must_use]
pub fn is_safe(checks: &[GuardrailCheck]) -> bool {
    !checks
        .iter()
        .any(|check| !check.passed && check.risk_score > SAFETY_RISK_THRESHOLD)
}

/// Names of the rules that block the patch
#[must_use]
pub fn rejected_rules(checks: &[GuardrailCheck]) -> Vec<&str> {
    checks
        .iter()
        .filter(|check| !check.passed && check.risk_score > SAFETY_RISK_THRESHOLD)
        .map(|check| check.rule_name.as_str())
        .collect()
}

/// Aggregate risk: mean failed-check risk over all checks, capped at 1.0
///
/// An empty battery is maximally risky.
#[must_use]
pub fn total_risk(checks: &[GuardrailCheck]) -> f64 {
    if checks.is_empty() {
        return 1.0;
    }
    let failed: f64 = checks
        .iter()
        .filter(|check| !check.passed)
        .map(|check| check.risk_score)
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = failed / checks.len() as f64;
    mean.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn threshold_is_strict() {
        assert!(is_safe(&[GuardrailCheck::fail("patch_size", "big", 0.5)]));
        assert!(!is_safe(&[GuardrailCheck::fail("no_secrets", "key", 0.51)]));
        assert!(is_safe(&[]));
    }

    #[test]
    fn rejected_rules_lists_blocking_checks() {
        let checks = vec![
            GuardrailCheck::pass("file_allowlist", "ok"),
            GuardrailCheck::fail("patch_size", "slightly big", 0.2),
            GuardrailCheck::fail("no_dangerous_ops", "eval", 0.9),
        ];
        assert_eq!(rejected_rules(&checks), vec!["no_dangerous_ops"]);
        assert!(!is_safe(&checks));
    }

    #[test]
    fn total_risk_averages_failed_checks() {
        let checks = vec![
            GuardrailCheck::pass("a", "ok"),
            GuardrailCheck::fail("b", "bad", 0.8),
        ];
        assert!((total_risk(&checks) - 0.4).abs() < 1e-9);
        assert!((total_risk(&[]) - 1.0).abs() < f64::EPSILON);
    }

    fn arb_check() -> impl Strategy<Value = GuardrailCheck> {
        (any::<bool>(), 0.0f64..=1.0).prop_map(|(passed, risk)| GuardrailCheck {
            rule_name: "rule".into(),
            passed,
            message: String::new(),
            risk_score: risk,
        })
    }

    proptest! {
        #[test]
        fn passing_checks_never_block(risks in prop::collection::vec(0.0f64..=1.0, 0..10)) {
            let checks: Vec<_> = risks
                .into_iter()
                .map(|risk| GuardrailCheck { risk_score: risk, ..GuardrailCheck::pass("r", "") })
                .collect();
            prop_assert!(is_safe(&checks));
        }

        #[test]
        fn safe_iff_no_failed_check_over_threshold(checks in prop::collection::vec(arb_check(), 0..10)) {
            let expected = checks.iter().all(|c| c.passed || c.risk_score <= SAFETY_RISK_THRESHOLD);
            prop_assert_eq!(is_safe(&checks), expected);
            prop_assert_eq!(rejected_rules(&checks).is_empty(), expected);
        }

        #[test]
        fn total_risk_is_bounded(checks in prop::collection::vec(arb_check(), 0..10)) {
            let risk = total_risk(&checks);
            prop_assert!((0.0..=1.0).contains(&risk));
        }
    }
}
