//! Label enforcement over parsed expressions.
//!
//! The tree walk is mechanism; what happens when a query already carries a
//! matcher on the enforced label is policy, supplied as [`ConflictPolicy`].

use crate::promql::{Expr, LabelMatcher};
use thiserror::Error;

/// What to do when a selector already has a matcher on the enforced label
/// with a different value or operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Silently replace the existing matcher with the injected one.
    Replace,
    /// Fail the request.
    Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnforceError {
    #[error("label matcher value ({existing}) conflicts with injected value ({injected})")]
    IllegalMatcher { existing: String, injected: String },
}

/// Injects a set of matchers into every selector of an expression.
pub struct Enforcer {
    matchers: Vec<LabelMatcher>,
    policy: ConflictPolicy,
}

impl Enforcer {
    pub fn new(policy: ConflictPolicy, matchers: Vec<LabelMatcher>) -> Self {
        Self { matchers, policy }
    }

    /// Walk the expression and reconcile every vector and matrix selector
    /// with the injected matchers.
    pub fn enforce_expr(&self, expr: &mut Expr) -> Result<(), EnforceError> {
        expr.for_each_selector(&mut |selector| self.enforce_matchers(&mut selector.matchers))
    }

    /// Reconcile one matcher list. Matchers on other labels are untouched; an
    /// identical matcher is kept in place; a conflicting one is replaced or
    /// rejected depending on the policy. The injected matcher ends up in the
    /// list exactly once.
    pub fn enforce_matchers(&self, matchers: &mut Vec<LabelMatcher>) -> Result<(), EnforceError> {
        for injected in &self.matchers {
            let mut kept = Vec::with_capacity(matchers.len() + 1);
            let mut present = false;
            for existing in matchers.drain(..) {
                if existing.name != injected.name {
                    kept.push(existing);
                    continue;
                }
                if existing == *injected {
                    if !present {
                        kept.push(existing);
                        present = true;
                    }
                    continue;
                }
                match self.policy {
                    ConflictPolicy::Error => {
                        return Err(EnforceError::IllegalMatcher {
                            existing: existing.to_string(),
                            injected: injected.to_string(),
                        });
                    }
                    ConflictPolicy::Replace => {}
                }
            }
            if !present {
                kept.push(injected.clone());
            }
            *matchers = kept;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promql::{parse_expr, MatchOp};

    fn tenant(value: &str) -> LabelMatcher {
        LabelMatcher::new(MatchOp::Equal, "tenant", value)
    }

    fn enforce(policy: ConflictPolicy, query: &str) -> Result<String, EnforceError> {
        let mut expr = parse_expr(query).unwrap();
        Enforcer::new(policy, vec![tenant("a")]).enforce_expr(&mut expr)?;
        Ok(expr.to_string())
    }

    #[test]
    fn injects_into_bare_selector() {
        assert_eq!(
            enforce(ConflictPolicy::Replace, "up").unwrap(),
            r#"up{tenant="a"}"#
        );
    }

    #[test]
    fn keeps_identical_matcher_unchanged() {
        assert_eq!(
            enforce(ConflictPolicy::Replace, r#"up{tenant="a"}"#).unwrap(),
            r#"up{tenant="a"}"#
        );
        assert_eq!(
            enforce(ConflictPolicy::Error, r#"up{tenant="a"}"#).unwrap(),
            r#"up{tenant="a"}"#
        );
    }

    #[test]
    fn replaces_conflicting_matcher() {
        assert_eq!(
            enforce(ConflictPolicy::Replace, r#"up{tenant="b"}"#).unwrap(),
            r#"up{tenant="a"}"#
        );
        // A different operator on the same label is also a conflict.
        assert_eq!(
            enforce(ConflictPolicy::Replace, r#"up{tenant=~"b.*"}"#).unwrap(),
            r#"up{tenant="a"}"#
        );
    }

    #[test]
    fn conflict_fails_under_strict_policy() {
        let err = enforce(ConflictPolicy::Error, r#"up{tenant="b"}"#).unwrap_err();
        assert_eq!(
            err,
            EnforceError::IllegalMatcher {
                existing: r#"tenant="b""#.to_string(),
                injected: r#"tenant="a""#.to_string(),
            }
        );
    }

    #[test]
    fn other_labels_are_preserved() {
        assert_eq!(
            enforce(ConflictPolicy::Replace, r#"up{job="api",tenant="b",env="prod"}"#).unwrap(),
            r#"up{job="api",env="prod",tenant="a"}"#
        );
    }

    #[test]
    fn injects_into_every_selector() {
        assert_eq!(
            enforce(
                ConflictPolicy::Replace,
                r#"rate(x[5m]) / on (job) sum by (job) (rate(y[5m]))"#
            )
            .unwrap(),
            r#"rate(x{tenant="a"}[5m]) / on (job) sum by (job) (rate(y{tenant="a"}[5m]))"#
        );
    }

    #[test]
    fn injects_inside_subquery() {
        assert_eq!(
            enforce(ConflictPolicy::Replace, "max_over_time(rate(x[5m])[30m:1m])").unwrap(),
            r#"max_over_time(rate(x{tenant="a"}[5m])[30m:1m])"#
        );
    }

    #[test]
    fn strict_mode_checks_every_selector() {
        let err = enforce(ConflictPolicy::Error, r#"up or up{tenant="b"}"#).unwrap_err();
        assert!(matches!(err, EnforceError::IllegalMatcher { .. }));
    }

    #[test]
    fn duplicate_identical_matchers_collapse() {
        assert_eq!(
            enforce(ConflictPolicy::Replace, r#"up{tenant="a",tenant="a"}"#).unwrap(),
            r#"up{tenant="a"}"#
        );
    }

    #[test]
    fn literals_have_nothing_to_enforce() {
        assert_eq!(enforce(ConflictPolicy::Replace, "42").unwrap(), "42");
    }
}
