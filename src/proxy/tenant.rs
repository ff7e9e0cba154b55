//! Tenant matcher model and value resolution.
//!
//! The matcher is derived once per request (static configuration or request
//! parameter), carried through the handler pipeline, and converted on demand
//! into the representation each rewriter needs: a query-language matcher, an
//! Alertmanager filter string, or a silence matcher object.

use crate::promql::{LabelMatcher, MatchOp};
use crate::proxy::error::ApiError;
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl MatchKind {
    pub fn op(&self) -> MatchOp {
        match self {
            MatchKind::Equal => MatchOp::Equal,
            MatchKind::NotEqual => MatchOp::NotEqual,
            MatchKind::Regex => MatchOp::Regex,
            MatchKind::NotRegex => MatchOp::NotRegex,
        }
    }
}

/// The single matcher enforced on behalf of the caller.
#[derive(Debug, Clone)]
pub struct TenantMatcher {
    pub kind: MatchKind,
    pub name: String,
    pub value: String,
    regex: Option<Regex>,
}

impl PartialEq for TenantMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.value == other.value
    }
}

impl TenantMatcher {
    /// Build a matcher; regex kinds are compiled (fully anchored, the same
    /// semantics the metrics server applies) so an invalid expression is
    /// rejected before anything is forwarded.
    pub fn new(kind: MatchKind, name: impl Into<String>, value: impl Into<String>) -> Result<Self, ApiError> {
        let name = name.into();
        let value = value.into();
        let regex = match kind {
            MatchKind::Regex | MatchKind::NotRegex => {
                let re = Regex::new(&format!("^(?:{})$", value)).map_err(|err| {
                    ApiError::BadRequest(format!(
                        "invalid regex value for the {} label: {}",
                        name, err
                    ))
                })?;
                Some(re)
            }
            _ => None,
        };
        Ok(Self {
            kind,
            name,
            value,
            regex,
        })
    }

    /// Whether a label value satisfies this matcher. Absent labels compare as
    /// the empty string.
    pub fn matches(&self, value: &str) -> bool {
        match self.kind {
            MatchKind::Equal => value == self.value,
            MatchKind::NotEqual => value != self.value,
            MatchKind::Regex => self.regex.as_ref().is_some_and(|re| re.is_match(value)),
            MatchKind::NotRegex => !self.regex.as_ref().is_some_and(|re| re.is_match(value)),
        }
    }

    pub fn to_label_matcher(&self) -> LabelMatcher {
        LabelMatcher::new(self.kind.op(), self.name.clone(), self.value.clone())
    }

    /// The matcher as a standalone selector, e.g. `{tenant_id="team-a"}`.
    pub fn to_selector(&self) -> String {
        format!("{{{}}}", self.to_label_matcher())
    }
}

impl fmt::Display for TenantMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_label_matcher())
    }
}

/// Split an optional matcher-kind prefix (`!~`, `~`, `!`) off a raw tenant
/// value and trim one pair of surrounding double quotes.
pub fn classify_value(raw: &str) -> (MatchKind, &str) {
    let (kind, rest) = if let Some(rest) = raw.strip_prefix("!~") {
        (MatchKind::NotRegex, rest)
    } else if let Some(rest) = raw.strip_prefix('~') {
        (MatchKind::Regex, rest)
    } else if let Some(rest) = raw.strip_prefix('!') {
        (MatchKind::NotEqual, rest)
    } else {
        (MatchKind::Equal, raw)
    };
    let rest = rest.strip_prefix('"').unwrap_or(rest);
    let rest = rest.strip_suffix('"').unwrap_or(rest);
    (kind, rest)
}

/// Resolve the tenant value from the static configuration and the request
/// parameter, enforcing that exactly one of the two supplies it.
pub fn resolve_value(
    label: &str,
    static_value: Option<&str>,
    request_value: Option<&str>,
) -> Result<String, ApiError> {
    let request_value = request_value.filter(|v| !v.is_empty());
    match (static_value, request_value) {
        (Some(_), Some(_)) => Err(ApiError::BadRequest(format!(
            "a static value for the {} label has already been specified",
            label
        ))),
        (None, None) => Err(ApiError::BadRequest(format!(
            "the {:?} query parameter must be provided",
            label
        ))),
        (Some(value), None) => Ok(value.to_string()),
        (None, Some(value)) => Ok(value.to_string()),
    }
}
