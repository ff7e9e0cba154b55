//! Tenant enforcement for the Alertmanager surface: the `filter` parameter
//! grammar used by alert and silence listings, and the matcher list embedded
//! in silence objects.

use crate::promql::{LabelMatcher, MatchOp};
use crate::proxy::enforce::ConflictPolicy;
use crate::proxy::error::ApiError;
use crate::proxy::params::Params;
use crate::proxy::tenant::{MatchKind, TenantMatcher};
use serde_json::Value;

/// Parse one `filter` entry: `name=value`, `name!=value`, `name=~value` or
/// `name!~value`, with the value optionally double-quoted.
pub fn parse_filter(input: &str) -> Result<LabelMatcher, ApiError> {
    let input = input.trim();
    let idx = input
        .find(['=', '!'])
        .ok_or_else(|| bad_filter(input, "no operator"))?;
    let name = input[..idx].trim();
    if name.is_empty() {
        return Err(bad_filter(input, "empty label name"));
    }

    let rest = &input[idx..];
    let (op, value) = if let Some(v) = rest.strip_prefix("=~") {
        (MatchOp::Regex, v)
    } else if let Some(v) = rest.strip_prefix("!~") {
        (MatchOp::NotRegex, v)
    } else if let Some(v) = rest.strip_prefix("!=") {
        (MatchOp::NotEqual, v)
    } else if let Some(v) = rest.strip_prefix('=') {
        (MatchOp::Equal, v)
    } else {
        return Err(bad_filter(input, "invalid operator"));
    };

    let value = value.trim();
    let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        unescape(&value[1..value.len() - 1])
    } else {
        value.to_string()
    };

    Ok(LabelMatcher::new(op, name, value))
}

fn bad_filter(input: &str, reason: &str) -> ApiError {
    ApiError::BadRequest(format!("bad matcher format {:?}: {}", input, reason))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Reconcile the multi-valued `filter` query parameter with the tenant
/// matcher: existing entries must parse, entries on the tenant label follow
/// the conflict policy, and the tenant matcher is present exactly once
/// afterwards.
pub fn enforce_filter_params(
    params: &mut Params,
    matcher: &TenantMatcher,
    policy: ConflictPolicy,
) -> Result<(), ApiError> {
    let injected = matcher.to_label_matcher();
    let mut kept: Vec<String> = Vec::new();
    let mut present = false;

    for raw in params.get_all("filter") {
        let parsed = parse_filter(raw)?;
        if parsed.name != injected.name {
            kept.push(raw.to_string());
            continue;
        }
        if parsed == injected {
            if !present {
                kept.push(raw.to_string());
                present = true;
            }
            continue;
        }
        match policy {
            ConflictPolicy::Error => {
                return Err(ApiError::BadRequest(format!(
                    "label matcher value ({}) conflicts with injected value ({})",
                    parsed, injected
                )));
            }
            ConflictPolicy::Replace => {}
        }
    }
    if !present {
        kept.push(injected.to_string());
    }

    params.remove("filter");
    for entry in kept {
        params.push("filter", entry);
    }
    Ok(())
}

fn kind_of(is_regex: bool, is_equal: bool) -> MatchKind {
    match (is_regex, is_equal) {
        (false, true) => MatchKind::Equal,
        (false, false) => MatchKind::NotEqual,
        (true, true) => MatchKind::Regex,
        (true, false) => MatchKind::NotRegex,
    }
}

fn matcher_json(matcher: &TenantMatcher) -> Value {
    let (is_regex, is_equal) = match matcher.kind {
        MatchKind::Equal => (false, true),
        MatchKind::NotEqual => (false, false),
        MatchKind::Regex => (true, true),
        MatchKind::NotRegex => (true, false),
    };
    serde_json::json!({
        "name": matcher.name,
        "value": matcher.value,
        "isRegex": is_regex,
        "isEqual": is_equal,
    })
}

/// Whether one silence matcher object equals the tenant matcher (same label,
/// value and kind). `isEqual` defaults to true for pre-0.22 payloads.
fn matcher_equals(entry: &Value, matcher: &TenantMatcher) -> bool {
    let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
    if name != matcher.name {
        return false;
    }
    let value = entry.get("value").and_then(Value::as_str).unwrap_or("");
    let is_regex = entry.get("isRegex").and_then(Value::as_bool).unwrap_or(false);
    let is_equal = entry.get("isEqual").and_then(Value::as_bool).unwrap_or(true);
    kind_of(is_regex, is_equal) == matcher.kind && value == matcher.value
}

/// Enforce the tenant matcher inside a silence creation body. A matcher on
/// the tenant label that differs from the enforced one is rejected; otherwise
/// the matcher is added (once) and the body re-encoded.
pub fn enforce_silence_body(body: &[u8], matcher: &TenantMatcher) -> Result<Vec<u8>, ApiError> {
    let mut silence: Value = serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("failed to parse silence: {}", err)))?;

    let matchers = silence
        .get_mut("matchers")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| ApiError::BadRequest("silence contains no matchers".to_string()))?;

    let mut kept = Vec::with_capacity(matchers.len() + 1);
    let mut present = false;
    for entry in matchers.drain(..) {
        let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
        if name != matcher.name {
            kept.push(entry);
            continue;
        }
        if matcher_equals(&entry, matcher) {
            if !present {
                kept.push(entry);
                present = true;
            }
            continue;
        }
        return Err(ApiError::BadRequest(format!(
            "silence targets a different value for the {} label",
            matcher.name
        )));
    }
    if !present {
        kept.push(matcher_json(matcher));
    }
    *matchers = kept;

    serde_json::to_vec(&silence)
        .map_err(|err| ApiError::Internal(format!("failed to encode silence: {}", err)))
}

/// Whether a silence fetched from the upstream belongs to the tenant, i.e.
/// its matcher list contains the tenant matcher.
pub fn silence_belongs_to_tenant(silence: &Value, matcher: &TenantMatcher) -> bool {
    silence
        .get("matchers")
        .and_then(Value::as_array)
        .is_some_and(|matchers| matchers.iter().any(|entry| matcher_equals(entry, matcher)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant(value: &str) -> TenantMatcher {
        TenantMatcher::new(MatchKind::Equal, "tenant", value).unwrap()
    }

    #[test]
    fn parse_filter_forms() {
        assert_eq!(
            parse_filter(r#"tenant="a""#).unwrap(),
            LabelMatcher::new(MatchOp::Equal, "tenant", "a")
        );
        assert_eq!(
            parse_filter("severity!=page").unwrap(),
            LabelMatcher::new(MatchOp::NotEqual, "severity", "page")
        );
        assert_eq!(
            parse_filter(r#"env=~"prod|stage""#).unwrap(),
            LabelMatcher::new(MatchOp::Regex, "env", "prod|stage")
        );
        assert_eq!(
            parse_filter(r#"env!~dev.*"#).unwrap(),
            LabelMatcher::new(MatchOp::NotRegex, "env", "dev.*")
        );
    }

    #[test]
    fn parse_filter_rejects_garbage() {
        assert!(parse_filter("noequals").is_err());
        assert!(parse_filter("=value").is_err());
    }

    #[test]
    fn filter_param_is_appended() {
        let mut params = Params::parse("silenced=false");
        enforce_filter_params(&mut params, &tenant("a"), ConflictPolicy::Replace).unwrap();
        assert_eq!(params.get_all("filter"), vec![r#"tenant="a""#]);
    }

    #[test]
    fn existing_filters_are_kept() {
        let mut params = Params::default();
        params.push("filter", r#"severity="page""#);
        enforce_filter_params(&mut params, &tenant("a"), ConflictPolicy::Replace).unwrap();
        assert_eq!(
            params.get_all("filter"),
            vec![r#"severity="page""#, r#"tenant="a""#]
        );
    }

    #[test]
    fn conflicting_filter_is_replaced_or_rejected() {
        let mut params = Params::default();
        params.push("filter", r#"tenant="b""#);
        enforce_filter_params(&mut params, &tenant("a"), ConflictPolicy::Replace).unwrap();
        assert_eq!(params.get_all("filter"), vec![r#"tenant="a""#]);

        let mut params = Params::default();
        params.push("filter", r#"tenant="b""#);
        let err =
            enforce_filter_params(&mut params, &tenant("a"), ConflictPolicy::Error).unwrap_err();
        assert!(err.to_string().contains("conflicts with injected value"));
    }

    #[test]
    fn identical_filter_is_not_duplicated() {
        let mut params = Params::default();
        params.push("filter", r#"tenant="a""#);
        enforce_filter_params(&mut params, &tenant("a"), ConflictPolicy::Replace).unwrap();
        assert_eq!(params.get_all("filter"), vec![r#"tenant="a""#]);
    }

    #[test]
    fn unparseable_filter_is_rejected() {
        let mut params = Params::default();
        params.push("filter", "not-a-matcher");
        assert!(enforce_filter_params(&mut params, &tenant("a"), ConflictPolicy::Replace).is_err());
    }

    #[test]
    fn silence_body_gains_tenant_matcher() {
        let body = serde_json::to_vec(&json!({
            "matchers": [{"name": "alertname", "value": "Down", "isRegex": false}],
            "startsAt": "2026-01-01T00:00:00Z",
            "endsAt": "2026-01-01T01:00:00Z",
            "createdBy": "ops",
            "comment": "maintenance"
        }))
        .unwrap();

        let out = enforce_silence_body(&body, &tenant("a")).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        let matchers = v["matchers"].as_array().unwrap();
        assert_eq!(matchers.len(), 2);
        assert_eq!(matchers[1]["name"], "tenant");
        assert_eq!(matchers[1]["value"], "a");
        assert_eq!(matchers[1]["isRegex"], false);
        assert_eq!(matchers[1]["isEqual"], true);
        // Unrelated fields are preserved.
        assert_eq!(v["comment"], "maintenance");
    }

    #[test]
    fn silence_with_matching_tenant_is_unchanged() {
        let body = serde_json::to_vec(&json!({
            "matchers": [
                {"name": "tenant", "value": "a", "isRegex": false, "isEqual": true},
                {"name": "alertname", "value": "Down", "isRegex": false}
            ]
        }))
        .unwrap();

        let out = enforce_silence_body(&body, &tenant("a")).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["matchers"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn cross_tenant_silence_is_rejected() {
        let body = serde_json::to_vec(&json!({
            "matchers": [{"name": "tenant", "value": "b", "isRegex": false}]
        }))
        .unwrap();

        let err = enforce_silence_body(&body, &tenant("a")).unwrap_err();
        assert!(err.to_string().contains("different value"));
    }

    #[test]
    fn regex_matcher_on_tenant_label_is_a_conflict() {
        let body = serde_json::to_vec(&json!({
            "matchers": [{"name": "tenant", "value": "a", "isRegex": true}]
        }))
        .unwrap();
        assert!(enforce_silence_body(&body, &tenant("a")).is_err());
    }

    #[test]
    fn silence_without_matchers_is_rejected() {
        assert!(enforce_silence_body(br#"{"comment": "x"}"#, &tenant("a")).is_err());
        assert!(enforce_silence_body(b"not json", &tenant("a")).is_err());
    }

    #[test]
    fn ownership_check_on_fetched_silence() {
        let owned = json!({
            "id": "s1",
            "matchers": [
                {"name": "alertname", "value": "Down", "isRegex": false},
                {"name": "tenant", "value": "a", "isRegex": false, "isEqual": true}
            ]
        });
        assert!(silence_belongs_to_tenant(&owned, &tenant("a")));

        let foreign = json!({
            "id": "s2",
            "matchers": [{"name": "tenant", "value": "b", "isRegex": false}]
        });
        assert!(!silence_belongs_to_tenant(&foreign, &tenant("a")));

        let none = json!({"id": "s3"});
        assert!(!silence_belongs_to_tenant(&none, &tenant("a")));
    }
}
