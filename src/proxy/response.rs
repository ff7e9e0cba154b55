//! Response filtering for endpoints whose payloads would leak cross-tenant
//! data.
//!
//! Operates on `serde_json::Value` so fields the proxy does not know about
//! (rule health, evaluation timings, annotations, ...) round-trip untouched.
//! A body that does not decode, or does not have the expected shape, is
//! passed through unchanged; upstream error payloads stay intact that way.

use crate::proxy::tenant::TenantMatcher;
use serde_json::Value;

/// Rewrite the response body for whitelisted paths. Returns `None` when the
/// path has no filter or the body could not be rewritten, in which case the
/// caller forwards the original bytes.
pub fn filter_body(path: &str, body: &[u8], matcher: &TenantMatcher) -> Option<Vec<u8>> {
    match path.trim_end_matches('/') {
        "/api/v1/rules" => filter_rules(body, matcher),
        "/api/v1/alerts" => filter_alerts(body, matcher),
        _ => None,
    }
}

/// Keep only rules (and their active alerts) whose labels satisfy the tenant
/// matcher; groups left empty are dropped entirely.
fn filter_rules(body: &[u8], matcher: &TenantMatcher) -> Option<Vec<u8>> {
    let mut payload: Value = serde_json::from_slice(body).ok()?;
    let groups = payload.get_mut("data")?.get_mut("groups")?.as_array_mut()?;

    for group in groups.iter_mut() {
        if let Some(rules) = group.get_mut("rules").and_then(Value::as_array_mut) {
            rules.retain(|rule| labels_match(rule.get("labels"), matcher));
            for rule in rules.iter_mut() {
                if let Some(alerts) = rule.get_mut("alerts").and_then(Value::as_array_mut) {
                    alerts.retain(|alert| labels_match(alert.get("labels"), matcher));
                }
            }
        }
    }
    groups.retain(|group| {
        group
            .get("rules")
            .and_then(Value::as_array)
            .is_some_and(|rules| !rules.is_empty())
    });

    serde_json::to_vec(&payload).ok()
}

/// Keep only alerts whose labels satisfy the tenant matcher.
fn filter_alerts(body: &[u8], matcher: &TenantMatcher) -> Option<Vec<u8>> {
    let mut payload: Value = serde_json::from_slice(body).ok()?;
    let alerts = payload.get_mut("data")?.get_mut("alerts")?.as_array_mut()?;
    alerts.retain(|alert| labels_match(alert.get("labels"), matcher));
    serde_json::to_vec(&payload).ok()
}

/// Evaluate the matcher against one `labels` object; a missing label behaves
/// as the empty string, matching the upstream's semantics.
fn labels_match(labels: Option<&Value>, matcher: &TenantMatcher) -> bool {
    let value = labels
        .and_then(|labels| labels.get(&matcher.name))
        .and_then(Value::as_str)
        .unwrap_or("");
    matcher.matches(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tenant::MatchKind;
    use serde_json::json;

    fn tenant(value: &str) -> TenantMatcher {
        TenantMatcher::new(MatchKind::Equal, "tenant", value).unwrap()
    }

    fn rules_payload() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "status": "success",
            "data": {
                "groups": [
                    {
                        "name": "team-a.rules",
                        "file": "/etc/rules/a.yaml",
                        "rules": [
                            {
                                "name": "HighErrorRate",
                                "query": "errors > 1",
                                "labels": {"tenant": "a", "severity": "page"},
                                "health": "ok",
                                "type": "alerting",
                                "alerts": [
                                    {"labels": {"tenant": "a", "alertname": "HighErrorRate"}},
                                    {"labels": {"tenant": "b", "alertname": "HighErrorRate"}}
                                ]
                            }
                        ]
                    },
                    {
                        "name": "team-b.rules",
                        "file": "/etc/rules/b.yaml",
                        "rules": [
                            {
                                "name": "Other",
                                "query": "up == 0",
                                "labels": {"tenant": "b"},
                                "type": "recording"
                            }
                        ]
                    }
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn rules_groups_are_filtered_and_empty_groups_dropped() {
        let out = filter_body("/api/v1/rules", &rules_payload(), &tenant("a")).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        let groups = v["data"]["groups"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["name"], "team-a.rules");
        // Nested alerts of the kept rule were filtered too.
        let alerts = groups[0]["rules"][0]["alerts"].as_array().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["labels"]["tenant"], "a");
        // Unknown fields survive.
        assert_eq!(groups[0]["rules"][0]["health"], "ok");
    }

    #[test]
    fn rules_filtering_is_idempotent() {
        let once = filter_body("/api/v1/rules", &rules_payload(), &tenant("a")).unwrap();
        let twice = filter_body("/api/v1/rules", &once, &tenant("a")).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn alerts_are_filtered() {
        let body = serde_json::to_vec(&json!({
            "status": "success",
            "data": {
                "alerts": [
                    {"labels": {"tenant": "a"}, "state": "firing"},
                    {"labels": {"tenant": "b"}, "state": "firing"},
                    {"labels": {}, "state": "pending"}
                ]
            }
        }))
        .unwrap();

        let out = filter_body("/api/v1/alerts", &body, &tenant("a")).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        let alerts = v["data"]["alerts"].as_array().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["labels"]["tenant"], "a");
    }

    #[test]
    fn missing_label_matches_negative_kinds() {
        let body = serde_json::to_vec(&json!({
            "status": "success",
            "data": {"alerts": [{"labels": {}, "state": "firing"}]}
        }))
        .unwrap();

        let neq = TenantMatcher::new(MatchKind::NotEqual, "tenant", "a").unwrap();
        let out = filter_body("/api/v1/alerts", &body, &neq).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["data"]["alerts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn regex_matcher_filters_rules() {
        let m = TenantMatcher::new(MatchKind::Regex, "tenant", "a|c").unwrap();
        let out = filter_body("/api/v1/rules", &rules_payload(), &m).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["data"]["groups"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn non_json_body_passes_through() {
        assert!(filter_body("/api/v1/rules", b"service unavailable", &tenant("a")).is_none());
    }

    #[test]
    fn unexpected_shape_passes_through() {
        let body = serde_json::to_vec(&json!({"status": "error", "error": "boom"})).unwrap();
        assert!(filter_body("/api/v1/rules", &body, &tenant("a")).is_none());
    }

    #[test]
    fn unlisted_path_passes_through() {
        assert!(filter_body("/api/v1/query", &rules_payload(), &tenant("a")).is_none());
    }
}
