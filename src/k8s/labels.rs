use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;

/// Label-selector matching with the orchestrator's semantics: all
/// `matchLabels` pairs and all `matchExpressions` must hold; an empty
/// selector matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }

    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            let value = labels.get(&expr.key);
            let in_values = |value: Option<&String>| {
                expr.values
                    .as_ref()
                    .map(|vs| value.map_or(false, |v| vs.contains(v)))
                    .unwrap_or(false)
            };
            let holds = match expr.operator.as_str() {
                "In" => in_values(value),
                "NotIn" => !in_values(value),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                // Unknown operators match nothing rather than everything.
                _ => false,
            };
            if !holds {
                return false;
            }
        }
    }

    true
}

/// Matches a plain equality-based label map, as used in `Service.spec.selector`.
pub fn map_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
