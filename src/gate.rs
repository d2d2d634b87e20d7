//! The safety gate: a pure pre-flight validator over `(namespace, pods,
//! desired policies)`, returning `(ok, errors, warnings)`. Never raises.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;

use crate::policy::{LabelSelector, PolicyDocument, LABEL_TYPE, ROLE_LABEL_PREFIX};

/// The five `(proto, port)` pairs that must appear somewhere in the
/// desired policy set, with the reason they're required.
const REQUIRED_ANYWHERE: &[(&str, u16, &str)] = &[
    ("UDP", 5553, "operator control-plane channel"),
    ("TCP", 50051, "OLM gRPC channel"),
    ("UDP", 53, "DNS resolution"),
    ("TCP", 53, "DNS resolution"),
    ("TCP", 6443, "kube-apiserver access"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl GateResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn pod_labels(pod: &Pod) -> HashMap<String, String> {
    pod.metadata.labels.clone().unwrap_or_default()
}

fn has_role_label(labels: &HashMap<String, String>) -> bool {
    let prefix = format!("{ROLE_LABEL_PREFIX}/");
    labels.keys().any(|k| k.starts_with(&prefix))
}

/// Selector matching with `matchLabels` + `matchExpressions`
/// (`In`/`NotIn`/`Exists`/`DoesNotExist`); unknown operators are non-match.
pub fn selector_matches_pod(selector: &LabelSelector, labels: &HashMap<String, String>) -> bool {
    for (k, v) in &selector.match_labels {
        if labels.get(k) != Some(v) {
            return false;
        }
    }
    for expr in &selector.match_expressions {
        let matches = match expr.operator.as_str() {
            "In" => labels.get(&expr.key).map(|v| expr.values.contains(v)).unwrap_or(false),
            "NotIn" => labels.get(&expr.key).map(|v| !expr.values.contains(v)).unwrap_or(true),
            "Exists" => labels.contains_key(&expr.key),
            "DoesNotExist" => !labels.contains_key(&expr.key),
            _ => false,
        };
        if !matches {
            return false;
        }
    }
    true
}

fn collect_all_ports(doc: &PolicyDocument) -> Vec<(String, u16)> {
    let mut out = Vec::new();
    for rule in &doc.spec.ingress {
        for tp in &rule.to_ports {
            for p in &tp.ports {
                if let Ok(port) = p.port.parse::<u16>() {
                    out.push((p.protocol.to_uppercase(), port));
                }
            }
        }
    }
    for rule in &doc.spec.egress {
        for tp in &rule.to_ports {
            for p in &tp.ports {
                if let Ok(port) = p.port.parse::<u16>() {
                    out.push((p.protocol.to_uppercase(), port));
                }
            }
        }
    }
    out
}

/// Validate a desired policy set against the namespace's current pods.
pub fn validate_apply_gate(_namespace: &str, pods: &[Pod], desired: &[PolicyDocument]) -> GateResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let pod_label_sets: Vec<HashMap<String, String>> = pods.iter().map(pod_labels).collect();

    // 1. Role-label presence.
    if !pod_label_sets.iter().any(has_role_label) {
        warnings.push("no pod in the namespace carries a roles.athena.t9s.io/* label; role policies would select nothing".to_string());
    }

    // 2. Infra selector non-emptiness.
    for doc in desired {
        if doc.metadata.labels.get(LABEL_TYPE).map(String::as_str) != Some("infra") {
            continue;
        }
        if doc.spec.endpoint_selector.is_empty() {
            continue;
        }
        let match_count = pod_label_sets
            .iter()
            .filter(|labels| selector_matches_pod(&doc.spec.endpoint_selector, labels))
            .count();
        if match_count == 0 {
            errors.push(format!(
                "infra policy '{}' endpointSelector matches 0 pods in the namespace",
                doc.metadata.name
            ));
        }
    }

    // 3. Critical-port presence, anywhere across ingress or egress.
    let all_ports: Vec<(String, u16)> = desired.iter().flat_map(collect_all_ports).collect();
    for (proto, port, why) in REQUIRED_ANYWHERE {
        let present = all_ports.iter().any(|(p, n)| p == proto && n == port);
        if !present {
            errors.push(format!("desired policy set is missing required port {proto}/{port} ({why})"));
        }
    }

    GateResult { errors, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{generate_infra, role_policy};
    use crate::mode::Mode;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with_labels(pairs: &[(&str, &str)]) -> Pod {
        let mut labels = BTreeMap::new();
        for (k, v) in pairs {
            labels.insert(k.to_string(), v.to_string());
        }
        Pod {
            metadata: ObjectMeta {
                labels: Some(labels),
                namespace: Some("ns".to_string()),
                name: Some("p".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn test_infra_policy(selector: LabelSelector) -> PolicyDocument {
        use crate::policy::{PolicyMetadata, PolicySpec, LABEL_MANAGED, LABEL_MANAGED_BY};
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), "controller".to_string());
        labels.insert(LABEL_TYPE.to_string(), "infra".to_string());
        PolicyDocument {
            api_version: "cilium.io/v2".to_string(),
            kind: "CiliumNetworkPolicy".to_string(),
            metadata: PolicyMetadata {
                name: "infra-x".to_string(),
                namespace: "ns".to_string(),
                labels,
                extra: BTreeMap::new(),
            },
            spec: PolicySpec {
                endpoint_selector: selector,
                ingress: vec![],
                egress: vec![],
            },
            extra: BTreeMap::new(),
        }
    }

    fn all_critical_port_policies() -> Vec<PolicyDocument> {
        vec![
            role_policy("ns", "a", "b", 5553, "UDP", Mode::Apply),
            role_policy("ns", "a", "b", 50051, "TCP", Mode::Apply),
            role_policy("ns", "a", "b", 53, "UDP", Mode::Apply),
            role_policy("ns", "a", "b", 53, "TCP", Mode::Apply),
            role_policy("ns", "a", "b", 6443, "TCP", Mode::Apply),
        ]
    }

    // S1 — gate rejects empty infra selector.
    #[test]
    fn s1_gate_rejects_selector_matching_zero_pods() {
        let pods = vec![pod_with_labels(&[("app", "something")])];
        let infra = test_infra_policy(LabelSelector::from_match_labels([(
            "control-plane".to_string(),
            "controller-manager".to_string(),
        )]));
        let mut desired = all_critical_port_policies();
        desired.push(infra);
        let result = validate_apply_gate("ns", &pods, &desired);
        assert!(!result.ok());
        assert!(result.errors.iter().any(|e| e.contains("matches 0 pods")));
    }

    // S2 — gate accepts realistic set.
    #[test]
    fn s2_gate_accepts_realistic_set() {
        let pods = vec![pod_with_labels(&[
            ("control-plane", "controller-manager"),
            ("operation-plane.t9s.io/level", "base-operator"),
            ("roles.athena.t9s.io/amf", "active"),
        ])];
        let infra = test_infra_policy(LabelSelector::from_match_labels([(
            "control-plane".to_string(),
            "controller-manager".to_string(),
        )]));
        let mut desired = all_critical_port_policies();
        desired.push(infra);
        let result = validate_apply_gate("ns", &pods, &desired);
        assert!(result.ok(), "errors: {:?}", result.errors);
    }

    #[test]
    fn empty_selector_is_accepted() {
        let pods: Vec<Pod> = vec![];
        let mut desired = all_critical_port_policies();
        desired.extend(generate_infra("ns").into_iter().filter(|d| d.spec.endpoint_selector.is_empty()));
        let result = validate_apply_gate("ns", &pods, &desired);
        assert!(result.errors.iter().all(|e| !e.contains("matches 0 pods")));
    }

    #[test]
    fn missing_critical_port_is_an_error() {
        let pods = vec![pod_with_labels(&[("roles.athena.t9s.io/amf", "active")])];
        let result = validate_apply_gate("ns", &pods, &[]);
        assert!(!result.ok());
        assert!(result.errors.iter().any(|e| e.contains("5553")));
    }

    #[test]
    fn no_role_label_is_a_warning_not_an_error() {
        let pods = vec![pod_with_labels(&[("app", "x")])];
        let result = validate_apply_gate("ns", &pods, &all_critical_port_policies());
        assert!(result.ok());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn selector_matches_with_match_expressions() {
        let sel = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![crate::policy::LabelSelectorExpr {
                key: "control-plane".to_string(),
                operator: "In".to_string(),
                values: vec!["controller-manager".to_string()],
            }],
        };
        let labels = pod_with_labels(&[("control-plane", "controller-manager")]).metadata.labels.unwrap();
        assert!(selector_matches_pod(&sel, &labels));
    }

    #[test]
    fn unknown_operator_never_matches() {
        let sel = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![crate::policy::LabelSelectorExpr {
                key: "control-plane".to_string(),
                operator: "Bogus".to_string(),
                values: vec![],
            }],
        };
        let labels = pod_with_labels(&[("control-plane", "controller-manager")]).metadata.labels.unwrap();
        assert!(!selector_matches_pod(&sel, &labels));
    }
}
