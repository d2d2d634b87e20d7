//! Policy documents: a structured model of a Cilium `CiliumNetworkPolicy`,
//! and the three generator families (infra, safety, role).
//!
//! The CNP schema itself belongs to an external CRD this controller does
//! not own (see DESIGN.md); `PolicyDocument` captures exactly the shape
//! the reconciler needs to diff and write, with an opaque passthrough for
//! fields it doesn't interpret.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::edges::Edge;
use crate::mode::Mode;

pub const LABEL_MANAGED: &str = "trirematics.io/managed";
pub const LABEL_MANAGED_BY: &str = "trirematics.io/managed-by";
pub const LABEL_TYPE: &str = "trirematics.io/type";
pub const LABEL_MODE: &str = "trirematics.io/mode";
pub const LABEL_SRC: &str = "trirematics.io/src";
pub const LABEL_DST: &str = "trirematics.io/dst";
pub const ROLE_LABEL_PREFIX: &str = "roles.athena.t9s.io";

const MANAGED_BY_CONTROLLER: &str = "controller";

/// A label selector, supporting `matchLabels` and a subset of
/// `matchExpressions` operators (`In`, `NotIn`, `Exists`, `DoesNotExist`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", rename = "matchLabels")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "matchExpressions")]
    pub match_expressions: Vec<LabelSelectorExpr>,
}

impl LabelSelector {
    pub fn from_match_labels(pairs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        Self {
            match_labels: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSelectorExpr {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// One `toPorts`/`fromPorts` port entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRule {
    pub port: String,
    pub protocol: String,
}

/// An ingress rule: `fromEndpoints` (label selectors) and/or `fromEntities`
/// (Cilium well-known entities), plus the ports it allows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "fromEndpoints")]
    pub from_endpoints: Vec<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "fromEntities")]
    pub from_entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "toPorts")]
    pub to_ports: Vec<ToPorts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EgressRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "toEndpoints")]
    pub to_endpoints: Vec<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "toEntities")]
    pub to_entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "toPorts")]
    pub to_ports: Vec<ToPorts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToPorts {
    pub ports: Vec<PortRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(rename = "endpointSelector")]
    pub endpoint_selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<IngressRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<EgressRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Fields a live object carries that this controller never sets itself
    /// (resourceVersion, uid, ...); preserved opaquely for round-tripping,
    /// stripped by `normalize` before diffing.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A Cilium `CiliumNetworkPolicy` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: PolicyMetadata,
    pub spec: PolicySpec,
    /// `status` and any other top-level fields this controller doesn't
    /// interpret; preserved opaquely, stripped by `normalize`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PolicyDocument {
    fn new(name: impl Into<String>, namespace: impl Into<String>, labels: impl IntoIterator<Item = (&'static str, String)>, spec: PolicySpec) -> Self {
        Self {
            api_version: "cilium.io/v2".to_string(),
            kind: "CiliumNetworkPolicy".to_string(),
            metadata: PolicyMetadata {
                name: name.into(),
                namespace: namespace.into(),
                labels: labels.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                extra: BTreeMap::new(),
            },
            spec,
            extra: BTreeMap::new(),
        }
    }

    fn managed_labels(extra_type: &str) -> Vec<(&'static str, String)> {
        vec![
            (LABEL_MANAGED, "true".to_string()),
            (LABEL_MANAGED_BY, MANAGED_BY_CONTROLLER.to_string()),
            (LABEL_TYPE, extra_type.to_string()),
        ]
    }
}

fn role_selector(role: &str) -> LabelSelector {
    LabelSelector::from_match_labels([(format!("{ROLE_LABEL_PREFIX}/{role}"), "active".to_string())])
}

fn port_rule(port: u16, protocol: &str) -> PortRule {
    PortRule {
        port: port.to_string(),
        protocol: protocol.to_string(),
    }
}

/// `role-<src>-to-<dst>-<port>-<proto-lower>` allowing `src_role -> dst_role`
/// on one `(proto, port)`.
pub fn role_policy(namespace: &str, src_role: &str, dst_role: &str, port: u16, protocol: &str, mode: Mode) -> PolicyDocument {
    let name = format!("role-{src_role}-to-{dst_role}-{port}-{}", protocol.to_lowercase());
    let mut labels = PolicyDocument::managed_labels("role");
    labels.push((LABEL_MODE, mode.to_string()));
    labels.push((LABEL_SRC, src_role.to_string()));
    labels.push((LABEL_DST, dst_role.to_string()));

    let spec = PolicySpec {
        endpoint_selector: role_selector(dst_role),
        ingress: vec![IngressRule {
            from_endpoints: vec![role_selector(src_role)],
            from_entities: vec![],
            to_ports: vec![ToPorts { ports: vec![port_rule(port, protocol)] }],
        }],
        egress: vec![],
    };
    PolicyDocument::new(name, namespace, labels, spec)
}

/// One role policy per edge in `edges`.
pub fn generate_role_policies(namespace: &str, edges: &[Edge], mode: Mode) -> Vec<PolicyDocument> {
    edges
        .iter()
        .map(|(src, dst, port, proto)| role_policy(namespace, src, dst, *port, proto, mode))
        .collect()
}

fn namespace_selector(ns: &str) -> LabelSelector {
    LabelSelector::from_match_labels([("k8s:io.kubernetes.pod.namespace".to_string(), ns.to_string())])
}

/// The ten canonical infra policies.
pub fn generate_infra(namespace: &str) -> Vec<PolicyDocument> {
    let labels = |infra: &str| {
        let mut l = PolicyDocument::managed_labels("infra");
        l.push(("trirematics.io/infra", infra.to_string()));
        l
    };

    let operator_selector = LabelSelector::from_match_labels([
        ("control-plane".to_string(), "controller-manager".to_string()),
        ("operation-plane.t9s.io/level".to_string(), "base-operator".to_string()),
    ]);
    let controller_manager_selector = LabelSelector {
        match_labels: BTreeMap::new(),
        match_expressions: vec![LabelSelectorExpr {
            key: "control-plane".to_string(),
            operator: "In".to_string(),
            values: vec!["controller-manager".to_string()],
        }],
    };
    let operators_plane_selector = LabelSelector {
        match_labels: BTreeMap::new(),
        match_expressions: vec![
            LabelSelectorExpr { key: "olm.managed".to_string(), operator: "In".to_string(), values: vec!["true".to_string()] },
            LabelSelectorExpr {
                key: "olm.catalogSource".to_string(),
                operator: "In".to_string(),
                values: vec!["athena-operators-plane".to_string(), "odin-operators-plane".to_string()],
            },
        ],
    };

    vec![
        // 1. DNS egress.
        PolicyDocument::new(
            "infra-allow-dns-egress",
            namespace,
            labels("dns"),
            PolicySpec {
                endpoint_selector: LabelSelector::default(),
                ingress: vec![],
                egress: vec![EgressRule {
                    to_endpoints: vec![namespace_selector("kube-system")],
                    to_entities: vec![],
                    to_ports: vec![ToPorts { ports: vec![port_rule(53, "UDP"), port_rule(53, "TCP")] }],
                }],
            },
        ),
        // 2. kube-apiserver egress.
        PolicyDocument::new(
            "infra-allow-kubeapi-egress",
            namespace,
            labels("kubeapi"),
            PolicySpec {
                endpoint_selector: LabelSelector::default(),
                ingress: vec![],
                egress: vec![EgressRule {
                    to_endpoints: vec![],
                    to_entities: vec!["kube-apiserver".to_string()],
                    to_ports: vec![ToPorts { ports: vec![port_rule(6443, "TCP")] }],
                }],
            },
        ),
        // 3. operator -> db:3306 egress.
        PolicyDocument::new(
            "infra-allow-operator-db-3306",
            namespace,
            labels("operator-db"),
            PolicySpec {
                endpoint_selector: operator_selector.clone(),
                ingress: vec![],
                egress: vec![EgressRule {
                    to_endpoints: vec![role_selector("mdb")],
                    to_entities: vec![],
                    to_ports: vec![ToPorts { ports: vec![port_rule(3306, "TCP")] }],
                }],
            },
        ),
        // 4. operator webhook ingress (kube-apiserver, host, remote-node; 443/8443).
        PolicyDocument::new(
            "infra-allow-operator-webhook",
            namespace,
            labels("webhook"),
            PolicySpec {
                endpoint_selector: operator_selector.clone(),
                ingress: vec![
                    IngressRule {
                        from_endpoints: vec![],
                        from_entities: vec!["kube-apiserver".to_string()],
                        to_ports: vec![ToPorts { ports: vec![port_rule(443, "TCP"), port_rule(8443, "TCP")] }],
                    },
                    IngressRule {
                        from_endpoints: vec![],
                        from_entities: vec!["host".to_string(), "remote-node".to_string()],
                        to_ports: vec![ToPorts { ports: vec![port_rule(443, "TCP"), port_rule(8443, "TCP")] }],
                    },
                ],
                egress: vec![],
            },
        ),
        // 5. controller-manager metrics scrape from observability namespace.
        PolicyDocument::new(
            "infra-allow-controller-metrics",
            namespace,
            labels("metrics"),
            PolicySpec {
                endpoint_selector: controller_manager_selector,
                ingress: vec![IngressRule {
                    from_endpoints: vec![namespace_selector("tobs")],
                    from_entities: vec![],
                    to_ports: vec![ToPorts { ports: vec![port_rule(8443, "TCP")] }],
                }],
                egress: vec![],
            },
        ),
        // 6. OLM internal gRPC -> operators-plane, 50051.
        PolicyDocument::new(
            "infra-allow-olm-grpc-50051",
            namespace,
            labels("olm"),
            PolicySpec {
                endpoint_selector: operators_plane_selector,
                ingress: vec![IngressRule {
                    from_endpoints: vec![
                        LabelSelector::from_match_labels([
                            ("k8s:io.kubernetes.pod.namespace".to_string(), "olm".to_string()),
                            ("app".to_string(), "packageserver".to_string()),
                        ]),
                        LabelSelector::from_match_labels([
                            ("k8s:io.kubernetes.pod.namespace".to_string(), "olm".to_string()),
                            ("app".to_string(), "catalog-operator".to_string()),
                        ]),
                    ],
                    from_entities: vec![],
                    to_ports: vec![ToPorts { ports: vec![port_rule(50051, "TCP")] }],
                }],
                egress: vec![],
            },
        ),
        // 7. workloads -> operator gRPC, TCP/5553.
        PolicyDocument::new(
            "infra-allow-operator-grpc-5553",
            namespace,
            labels("operator-grpc"),
            PolicySpec {
                endpoint_selector: operator_selector.clone(),
                ingress: vec![IngressRule {
                    from_endpoints: vec![
                        role_selector("gnb"),
                        role_selector("amf"),
                        role_selector("smf"),
                        role_selector("spgwu"),
                        LabelSelector::from_match_labels([("app".to_string(), "python-xapp-mon".to_string())]),
                    ],
                    from_entities: vec![],
                    to_ports: vec![ToPorts { ports: vec![port_rule(5553, "TCP")] }],
                }],
                egress: vec![],
            },
        ),
        // 8. workloads -> operator, UDP/5553 (plus same-namespace fallback).
        PolicyDocument::new(
            "infra-allow-operator-udp-5553",
            namespace,
            labels("operator-udp-5553"),
            PolicySpec {
                endpoint_selector: operator_selector.clone(),
                ingress: vec![IngressRule {
                    from_endpoints: vec![
                        role_selector("gnb"),
                        role_selector("amf"),
                        role_selector("smf"),
                        role_selector("upf"),
                        role_selector("nr-rfsim"),
                        role_selector("monitoring"),
                        namespace_selector(namespace),
                    ],
                    from_entities: vec![],
                    to_ports: vec![ToPorts { ports: vec![port_rule(5553, "UDP")] }],
                }],
                egress: vec![],
            },
        ),
        // 9. operator -> NTP (world), UDP/123.
        PolicyDocument::new(
            "infra-allow-operator-ntp",
            namespace,
            labels("ntp"),
            PolicySpec {
                endpoint_selector: operator_selector.clone(),
                ingress: vec![],
                egress: vec![EgressRule {
                    to_endpoints: vec![],
                    to_entities: vec!["world".to_string()],
                    to_ports: vec![ToPorts { ports: vec![port_rule(123, "UDP")] }],
                }],
            },
        ),
        // 10. operator <- OLM namespace, TCP/50051.
        PolicyDocument::new(
            "infra-allow-operator-from-olm-50051",
            namespace,
            labels("olm-grpc"),
            PolicySpec {
                endpoint_selector: operator_selector,
                ingress: vec![IngressRule {
                    from_endpoints: vec![namespace_selector("olm")],
                    from_entities: vec![],
                    to_ports: vec![ToPorts { ports: vec![port_rule(50051, "TCP")] }],
                }],
                egress: vec![],
            },
        ),
    ]
}

/// The two coarse safety-net policies.
pub fn generate_safety(namespace: &str) -> Vec<PolicyDocument> {
    let labels = || PolicyDocument::managed_labels("safety");
    vec![
        PolicyDocument::new(
            "infra-temp-allow-world-egress",
            namespace,
            labels(),
            PolicySpec {
                endpoint_selector: LabelSelector::default(),
                ingress: vec![],
                egress: vec![EgressRule {
                    to_endpoints: vec![],
                    to_entities: vec!["world".to_string()],
                    to_ports: vec![],
                }],
            },
        ),
        PolicyDocument::new(
            "infra-temp-allow-host-remote",
            namespace,
            labels(),
            PolicySpec {
                endpoint_selector: LabelSelector::default(),
                ingress: vec![IngressRule {
                    from_endpoints: vec![],
                    from_entities: vec!["host".to_string(), "remote-node".to_string()],
                    to_ports: vec![],
                }],
                egress: vec![EgressRule {
                    to_endpoints: vec![],
                    to_entities: vec!["host".to_string(), "remote-node".to_string()],
                    to_ports: vec![],
                }],
            },
        ),
    ]
}

/// Whether a policy carries both controller-ownership labels.
pub fn is_controller_owned(doc: &PolicyDocument) -> bool {
    doc.metadata.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true")
        && doc.metadata.labels.get(LABEL_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY_CONTROLLER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_policy_name_and_shape() {
        let doc = role_policy("ns", "gnb", "upf", 2152, "UDP", Mode::Bootstrap);
        assert_eq!(doc.metadata.name, "role-gnb-to-upf-2152-udp");
        assert_eq!(doc.spec.ingress.len(), 1);
        assert_eq!(doc.spec.ingress[0].to_ports[0].ports[0].port, "2152");
        assert!(is_controller_owned(&doc));
        assert_eq!(doc.metadata.labels.get(LABEL_MODE), Some(&"BOOTSTRAP".to_string()));
    }

    #[test]
    fn generate_infra_has_ten_policies() {
        assert_eq!(generate_infra("ns").len(), 10);
    }

    #[test]
    fn generate_safety_has_two_policies() {
        assert_eq!(generate_safety("ns").len(), 2);
    }

    #[test]
    fn infra_policies_are_controller_owned() {
        assert!(generate_infra("ns").iter().all(is_controller_owned));
    }

    #[test]
    fn generate_role_policies_one_per_edge() {
        let edges = vec![
            ("gnb".to_string(), "upf".to_string(), 2152, "UDP".to_string()),
            ("amf".to_string(), "smf".to_string(), 80, "TCP".to_string()),
        ];
        let docs = generate_role_policies("ns", &edges, Mode::Apply);
        assert_eq!(docs.len(), 2);
    }
}
