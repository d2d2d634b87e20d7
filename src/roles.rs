//! Role classifier, the `KNOWN_PORTS` allowlist, stable-port derivation, and
//! edge admission (pod edge → role edge promotion).

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};

use crate::edges::Edge;

const ROLE_LABEL_PREFIX: &str = "roles.athena.t9s.io/";
const ROLE_LABEL_ACTIVE: &str = "active";

/// Classify a pod's role from its labels (priority 1), falling back to
/// pod-name heuristics (priority 2). Pure and deterministic.
pub fn classify_role(labels: &HashMap<String, String>, pod_name: &str) -> Option<String> {
    if let Some(role) = role_from_labels(labels) {
        return Some(role);
    }
    role_from_name(pod_name)
}

fn role_from_labels(labels: &HashMap<String, String>) -> Option<String> {
    labels.iter().find_map(|(k, v)| {
        if v == ROLE_LABEL_ACTIVE {
            k.strip_prefix(ROLE_LABEL_PREFIX).map(str::to_string)
        } else {
            None
        }
    })
}

/// Ordered, case-insensitive name heuristics. First match wins. This is the
/// more permissive of the two original rule sets (recognizes `operator`
/// and `mysql`).
fn role_from_name(pod_name: &str) -> Option<String> {
    let name = pod_name.to_lowercase();
    if name.contains("operator") {
        return Some("operator".to_string());
    }
    if name.contains("mysql") {
        return Some("db".to_string());
    }
    if name.contains("rfsim") {
        return Some("nr-rfsim".to_string());
    }
    if name.contains("flexric") || name.starts_with("ric") || name.contains(".ric") {
        return Some("ric".to_string());
    }
    if name.contains("xapp") {
        return Some("xapp".to_string());
    }
    if name.starts_with("gnb.") || name.contains("oai-gnb") {
        return Some("gnb".to_string());
    }
    if name.starts_with("upf.") || name.contains("upf") {
        return Some("upf".to_string());
    }
    if name.starts_with("smf.") {
        return Some("smf".to_string());
    }
    if name.starts_with("amf.") {
        return Some("amf".to_string());
    }
    if name.starts_with("db.") {
        return Some("db".to_string());
    }
    if name.contains("monitor") {
        return Some("monitoring".to_string());
    }
    None
}

/// Hand-curated allowlist of safe `(proto, port)` traffic per `(src_role,
/// dst_role)` pair. Union of the recovered original rule sets (DESIGN.md).
pub fn known_ports() -> HashMap<(&'static str, &'static str), HashSet<(&'static str, u16)>> {
    let mut m: HashMap<(&'static str, &'static str), HashSet<(&'static str, u16)>> = HashMap::new();
    let mut add = |src: &'static str, dst: &'static str, pairs: &[(&'static str, u16)]| {
        m.entry((src, dst)).or_default().extend(pairs.iter().copied());
    };
    add("gnb", "upf", &[("UDP", 2152)]);
    add("upf", "smf", &[("TCP", 60001), ("UDP", 8805)]);
    add("gnb", "amf", &[("SCTP", 38412), ("SCTP", 57871), ("TCP", 60001)]);
    add("amf", "gnb", &[("SCTP", 38412), ("TCP", 60001)]);
    add("amf", "db", &[("TCP", 3306), ("TCP", 60001)]);
    add("gnb", "ric", &[("TCP", 60001)]);
    add("ric", "gnb", &[("TCP", 60001)]);
    add("nr-rfsim", "gnb", &[("TCP", 4043), ("TCP", 60001)]);
    add("monitoring", "db", &[("TCP", 3306)]);
    add("monitoring", "ric", &[("TCP", 60001)]);
    add("amf", "smf", &[("TCP", 80)]);
    add("smf", "amf", &[("TCP", 80)]);
    add("smf", "upf", &[("UDP", 8805), ("TCP", 60001)]);
    m
}

/// A `("*", dst_role, port, proto)` sentinel: a stable destination port for
/// a role, derived from cluster intent rather than observed traffic.
pub type StablePort = (String, u16, String);

fn pod_labels(pod: &Pod) -> HashMap<String, String> {
    pod.metadata.labels.clone().unwrap_or_default()
}

fn pod_container_ports(pod: &Pod) -> HashSet<(String, u16)> {
    let mut out = HashSet::new();
    let Some(spec) = &pod.spec else { return out };
    for c in &spec.containers {
        for cp in c.ports.iter().flatten() {
            if let Ok(port) = u16::try_from(cp.container_port) {
                let proto = cp.protocol.clone().unwrap_or_else(|| "TCP".to_string()).to_uppercase();
                out.insert((proto, port));
            }
        }
    }
    out
}

fn service_ports(svc: &Service) -> HashSet<(String, u16)> {
    let mut out = HashSet::new();
    let Some(spec) = &svc.spec else { return out };
    for p in spec.ports.iter().flatten() {
        if let Ok(port) = u16::try_from(p.port) {
            let proto = p.protocol.clone().unwrap_or_else(|| "TCP".to_string()).to_uppercase();
            out.insert((proto, port));
        }
    }
    out
}

fn service_selector(svc: &Service) -> HashMap<String, String> {
    svc.spec.as_ref().and_then(|s| s.selector.clone()).unwrap_or_default()
}

fn labels_match_selector(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    if selector.is_empty() {
        return false;
    }
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn endpoints_pod_ips(ep: &Endpoints) -> HashSet<String> {
    let mut ips = HashSet::new();
    for subset in ep.subsets.iter().flatten() {
        for addr in subset.addresses.iter().flatten() {
            ips.insert(addr.ip.clone());
        }
    }
    ips
}

/// Derive stable destination-role ports from the current cluster view:
/// Services selecting role-mapped pods (restricted to Endpoints-confirmed
/// IPs when Endpoints are supplied), falling back to containerPorts.
pub fn derive_stable_ports(
    namespace: &str,
    pods: &[Pod],
    services: &[Service],
    endpoints: &[Endpoints],
) -> Vec<StablePort> {
    let pods_in_ns: Vec<&Pod> = pods
        .iter()
        .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
        .collect();

    let mut ip_to_pod: HashMap<String, &Pod> = HashMap::new();
    for p in &pods_in_ns {
        if let Some(ip) = p.status.as_ref().and_then(|s| s.pod_ip.clone()) {
            ip_to_pod.insert(ip, p);
        }
    }

    let mut role_ports: HashMap<String, HashSet<(String, u16)>> = HashMap::new();
    for p in &pods_in_ns {
        let name = p.metadata.name.clone().unwrap_or_default();
        if let Some(role) = classify_role(&pod_labels(p), &name) {
            role_ports.entry(role).or_default().extend(pod_container_ports(p));
        }
    }

    let svcs_in_ns: Vec<&Service> = services
        .iter()
        .filter(|s| s.metadata.namespace.as_deref() == Some(namespace))
        .collect();

    for svc in &svcs_in_ns {
        let sel = service_selector(svc);
        if sel.is_empty() {
            continue;
        }
        let svc_ports = service_ports(svc);
        if svc_ports.is_empty() {
            continue;
        }
        for p in &pods_in_ns {
            if labels_match_selector(&pod_labels(p), &sel) {
                let name = p.metadata.name.clone().unwrap_or_default();
                if let Some(role) = classify_role(&pod_labels(p), &name) {
                    role_ports.entry(role).or_default().extend(svc_ports.clone());
                }
            }
        }
    }

    if !endpoints.is_empty() {
        let ep_by_name: HashMap<&str, &Endpoints> = endpoints
            .iter()
            .filter(|e| e.metadata.namespace.as_deref() == Some(namespace))
            .filter_map(|e| e.metadata.name.as_deref().map(|n| (n, e)))
            .collect();
        for svc in &svcs_in_ns {
            let Some(name) = svc.metadata.name.as_deref() else { continue };
            let Some(ep) = ep_by_name.get(name) else { continue };
            let ips = endpoints_pod_ips(ep);
            if ips.is_empty() {
                continue;
            }
            let svc_ports = service_ports(svc);
            if svc_ports.is_empty() {
                continue;
            }
            for ip in &ips {
                let Some(p) = ip_to_pod.get(ip) else { continue };
                let name = p.metadata.name.clone().unwrap_or_default();
                if let Some(role) = classify_role(&pod_labels(p), &name) {
                    role_ports.entry(role).or_default().extend(svc_ports.clone());
                }
            }
        }
    }

    let mut out: Vec<StablePort> = role_ports
        .into_iter()
        .flat_map(|(role, ports)| ports.into_iter().map(move |(proto, port)| (role.clone(), port, proto)))
        .collect();
    out.sort();
    out
}

/// Promote pod edges into role edges: both endpoints must resolve to known
/// roles in the target namespace, and `(proto, port)` must be allowed
/// either by the hand-curated allowlist or the derived stable-port set.
pub fn admit_role_edges(
    namespace: &str,
    pod_edges: &[Edge],
    pod_roles: &HashMap<String, String>,
    stable_ports: &[StablePort],
) -> Vec<Edge> {
    let known = known_ports();
    let mut stable_by_role: HashMap<&str, HashSet<(&str, u16)>> = HashMap::new();
    for (role, port, proto) in stable_ports {
        stable_by_role.entry(role.as_str()).or_default().insert((proto.as_str(), *port));
    }

    let mut out: HashSet<Edge> = HashSet::new();
    for (src_pod, dst_pod, port, proto) in pod_edges {
        let Some((src_ns, _)) = src_pod.split_once('/') else { continue };
        let Some((dst_ns, _)) = dst_pod.split_once('/') else { continue };
        if src_ns != namespace || dst_ns != namespace {
            continue;
        }
        let Some(src_role) = pod_roles.get(src_pod) else { continue };
        let Some(dst_role) = pod_roles.get(dst_pod) else { continue };

        let proto_upper = proto.to_uppercase();
        let allowed_by_known = known
            .get(&(src_role.as_str(), dst_role.as_str()))
            .map(|set| set.contains(&(proto_upper.as_str(), *port)))
            .unwrap_or(false);
        let allowed_by_stable = stable_by_role
            .get(dst_role.as_str())
            .map(|set| set.contains(&(proto_upper.as_str(), *port)))
            .unwrap_or(false);

        if allowed_by_known || allowed_by_stable {
            out.insert((src_role.clone(), dst_role.clone(), *port, proto_upper));
        }
    }
    let mut v: Vec<Edge> = out.into_iter().collect();
    v.sort();
    v
}
