//! Identifier sanitization, normalization for diffing, and the create/
//! patch/delete reconciliation loop against the (foreign) CNP CRD.

use std::collections::BTreeMap;

use kube::api::{ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use crate::policy::{is_controller_owned, PolicyDocument};

const FIELD_MANAGER: &str = "netpolicy-controller";

/// `(namespace, kind, name)` identity used to key policies for diffing.
pub type PolicyId = (String, String, String);

pub fn policy_id(doc: &PolicyDocument) -> PolicyId {
    (doc.metadata.namespace.clone(), doc.kind.clone(), doc.metadata.name.clone())
}

/// RFC1123-ish name sanitization: lowercase, invalid chars → `-`, collapse
/// runs of `.`/`-`, trim non-alphanumeric ends, empty → `"cnp"`.
pub fn sanitize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let replaced: String = lower
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    let collapsed = collapse_runs(&replaced, &['-', '.']);
    let trimmed = trim_non_alphanumeric(&collapsed);
    if trimmed.is_empty() {
        "cnp".to_string()
    } else {
        trimmed
    }
}

/// Label-value sanitization: allow `[A-Za-z0-9._-]`, collapse/trim, empty
/// → `"value"`, truncate-with-sha1-suffix beyond 63 chars.
pub fn sanitize_label_value(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    let collapsed = collapse_runs(&replaced, &['-', '_', '.']);
    let trimmed = trim_non_alphanumeric(&collapsed);
    if trimmed.is_empty() {
        return "value".to_string();
    }
    if trimmed.len() <= 63 {
        return trimmed;
    }
    let mut hasher = Sha1::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    let hex6: String = digest.iter().take(3).map(|b| format!("{b:02x}")).collect();
    let head: String = trimmed.chars().take(63 - 7).collect();
    let candidate = format!("{head}-{hex6}");
    let retrimmed = trim_trailing_non_alphanumeric(&candidate);
    if retrimmed.is_empty() {
        hex6
    } else {
        retrimmed
    }
}

fn collapse_runs(s: &str, sep_chars: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    let mut run: Vec<char> = Vec::new();
    let flush = |run: &mut Vec<char>, out: &mut String| {
        if run.len() >= 2 {
            out.push('-');
        } else {
            out.extend(run.iter());
        }
        run.clear();
    };
    for c in s.chars() {
        if sep_chars.contains(&c) {
            run.push(c);
        } else {
            flush(&mut run, &mut out);
            out.push(c);
        }
    }
    flush(&mut run, &mut out);
    out
}

fn trim_non_alphanumeric(s: &str) -> String {
    trim_trailing_non_alphanumeric(s.trim_start_matches(|c: char| !c.is_ascii_alphanumeric()))
}

fn trim_trailing_non_alphanumeric(s: &str) -> String {
    s.trim_end_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

/// Apply name/label sanitization to a policy, matching what was sanitized
/// at creation time so comparisons line up.
pub fn sanitize_policy(doc: &PolicyDocument) -> PolicyDocument {
    let mut sanitized = doc.clone();
    sanitized.metadata.name = sanitize_name(&doc.metadata.name);
    sanitized.metadata.labels = doc
        .metadata
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), sanitize_label_value(v)))
        .collect();
    sanitized
}

/// Strip fields that shouldn't participate in the desired-vs-actual diff:
/// `status` and `metadata.{creationTimestamp,resourceVersion,uid,generation,managedFields}`.
pub fn normalize(doc: &PolicyDocument) -> PolicyDocument {
    let mut normalized = doc.clone();
    normalized.extra.remove("status");
    for key in ["creationTimestamp", "resourceVersion", "uid", "generation", "managedFields"] {
        normalized.metadata.extra.remove(key);
    }
    normalized
}

/// The result of one reconcile tick, for logging/metrics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub created: Vec<String>,
    pub patched: Vec<String>,
    pub deleted: Vec<String>,
}

/// Pure diff step: given normalized/sanitized desired and actual policies,
/// compute what to create, patch, and delete. No I/O.
pub fn plan(desired: &[PolicyDocument], actual: &[PolicyDocument]) -> (Vec<PolicyDocument>, Vec<PolicyDocument>, Vec<PolicyDocument>) {
    let desired_sanitized: Vec<PolicyDocument> = desired.iter().map(sanitize_policy).collect();
    let desired_map: BTreeMap<PolicyId, &PolicyDocument> =
        desired_sanitized.iter().map(|d| (policy_id(d), d)).collect();

    let actual_normalized: Vec<PolicyDocument> = actual.iter().map(normalize).collect();
    let actual_map: BTreeMap<PolicyId, &PolicyDocument> =
        actual_normalized.iter().map(|a| (policy_id(a), a)).collect();

    let mut to_create = Vec::new();
    let mut to_patch = Vec::new();
    for (id, desired_doc) in &desired_map {
        match actual_map.get(id) {
            None => to_create.push((*desired_doc).clone()),
            Some(actual_doc) => {
                if &normalize(desired_doc) != *actual_doc {
                    to_patch.push((*desired_doc).clone());
                }
            }
        }
    }

    let mut to_delete = Vec::new();
    for (id, actual_doc) in &actual_map {
        if is_controller_owned(actual_doc) && !desired_map.contains_key(id) {
            to_delete.push((*actual_doc).clone());
        }
    }

    (to_create, to_patch, to_delete)
}

fn cnp_api_resource() -> ApiResource {
    let gvk = GroupVersionKind {
        group: "cilium.io".to_string(),
        version: "v2".to_string(),
        kind: "CiliumNetworkPolicy".to_string(),
    };
    ApiResource::from_gvk_with_plural(&gvk, "ciliumnetworkpolicies")
}

fn to_dynamic_object(doc: &PolicyDocument, ar: &ApiResource) -> anyhow::Result<DynamicObject> {
    let value = serde_json::to_value(doc)?;
    let mut obj: DynamicObject = serde_json::from_value(value)?;
    obj.types = Some(kube::api::TypeMeta {
        api_version: ar.api_version.clone(),
        kind: ar.kind.clone(),
    });
    Ok(obj)
}

/// Create/patch/delete controller-owned CNPs in `namespace` to converge on
/// `desired`. Create/patch happen before delete. Per-policy API errors are
/// logged and do not abort the tick.
pub async fn reconcile(client: &Client, namespace: &str, desired: &[PolicyDocument]) -> anyhow::Result<ReconcileOutcome> {
    let ar = cnp_api_resource();
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);

    let actual_list = api.list(&Default::default()).await?;
    let actual_docs: Vec<PolicyDocument> = actual_list
        .items
        .iter()
        .filter_map(|obj| serde_json::to_value(obj).ok().and_then(|v| serde_json::from_value(v).ok()))
        .collect();

    let (to_create, to_patch, to_delete) = plan(desired, &actual_docs);
    let mut outcome = ReconcileOutcome::default();

    for doc in &to_create {
        let sanitized_name = sanitize_name(&doc.metadata.name);
        match to_dynamic_object(doc, &ar) {
            Ok(obj) => match api.create(&PostParams::default(), &obj).await {
                Ok(_) => {
                    info!(policy = %sanitized_name, "created policy");
                    outcome.created.push(sanitized_name);
                }
                Err(e) => warn!(policy = %sanitized_name, error = %e, "create failed"),
            },
            Err(e) => warn!(policy = %sanitized_name, error = %e, "failed to encode policy"),
        }
    }

    for doc in &to_patch {
        let name = sanitize_name(&doc.metadata.name);
        match to_dynamic_object(doc, &ar) {
            Ok(obj) => match api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj)).await {
                Ok(_) => {
                    info!(policy = %name, "patched policy");
                    outcome.patched.push(name);
                }
                Err(e) => warn!(policy = %name, error = %e, "patch failed"),
            },
            Err(e) => warn!(policy = %name, error = %e, "failed to encode policy"),
        }
    }

    for doc in &to_delete {
        let name = sanitize_name(&doc.metadata.name);
        match api.delete(&name, &Default::default()).await {
            Ok(_) => {
                info!(policy = %name, "deleted policy");
                outcome.deleted.push(name);
            }
            Err(e) => warn!(policy = %name, error = %e, "delete failed"),
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::Mode;
    use crate::policy::role_policy;

    #[test]
    fn sanitize_name_lowercases_and_replaces() {
        assert_eq!(sanitize_name("Role_Foo To.Bar"), "role-foo-to.bar");
    }

    #[test]
    fn sanitize_name_empty_becomes_cnp() {
        assert_eq!(sanitize_name("***"), "cnp");
    }

    #[test]
    fn sanitize_name_is_idempotent() {
        let once = sanitize_name("Weird__Name!!");
        let twice = sanitize_name(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_label_value_truncates_long_values() {
        let long = "a".repeat(100);
        let sanitized = sanitize_label_value(&long);
        assert!(sanitized.len() <= 63);
        assert!(sanitized.contains('-'));
    }

    #[test]
    fn sanitize_label_value_empty_becomes_value() {
        assert_eq!(sanitize_label_value("***"), "value");
    }

    #[test]
    fn sanitize_label_value_is_idempotent() {
        let long = "x".repeat(200);
        let once = sanitize_label_value(&long);
        let twice = sanitize_label_value(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_strips_status_and_metadata_fields() {
        let mut doc = role_policy("ns", "a", "b", 80, "TCP", Mode::Apply);
        doc.extra.insert("status".to_string(), serde_json::json!({"x": 1}));
        doc.metadata.extra.insert("resourceVersion".to_string(), serde_json::json!("123"));
        let normalized = normalize(&doc);
        assert!(!normalized.extra.contains_key("status"));
        assert!(!normalized.metadata.extra.contains_key("resourceVersion"));
    }

    // S6 — reconcile delete scope.
    #[test]
    fn s6_delete_only_controller_owned_and_undesired() {
        let mut owned_undesired = role_policy("ns", "a", "b", 80, "TCP", Mode::Apply);
        owned_undesired.metadata.name = "a".to_string();
        let mut unowned_undesired = role_policy("ns", "c", "d", 81, "TCP", Mode::Apply);
        unowned_undesired.metadata.name = "b".to_string();
        unowned_undesired.metadata.labels.clear();

        let actual = vec![owned_undesired, unowned_undesired];
        let (_, _, to_delete) = plan(&[], &actual);
        assert_eq!(to_delete.len(), 1);
        assert_eq!(to_delete[0].metadata.name, "a");
    }

    #[test]
    fn idempotent_reconcile_plan() {
        let desired = vec![role_policy("ns", "a", "b", 80, "TCP", Mode::Apply)];
        let (to_create, _, _) = plan(&desired, &[]);
        assert_eq!(to_create.len(), 1);
        let sanitized_desired: Vec<PolicyDocument> = desired.iter().map(sanitize_policy).collect();
        let (to_create_again, to_patch_again, to_delete_again) = plan(&desired, &sanitized_desired);
        assert!(to_create_again.is_empty());
        assert!(to_patch_again.is_empty());
        assert!(to_delete_again.is_empty());
    }
}
