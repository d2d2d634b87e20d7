//! Namespace finalizer management and cluster-view listing.

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Pod, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;

pub const FINALIZER: &str = "trirematics.io/network-cleanup";

/// Add the controller's finalizer to the namespace if absent.
pub async fn ensure_finalizer(client: &Client, namespace: &str) -> anyhow::Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = api.get(namespace).await?;
    let finalizers = ns.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let mut new_finalizers = finalizers;
    new_finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": new_finalizers } });
    api.patch(namespace, &PatchParams::default(), &Patch::Merge(&patch)).await?;
    Ok(())
}

/// Remove the controller's finalizer from the namespace if present.
pub async fn remove_finalizer(client: &Client, namespace: &str) -> anyhow::Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = api.get(namespace).await?;
    let finalizers = ns.metadata.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let new_finalizers: Vec<String> = finalizers.into_iter().filter(|f| f != FINALIZER).collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": new_finalizers } });
    api.patch(namespace, &PatchParams::default(), &Patch::Merge(&patch)).await?;
    Ok(())
}

/// Read the namespace object, for annotation/mode lookups and the
/// deletion-timestamp check.
pub async fn read_namespace(client: &Client, namespace: &str) -> anyhow::Result<Namespace> {
    let api: Api<Namespace> = Api::all(client.clone());
    Ok(api.get(namespace).await?)
}

pub fn is_being_deleted(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
}

pub fn mode_annotation(ns: &Namespace) -> Option<String> {
    ns.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get("trirematics.io/controller-mode"))
        .cloned()
}

pub async fn list_pods(client: &Client, namespace: &str) -> anyhow::Result<Vec<Pod>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    Ok(api.list(&ListParams::default()).await?.items)
}

pub async fn list_services(client: &Client, namespace: &str) -> anyhow::Result<Vec<Service>> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    Ok(api.list(&ListParams::default()).await?.items)
}

pub async fn list_endpoints(client: &Client, namespace: &str) -> anyhow::Result<Vec<Endpoints>> {
    let api: Api<Endpoints> = Api::namespaced(client.clone(), namespace);
    Ok(api.list(&ListParams::default()).await?.items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn being_deleted_detects_deletion_timestamp() {
        let mut ns = Namespace::default();
        assert!(!is_being_deleted(&ns));
        ns.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
        assert!(is_being_deleted(&ns));
    }

    #[test]
    fn mode_annotation_reads_expected_key() {
        let mut annotations = BTreeMap::new();
        annotations.insert("trirematics.io/controller-mode".to_string(), "APPLY".to_string());
        let ns = Namespace {
            metadata: ObjectMeta {
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(mode_annotation(&ns), Some("APPLY".to_string()));
    }
}
