//! The edge store: an append-only, deduplicated set of pod-level edges,
//! persisted as JSON and read tolerantly (missing/empty/malformed → empty).

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A directed `(src, dst, port, protocol)` edge between two pod identities
/// (`"<namespace>/<pod>"`) or, after role mapping, two roles.
pub type Edge = (String, String, u16, String);

/// On-disk shape of an edge-set document: `{edges, last_updated?, frozen_at?, source?}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeDocument {
    #[serde(default)]
    pub edges: Vec<(String, String, u16, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// An in-memory deduplicated edge set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeSet {
    edges: BTreeSet<Edge>,
}

impl EdgeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_edges(edges: impl IntoIterator<Item = Edge>) -> Self {
        Self {
            edges: edges.into_iter().collect(),
        }
    }

    pub fn contains(&self, edge: &Edge) -> bool {
        self.edges.contains(edge)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Idempotently record an edge, normalizing protocol to uppercase.
    /// Returns `true` if the edge was newly added.
    pub fn record(&mut self, src: &str, dst: &str, port: u16, protocol: &str) -> bool {
        let edge = (src.to_string(), dst.to_string(), port, protocol.to_uppercase());
        self.edges.insert(edge)
    }

    /// Set difference: edges in `self` not present in `other`.
    pub fn difference(&self, other: &EdgeSet) -> EdgeSet {
        EdgeSet {
            edges: self.edges.difference(&other.edges).cloned().collect(),
        }
    }

    /// Set union.
    pub fn union(&self, other: &EdgeSet) -> EdgeSet {
        EdgeSet {
            edges: self.edges.union(&other.edges).cloned().collect(),
        }
    }

    fn to_document(&self, timestamp_field: fn(i64) -> EdgeDocument) -> EdgeDocument {
        let mut edges: Vec<Edge> = self.edges.iter().cloned().collect();
        edges.sort();
        let mut doc = timestamp_field(now_epoch());
        doc.edges = edges;
        doc
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Read an edge set from `path`. Tolerates an absent file, an empty file
/// (mid-write), and malformed JSON — all three resolve to the empty set
/// and never raise, per the durability contract for concurrent readers.
pub fn read_edge_set(path: impl AsRef<Path>) -> EdgeSet {
    let path = path.as_ref();
    let Ok(text) = fs::read_to_string(path) else {
        return EdgeSet::new();
    };
    if text.trim().is_empty() {
        return EdgeSet::new();
    }
    let Ok(doc) = serde_json::from_str::<EdgeDocument>(&text) else {
        return EdgeSet::new();
    };
    EdgeSet::from_edges(
        doc.edges
            .into_iter()
            .map(|(s, d, p, proto)| (s, d, p, proto.to_uppercase())),
    )
}

/// Write an edge set atomically: serialize to a temp file in the same
/// directory, then rename over the destination. A concurrent reader never
/// observes a partially-written document.
pub fn write_edge_set(path: impl AsRef<Path>, set: &EdgeSet, source: Option<&str>) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut doc = set.to_document(|ts| EdgeDocument {
        last_updated: Some(ts),
        ..Default::default()
    });
    doc.source = source.map(str::to_string);

    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_string_pretty(&doc)?;
    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Write a frozen edge set, stamping `frozen_at` instead of `last_updated`.
pub fn write_frozen_edge_set(path: impl AsRef<Path>, set: &EdgeSet) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let doc = set.to_document(|ts| EdgeDocument {
        frozen_at: Some(ts),
        ..Default::default()
    });
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_string_pretty(&doc)?;
    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("netpolicy-controller-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn record_is_idempotent() {
        let mut set = EdgeSet::new();
        assert!(set.record("ns/a", "ns/b", 80, "tcp"));
        assert!(!set.record("ns/a", "ns/b", 80, "TCP"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn read_missing_file_is_empty() {
        let set = read_edge_set(tmp_path("missing.json"));
        assert!(set.is_empty());
    }

    #[test]
    fn read_empty_file_is_empty() {
        let path = tmp_path("empty.json");
        fs::write(&path, "").unwrap();
        let set = read_edge_set(&path);
        assert!(set.is_empty());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn read_malformed_json_is_empty() {
        let path = tmp_path("malformed.json");
        fs::write(&path, "{not json").unwrap();
        let set = read_edge_set(&path);
        assert!(set.is_empty());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let path = tmp_path("roundtrip.json");
        let mut set = EdgeSet::new();
        set.record("ns/a", "ns/b", 443, "TCP");
        set.record("ns/c", "ns/d", 53, "UDP");
        write_edge_set(&path, &set, Some("observer")).unwrap();
        let read_back = read_edge_set(&path);
        assert_eq!(read_back, set);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn promotion_style_union_grows_monotonically() {
        let mut frozen = EdgeSet::new();
        frozen.record("ns/a", "ns/b", 80, "TCP");
        let mut observed = frozen.clone();
        observed.record("ns/c", "ns/d", 443, "TCP");

        let new = observed.difference(&frozen);
        assert_eq!(new.len(), 1);
        let frozen_after = frozen.union(&new);
        assert!(frozen_after.contains(&("ns/a".into(), "ns/b".into(), 80, "TCP".into())));
        assert!(frozen_after.contains(&("ns/c".into(), "ns/d".into(), 443, "TCP".into())));
    }
}
