//! Prometheus metrics, registered once via `LazyLock`, matching the
//! teacher's `commands/reconcile.rs`/`commands/watch.rs` pattern.

use std::sync::LazyLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RECONCILE_TICKS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("netpolicy_reconcile_ticks_total", "Total reconcile ticks run").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONCILE_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("netpolicy_reconcile_errors_total", "Total reconcile tick errors").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static GATE_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("netpolicy_gate_failures_total", "Total safety gate failures").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static POLICY_ACTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("netpolicy_policy_actions_total", "Policy create/patch/delete actions"),
        &["action"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static OBSERVED_EDGES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("netpolicy_observed_edges", "Size of the observed edge set").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static FROZEN_EDGES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("netpolicy_frozen_edges", "Size of the frozen edge set").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static OBSERVER_RECONNECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("netpolicy_observer_reconnects_total", "Total flow-stream reconnect attempts").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// axum handler for `/metrics`.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics".to_string());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

pub async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
