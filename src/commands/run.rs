use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use kube::Client;
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use netpolicy_controller::config::Config;
use netpolicy_controller::edges::{read_edge_set, EdgeSet};
use netpolicy_controller::gate::validate_apply_gate;
use netpolicy_controller::k8s;
use netpolicy_controller::metrics::{
    healthz_handler, metrics_handler, FROZEN_EDGES, GATE_FAILURES_TOTAL,
    OBSERVED_EDGES, POLICY_ACTIONS_TOTAL, RECONCILE_ERRORS_TOTAL, RECONCILE_TICKS_TOTAL,
};
use netpolicy_controller::mode::{resolve_mode, Mode};
use netpolicy_controller::observer;
use netpolicy_controller::policy::{generate_infra, generate_role_policies, generate_safety, PolicyDocument};
use netpolicy_controller::reconcile::reconcile;
use netpolicy_controller::roles::{admit_role_edges, classify_role, derive_stable_ports};

pub(crate) struct RunState {
    pub(crate) ready: bool,
}

pub async fn run() -> Result<()> {
    println!("Starting netpolicy-controller...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let config = Arc::new(Config::from_env());
    let observed = Arc::new(Mutex::new(read_edge_set(&config.observed_path)));

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));

    println!("  Namespace .................... {}", config.namespace);
    println!("  Loop interval ................ {}s", config.loop_interval.as_secs());
    println!("  Flow stream .................. {}", config.flow_stream_addr);
    println!("  Observability server ......... http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until first tick, then 200)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Controller running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("netpolicy_controller_started");

    let state = Arc::new(Mutex::new(RunState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let observer_config = config.clone();
    let observer_edges = observed.clone();
    let observer_shutdown = shutdown_tx.subscribe();
    let observer_handle = tokio::spawn(async move {
        observer::run(observer_config, observer_edges, observer_shutdown).await;
    });

    let http_state = state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move { start_server(http_state, http_shutdown, addr).await });

    let tick_client = client.clone();
    let tick_config = config.clone();
    let tick_edges = observed.clone();
    let tick_state = state.clone();
    let tick_shutdown = shutdown_tx.subscribe();
    let tick_handle = tokio::spawn(async move {
        tick_loop(tick_client, tick_config, tick_edges, tick_state, tick_shutdown).await
    });

    tokio::select! {
        _ = tick_handle => {
            info!("tick_loop_ended");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping controller...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), observer_handle).await;
    let _ = http_handle.await?;

    info!("netpolicy_controller_stopped");
    println!("Controller stopped.");

    Ok(())
}

/* ============================= TICK LOOP ============================= */

async fn tick_loop(
    client: Client,
    config: Arc<Config>,
    observed: Arc<Mutex<EdgeSet>>,
    state: Arc<Mutex<RunState>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        if let Err(e) = tick(&client, &config, &observed).await {
            RECONCILE_ERRORS_TOTAL.inc();
            warn!(error = %e, "reconcile_tick_failed");
            println!("[tick] ERROR: {e}");
        }

        {
            let mut s = state.lock().await;
            s.ready = true;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.loop_interval) => {}
            _ = shutdown.recv() => return,
        }
    }
}

async fn tick(client: &Client, config: &Config, observed: &Arc<Mutex<EdgeSet>>) -> Result<()> {
    RECONCILE_TICKS_TOTAL.inc();

    let namespace = k8s::read_namespace(client, &config.namespace).await?;
    let being_deleted = k8s::is_being_deleted(&namespace);
    let annotation = k8s::mode_annotation(&namespace);
    let mode = resolve_mode(config, annotation.as_deref(), being_deleted);

    if !being_deleted {
        k8s::ensure_finalizer(client, &config.namespace).await?;
    }

    let pods = k8s::list_pods(client, &config.namespace).await?;

    let desired = match mode {
        Mode::Teardown => Vec::new(),
        Mode::Bootstrap | Mode::Apply => {
            let mut docs = Vec::new();
            if config.manage_infra {
                docs.extend(generate_infra(&config.namespace));
            }
            if config.enable_safety {
                docs.extend(generate_safety(&config.namespace));
            }
            docs.extend(role_policies_for(client, config, &pods, mode).await?);
            docs
        }
    };

    {
        let set = observed.lock().await;
        OBSERVED_EDGES.set(set.len() as i64);
    }

    match mode {
        Mode::Bootstrap => {
            println!("[tick] BOOTSTRAP: observing only, reconciliation skipped");
        }
        Mode::Teardown => {
            let outcome = reconcile(client, &config.namespace, &desired).await?;
            record_outcome(&outcome);
            println!(
                "[tick] TEARDOWN: {} created, {} patched, {} deleted",
                outcome.created.len(),
                outcome.patched.len(),
                outcome.deleted.len()
            );
        }
        Mode::Apply => {
            let gate = validate_apply_gate(&config.namespace, &pods, &desired);
            for w in &gate.warnings {
                warn!(warning = %w, "apply_gate_warning");
            }
            if gate.ok() {
                let outcome = reconcile(client, &config.namespace, &desired).await?;
                record_outcome(&outcome);
                println!(
                    "[tick] APPLY: {} created, {} patched, {} deleted",
                    outcome.created.len(),
                    outcome.patched.len(),
                    outcome.deleted.len()
                );
            } else {
                GATE_FAILURES_TOTAL.inc();
                for e in &gate.errors {
                    warn!(error = %e, "apply_gate_rejected");
                }
                println!("[tick] APPLY gate rejected desired policy set: {:?}", gate.errors);
            }
        }
    }

    if being_deleted {
        k8s::remove_finalizer(client, &config.namespace).await?;
    }

    Ok(())
}

async fn role_policies_for(client: &Client, config: &Config, pods: &[k8s_openapi::api::core::v1::Pod], mode: Mode) -> Result<Vec<PolicyDocument>> {
    let frozen_or_observed_path = match mode {
        Mode::Apply => &config.frozen_path,
        _ => &config.observed_path,
    };
    let edges = read_edge_set(frozen_or_observed_path);
    FROZEN_EDGES.set(read_edge_set(&config.frozen_path).len() as i64);

    let mut pod_roles = std::collections::HashMap::new();
    for pod in pods {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        if let Some(role) = classify_role(&labels, &name) {
            let ns = pod.metadata.namespace.clone().unwrap_or_default();
            pod_roles.insert(format!("{ns}/{name}"), role);
        }
    }

    let stable_ports = if config.derive_ports {
        let services = k8s::list_services(client, &config.namespace).await?;
        let endpoints = k8s::list_endpoints(client, &config.namespace).await?;
        derive_stable_ports(&config.namespace, pods, &services, &endpoints)
    } else {
        Vec::new()
    };

    let pod_edges: Vec<_> = edges.iter().cloned().collect();
    let role_edges = admit_role_edges(&config.namespace, &pod_edges, &pod_roles, &stable_ports);

    Ok(generate_role_policies(&config.namespace, &role_edges, mode))
}

fn record_outcome(outcome: &netpolicy_controller::reconcile::ReconcileOutcome) {
    POLICY_ACTIONS_TOTAL.with_label_values(&["create"]).inc_by(outcome.created.len() as u64);
    POLICY_ACTIONS_TOTAL.with_label_values(&["patch"]).inc_by(outcome.patched.len() as u64);
    POLICY_ACTIONS_TOTAL.with_label_values(&["delete"]).inc_by(outcome.deleted.len() as u64);
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_router(state: Arc<Mutex<RunState>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn start_server(state: Arc<Mutex<RunState>>, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind observability server")?;

    info!(addr = %addr, "observability_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<RunState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(ready: bool) -> Arc<Mutex<RunState>> {
        Arc::new(Mutex::new(RunState { ready }))
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_router(test_state(false));
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reflects_ready_state() {
        let app = build_router(test_state(true));
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"READY");
    }

    #[tokio::test]
    async fn readyz_not_ready_before_first_tick() {
        let app = build_router(test_state(false));
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let app = build_router(test_state(false));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
