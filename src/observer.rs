//! The flow observer: a resilient gRPC client for the upstream flow-
//! telemetry stream, feeding accepted pod edges into the shared edge store.
//!
//! The telemetry service's schema is consumed, not defined here; the
//! message shapes below are the minimal wire contract this client expects.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::edges::{write_edge_set, EdgeSet};
use crate::metrics::OBSERVER_RECONNECTS_TOTAL;

/// Hand-maintained wire messages for the `Observer.GetFlows` RPC. The
/// telemetry schema is an external interface; only the fields this
/// controller reads are modeled.
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PodIdentity {
        #[prost(string, tag = "1")]
        pub namespace: String,
        #[prost(string, tag = "2")]
        pub pod_name: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct L4PortPair {
        #[prost(uint32, tag = "1")]
        pub source_port: u32,
        #[prost(uint32, tag = "2")]
        pub destination_port: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct L4 {
        #[prost(message, optional, tag = "1")]
        pub tcp: Option<L4PortPair>,
        #[prost(message, optional, tag = "2")]
        pub udp: Option<L4PortPair>,
        #[prost(message, optional, tag = "3")]
        pub sctp: Option<L4PortPair>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FlowRecord {
        #[prost(message, optional, tag = "1")]
        pub source: Option<PodIdentity>,
        #[prost(message, optional, tag = "2")]
        pub destination: Option<PodIdentity>,
        #[prost(string, optional, tag = "3")]
        pub protocol: Option<String>,
        #[prost(uint32, optional, tag = "4")]
        pub port: Option<u32>,
        #[prost(message, optional, tag = "5")]
        pub l4: Option<L4>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetFlowsRequest {
        #[prost(string, tag = "1")]
        pub namespace: String,
    }
}

use proto::{FlowRecord, GetFlowsRequest};

/// Thin hand-rolled client over `tonic::client::Grpc`, equivalent in shape
/// to what `tonic-build` would generate for a single streaming RPC.
#[derive(Debug, Clone)]
pub struct ObserverClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ObserverClient {
    pub async fn connect(addr: String) -> Result<Self, tonic::transport::Error> {
        let channel = Channel::from_shared(addr)
            .map_err(|e| tonic::transport::Error::from(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?
            .connect()
            .await?;
        Ok(Self { inner: tonic::client::Grpc::new(channel) })
    }

    pub async fn get_flows(
        &mut self,
        request: GetFlowsRequest,
    ) -> Result<tonic::Response<tonic::Streaming<FlowRecord>>, tonic::Status> {
        self.inner.ready().await.map_err(|e| tonic::Status::unknown(e.to_string()))?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/observer.Observer/GetFlows");
        self.inner.server_streaming(tonic::Request::new(request), path, codec).await
    }
}

/// Extract the `(protocol, port)` pair a flow record carries, if any.
pub fn extract_l4(record: &FlowRecord) -> Option<(String, u16)> {
    if let (Some(proto), Some(port)) = (&record.protocol, record.port) {
        if let Ok(port) = u16::try_from(port) {
            return Some((proto.to_uppercase(), port));
        }
    }
    let l4 = record.l4.as_ref()?;
    for (proto_name, pair) in [("TCP", &l4.tcp), ("UDP", &l4.udp), ("SCTP", &l4.sctp)] {
        if let Some(pair) = pair {
            let candidate = if pair.destination_port != 0 { pair.destination_port } else { pair.source_port };
            if let Ok(port) = u16::try_from(candidate) {
                if port != 0 {
                    return Some((proto_name.to_string(), port));
                }
            }
        }
    }
    None
}

/// Apply the scope filter and L4 extraction, returning the pod edge if the
/// record is in-scope and carries a usable L4 triple.
pub fn process_flow(record: &FlowRecord, target_namespace: &str) -> Option<(String, String, u16, String)> {
    let src = record.source.as_ref()?;
    let dst = record.destination.as_ref()?;
    if src.namespace.is_empty() || src.pod_name.is_empty() || dst.namespace.is_empty() || dst.pod_name.is_empty() {
        return None;
    }
    if src.namespace != target_namespace || dst.namespace != target_namespace {
        return None;
    }
    let (proto, port) = extract_l4(record)?;
    Some((
        format!("{}/{}", src.namespace, src.pod_name),
        format!("{}/{}", dst.namespace, dst.pod_name),
        port,
        proto,
    ))
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Run the observer loop until `shutdown` fires. Reconnects with
/// exponential backoff (1s→30s doubling, reset to 1s on graceful stream
/// end); never exits except on cancellation.
pub async fn run(config: Arc<Config>, observed: Arc<Mutex<EdgeSet>>, mut shutdown: broadcast::Receiver<()>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if shutdown.try_recv().is_ok() {
            return;
        }
        match run_once(&config, &observed, &mut shutdown).await {
            Ok(graceful) => {
                if graceful {
                    backoff = INITIAL_BACKOFF;
                } else {
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
            Err(e) => {
                warn!(error = %e, "flow observer connection failed");
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
        OBSERVER_RECONNECTS_TOTAL.inc();
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.recv() => return,
        }
    }
}

/// Connects once and drains the stream until it ends or is cancelled.
/// Returns `Ok(true)` on a graceful stream end (resets backoff).
async fn run_once(
    config: &Config,
    observed: &Arc<Mutex<EdgeSet>>,
    shutdown: &mut broadcast::Receiver<()>,
) -> anyhow::Result<bool> {
    let mut client = ObserverClient::connect(config.flow_stream_addr.clone()).await?;
    let response = client
        .get_flows(GetFlowsRequest { namespace: config.namespace.clone() })
        .await?;
    let mut stream = response.into_inner();

    loop {
        tokio::select! {
            next = stream.message() => {
                match next {
                    Ok(Some(record)) => {
                        if config.hubble_debug {
                            debug!(?record, "observed flow record");
                        }
                        if let Some((src, dst, port, proto)) = process_flow(&record, &config.namespace) {
                            let mut set = observed.lock().await;
                            if set.record(&src, &dst, port, &proto) {
                                let _ = write_edge_set(&config.observed_path, &set, Some("observer"));
                            }
                        }
                    }
                    Ok(None) => {
                        info!("flow stream ended gracefully");
                        return Ok(true);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = shutdown.recv() => return Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::{L4PortPair, PodIdentity, L4};

    fn identity(ns: &str, name: &str) -> PodIdentity {
        PodIdentity { namespace: ns.to_string(), pod_name: name.to_string() }
    }

    #[test]
    fn extract_top_level_protocol_and_port() {
        let record = FlowRecord {
            source: None,
            destination: None,
            protocol: Some("tcp".to_string()),
            port: Some(443),
            l4: None,
        };
        assert_eq!(extract_l4(&record), Some(("TCP".to_string(), 443)));
    }

    #[test]
    fn extract_falls_back_to_nested_l4_in_order() {
        let record = FlowRecord {
            source: None,
            destination: None,
            protocol: None,
            port: None,
            l4: Some(L4 {
                tcp: None,
                udp: Some(L4PortPair { source_port: 1000, destination_port: 53 }),
                sctp: Some(L4PortPair { source_port: 2000, destination_port: 2000 }),
            }),
        };
        assert_eq!(extract_l4(&record), Some(("UDP".to_string(), 53)));
    }

    #[test]
    fn extract_prefers_destination_port_over_source() {
        let record = FlowRecord {
            source: None,
            destination: None,
            protocol: None,
            port: None,
            l4: Some(L4 { tcp: Some(L4PortPair { source_port: 111, destination_port: 222 }), udp: None, sctp: None }),
        };
        assert_eq!(extract_l4(&record), Some(("TCP".to_string(), 222)));
    }

    #[test]
    fn extract_returns_none_when_nothing_matches() {
        let record = FlowRecord { source: None, destination: None, protocol: None, port: None, l4: None };
        assert_eq!(extract_l4(&record), None);
    }

    #[test]
    fn process_flow_filters_out_of_scope_records() {
        let record = FlowRecord {
            source: Some(identity("other-ns", "a")),
            destination: Some(identity("ns", "b")),
            protocol: Some("TCP".to_string()),
            port: Some(80),
            l4: None,
        };
        assert_eq!(process_flow(&record, "ns"), None);
    }

    #[test]
    fn process_flow_accepts_in_scope_record() {
        let record = FlowRecord {
            source: Some(identity("ns", "a")),
            destination: Some(identity("ns", "b")),
            protocol: Some("TCP".to_string()),
            port: Some(80),
            l4: None,
        };
        assert_eq!(process_flow(&record, "ns"), Some(("ns/a".to_string(), "ns/b".to_string(), 80, "TCP".to_string())));
    }

    #[test]
    fn process_flow_drops_records_missing_identity_fields() {
        let record = FlowRecord {
            source: Some(identity("ns", "")),
            destination: Some(identity("ns", "b")),
            protocol: Some("TCP".to_string()),
            port: Some(80),
            l4: None,
        };
        assert_eq!(process_flow(&record, "ns"), None);
    }
}
