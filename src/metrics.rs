//! Prometheus metrics and the observability HTTP endpoint.
//!
//! Counters are incremented from the apply loop and the client-op path;
//! `start_metrics_server` exposes them at `GET /metrics` alongside a
//! `GET /health` JSON summary of the replica's apply-side state.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use tracing::{error, info};

use crate::server::ShardKv;

const NAMESPACE: &str = "shardkv";

lazy_static::lazy_static! {
    /// Client ops by kind and outcome (outcome is "ok" or a KvError label).
    pub static ref CLIENT_OPS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("client_ops_total", "Client operations by kind and outcome")
                .namespace(NAMESPACE),
            &["op", "result"]
        ).unwrap();

    /// Committed commands applied, by command kind.
    pub static ref APPLIED_COMMANDS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("applied_commands_total", "Committed log commands applied, by kind")
                .namespace(NAMESPACE),
            &["kind"]
        ).unwrap();

    /// Shards installed from a peer group.
    pub static ref SHARD_PULLS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("shard_pulls_total", "Shards installed from peer groups")
                .namespace(NAMESPACE)
        ).unwrap();

    /// Handed-off shards cleared after the new owner confirmed.
    pub static ref SHARD_DELETES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("shard_deletes_total", "Handed-off shards cleared locally")
                .namespace(NAMESPACE)
        ).unwrap();

    /// Snapshots handed to the consensus module.
    pub static ref SNAPSHOTS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("snapshots_total", "Snapshots handed to the consensus module")
                .namespace(NAMESPACE)
        ).unwrap();

    /// Currently installed config number.
    pub static ref CONFIG_NUM: IntGauge =
        IntGauge::with_opts(
            Opts::new("config_num", "Currently installed configuration number")
                .namespace(NAMESPACE)
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(CLIENT_OPS_TOTAL.clone()))?;
    registry.register(Box::new(APPLIED_COMMANDS_TOTAL.clone()))?;
    registry.register(Box::new(SHARD_PULLS_TOTAL.clone()))?;
    registry.register(Box::new(SHARD_DELETES_TOTAL.clone()))?;
    registry.register(Box::new(SNAPSHOTS_TOTAL.clone()))?;
    registry.register(Box::new(CONFIG_NUM.clone()))?;
    Ok(())
}

/// JSON body returned by `GET /health`.
#[derive(Debug, serde::Serialize)]
struct HealthResponse {
    gid: u64,
    config_num: u64,
    raft_index: u64,
    pending_pulls: usize,
}

async fn handler(req: Request<Body>, kv: Arc<ShardKv>) -> Result<Response<Body>, hyper::Error> {
    match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let families = prometheus::default_registry().gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&families, &mut buffer) {
                error!(error = %e, "metrics encode failed");
            }
            Ok(Response::builder()
                .status(200)
                .header("Content-Type", encoder.format_type())
                .body(Body::from(buffer))
                .unwrap())
        }
        "/health" => {
            let status = kv.status();
            let health = HealthResponse {
                gid: status.gid,
                config_num: status.config_num,
                raft_index: status.raft_index,
                pending_pulls: status.pending_pulls,
            };
            let body = serde_json::to_string(&health).unwrap_or_else(|_| "{}".to_string());
            Ok(Response::builder()
                .status(200)
                .header("Content-Type", "application/json")
                .body(Body::from(body))
                .unwrap())
        }
        _ => Ok(Response::builder()
            .status(404)
            .body(Body::from("not found"))
            .unwrap()),
    }
}

/// Starts the metrics/health HTTP server. Runs until the process exits;
/// spawn it in a background task.
pub async fn start_metrics_server(bind_addr: String, kv: Arc<ShardKv>) {
    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "invalid metrics bind address");
            return;
        }
    };

    let make_svc = make_service_fn(move |_conn| {
        let kv = kv.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let kv = kv.clone();
                async move { handler(req, kv).await }
            }))
        }
    });

    info!(addr = %addr, "metrics endpoint started — GET /metrics, GET /health");

    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        error!(error = %e, "metrics server error");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
