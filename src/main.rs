use std::collections::HashMap;
use std::sync::Arc;

use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shardkv::config::{Ctrler, MemCtrler, NSHARDS};
use shardkv::network::{GrpcCtrler, GrpcNetwork};
use shardkv::node::NodeConfig;
use shardkv::raft::MemLog;
use shardkv::server::ShardKv;
use shardkv::{grpc, metrics};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();
    metrics::register_metrics()?;

    let node = NodeConfig::from_env();
    info!(
        gid = node.gid,
        bind = %node.bind_addr,
        advertise = %node.advertise_addr,
        controllers = node.ctrler_addrs.len(),
        "starting shardkv node"
    );

    // With no controller configured, run standalone: a seeded in-process
    // controller assigns every shard to this group.
    let ctrler: Arc<dyn Ctrler> = if node.standalone() {
        info!("no controller configured — standalone mode, this group owns all shards");
        let ctrler = Arc::new(MemCtrler::new());
        let mut groups = HashMap::new();
        groups.insert(node.gid, vec![node.advertise_addr.clone()]);
        ctrler.publish([node.gid; NSHARDS], groups);
        ctrler
    } else {
        Arc::new(GrpcCtrler::new(node.ctrler_addrs.clone()))
    };

    // Single-replica in-memory log. Multi-replica deployments plug a
    // consensus module in at the Raft trait instead.
    let log = MemLog::new();
    let (raft, apply_rx) = log.attach();

    let kv = ShardKv::start(
        node.gid,
        Arc::new(raft),
        apply_rx,
        ctrler,
        Arc::new(GrpcNetwork::new()),
        node.max_raft_state,
    );

    tokio::spawn(metrics::start_metrics_server(
        node.metrics_addr.clone(),
        kv.clone(),
    ));
    tokio::spawn(grpc::start_grpc_server(node.bind_addr.clone(), kv.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    kv.kill();
    Ok(())
}
