//! gRPC wire layer.
//!
//! Serves the `ShardKv` service defined in `proto/shardkv.proto`: the
//! client-facing `Get`/`PutAppend` plus the inter-group `PullShard`/
//! `DeleteShard`. Handler outcomes travel as error labels in the reply
//! (empty label = success) rather than gRPC status codes, so a follower
//! answering `wrong_leader` is still a successful RPC — the routing retry
//! lives in the clerk, not in the transport.
//!
//! The `ShardCtrler` service in the same proto file belongs to the external
//! controller; this crate only compiles its client stubs.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::command::OpKind;
use crate::config::NSHARDS;
use crate::errors::KvError;
use crate::server::ShardKv;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("shardkv");
}

use proto::shard_kv_server::{ShardKv as ShardKvRpc, ShardKvServer};

// ── Service implementation ────────────────────────────────────────────────────

/// Server-side implementation of the `ShardKv` gRPC service, delegating to
/// the local replica.
#[derive(Clone)]
pub struct ShardKvService {
    kv: Arc<ShardKv>,
}

impl ShardKvService {
    pub fn new(kv: Arc<ShardKv>) -> Self {
        Self { kv }
    }
}

fn err_label(result: &Result<impl Sized, KvError>) -> String {
    match result {
        Ok(_) => String::new(),
        Err(e) => e.label().to_string(),
    }
}

fn check_shard(shard: u32) -> Result<usize, Status> {
    let shard = shard as usize;
    if shard >= NSHARDS {
        return Err(Status::invalid_argument(format!(
            "shard {shard} out of range (NSHARDS = {NSHARDS})"
        )));
    }
    Ok(shard)
}

#[tonic::async_trait]
impl ShardKvRpc for ShardKvService {
    async fn get(
        &self,
        req: Request<proto::GetRequest>,
    ) -> Result<Response<proto::GetReply>, Status> {
        let req = req.into_inner();
        let result = self.kv.get(req.key, req.client_id, req.seq).await;
        let err = err_label(&result);
        Ok(Response::new(proto::GetReply {
            err,
            value: result.unwrap_or_default(),
        }))
    }

    async fn put_append(
        &self,
        req: Request<proto::PutAppendRequest>,
    ) -> Result<Response<proto::PutAppendReply>, Status> {
        let req = req.into_inner();
        let kind = match req.op.as_str() {
            "put" => OpKind::Put,
            "append" => OpKind::Append,
            other => {
                return Err(Status::invalid_argument(format!(
                    "op must be \"put\" or \"append\", got {other:?}"
                )))
            }
        };
        let result = self
            .kv
            .put_append(kind, req.key, req.value, req.client_id, req.seq)
            .await;
        Ok(Response::new(proto::PutAppendReply {
            err: err_label(&result),
        }))
    }

    async fn pull_shard(
        &self,
        req: Request<proto::PullShardRequest>,
    ) -> Result<Response<proto::PullShardReply>, Status> {
        let req = req.into_inner();
        let shard = check_shard(req.shard)?;
        let reply = match self.kv.pull_shard(shard, req.conf_num) {
            Some(data) => proto::PullShardReply {
                success: true,
                kv: data.kv,
                dedup: data.dedup,
                shard_ver: data.ver,
            },
            None => proto::PullShardReply::default(),
        };
        Ok(Response::new(reply))
    }

    async fn delete_shard(
        &self,
        req: Request<proto::DeleteShardRequest>,
    ) -> Result<Response<proto::DeleteShardReply>, Status> {
        let req = req.into_inner();
        let shard = check_shard(req.shard)?;
        let success = self.kv.delete_shard(shard, req.conf_num).await;
        Ok(Response::new(proto::DeleteShardReply { success }))
    }
}

// ── Server startup ────────────────────────────────────────────────────────────

/// Starts the gRPC server for one replica. Runs until the process exits;
/// spawn it in a background task.
pub async fn start_grpc_server(bind_addr: String, kv: Arc<ShardKv>) {
    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "invalid gRPC bind address");
            return;
        }
    };

    info!(gid = kv.gid(), addr = %addr, "gRPC server starting");

    if let Err(e) = Server::builder()
        .add_service(ShardKvServer::new(ShardKvService::new(kv)))
        .serve(addr)
        .await
    {
        error!(error = %e, "gRPC server error");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
