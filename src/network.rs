//! Transport seam for calls to named servers.
//!
//! Config records name servers as strings; everything that dials a peer —
//! the clerk routing client ops, the shard puller driving migrations — goes
//! through the [`Network`] trait so the wire can be swapped out (the test
//! harness runs an in-process implementation).
//!
//! [`GrpcNetwork`] is the wire implementation: one lazily-dialed tonic
//! channel per server name, reused across calls. `connect_lazy()` returns
//! immediately without a TCP handshake; tonic dials on the first RPC and
//! reconnects automatically on failure. Connect and per-call timeouts keep
//! a dead peer from stalling a poller tick for long.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::command::{OpKind, PulledShard};
use crate::config::{ClientId, Config, Ctrler, Gid, NSHARDS};
use crate::errors::KvError;
use crate::grpc::proto;
use crate::grpc::proto::shard_ctrler_client::ShardCtrlerClient;
use crate::grpc::proto::shard_kv_client::ShardKvClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const RPC_TIMEOUT: Duration = Duration::from_secs(4);

/// Calls against a named server. All methods are idempotent at the callee;
/// a transport failure surfaces as [`KvError::Unreachable`] and the caller
/// retries elsewhere or on the next tick.
#[async_trait::async_trait]
pub trait Network: Send + Sync {
    async fn get(
        &self,
        server: &str,
        key: &str,
        client_id: ClientId,
        seq: i64,
    ) -> Result<String, KvError>;

    async fn put_append(
        &self,
        server: &str,
        kind: OpKind,
        key: &str,
        value: &str,
        client_id: ClientId,
        seq: i64,
    ) -> Result<(), KvError>;

    /// `Ok(None)` means the responder has not reached `conf_num` yet.
    async fn pull_shard(
        &self,
        server: &str,
        shard: usize,
        from_ver: u64,
        conf_num: u64,
    ) -> Result<Option<PulledShard>, KvError>;

    /// `Ok(true)` once the responder committed the delete.
    async fn delete_shard(
        &self,
        server: &str,
        shard: usize,
        from_ver: u64,
        conf_num: u64,
    ) -> Result<bool, KvError>;
}

/// Normalizes a server name to a URI tonic's `Endpoint` understands.
fn server_uri(server: &str) -> String {
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("http://{server}")
    }
}

fn lazy_endpoint(server: &str) -> Result<Channel, KvError> {
    Endpoint::from_shared(server_uri(server))
        .map_err(|e| KvError::Unreachable(format!("{server}: {e}")))
        .map(|ep| {
            ep.connect_timeout(CONNECT_TIMEOUT)
                .timeout(RPC_TIMEOUT)
                .connect_lazy()
        })
}

fn unreachable(server: &str, err: impl std::fmt::Display) -> KvError {
    KvError::Unreachable(format!("{server}: {err}"))
}

// ── gRPC peer transport ───────────────────────────────────────────────────────

/// The wire [`Network`]: cached `ShardKv` clients keyed by server name.
#[derive(Default)]
pub struct GrpcNetwork {
    clients: Mutex<HashMap<String, ShardKvClient<Channel>>>,
}

impl GrpcNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, server: &str) -> Result<ShardKvClient<Channel>, KvError> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(server) {
            return Ok(client.clone());
        }
        let client = ShardKvClient::new(lazy_endpoint(server)?);
        clients.insert(server.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl Network for GrpcNetwork {
    async fn get(
        &self,
        server: &str,
        key: &str,
        client_id: ClientId,
        seq: i64,
    ) -> Result<String, KvError> {
        let mut client = self.client_for(server)?;
        let reply = client
            .get(proto::GetRequest {
                key: key.to_string(),
                client_id,
                seq,
            })
            .await
            .map_err(|e| unreachable(server, e))?
            .into_inner();
        match KvError::from_label(&reply.err) {
            None => Ok(reply.value),
            Some(err) => Err(err),
        }
    }

    async fn put_append(
        &self,
        server: &str,
        kind: OpKind,
        key: &str,
        value: &str,
        client_id: ClientId,
        seq: i64,
    ) -> Result<(), KvError> {
        let mut client = self.client_for(server)?;
        let reply = client
            .put_append(proto::PutAppendRequest {
                op: kind.as_str().to_string(),
                key: key.to_string(),
                value: value.to_string(),
                client_id,
                seq,
            })
            .await
            .map_err(|e| unreachable(server, e))?
            .into_inner();
        match KvError::from_label(&reply.err) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn pull_shard(
        &self,
        server: &str,
        shard: usize,
        from_ver: u64,
        conf_num: u64,
    ) -> Result<Option<PulledShard>, KvError> {
        let mut client = self.client_for(server)?;
        let reply = client
            .pull_shard(proto::PullShardRequest {
                shard: shard as u32,
                from_ver,
                conf_num,
            })
            .await
            .map_err(|e| unreachable(server, e))?
            .into_inner();
        if !reply.success {
            return Ok(None);
        }
        Ok(Some(PulledShard {
            kv: reply.kv,
            dedup: reply.dedup,
            ver: reply.shard_ver,
        }))
    }

    async fn delete_shard(
        &self,
        server: &str,
        shard: usize,
        from_ver: u64,
        conf_num: u64,
    ) -> Result<bool, KvError> {
        let mut client = self.client_for(server)?;
        let reply = client
            .delete_shard(proto::DeleteShardRequest {
                shard: shard as u32,
                from_ver,
                conf_num,
            })
            .await
            .map_err(|e| unreachable(server, e))?
            .into_inner();
        Ok(reply.success)
    }
}

// ── gRPC controller client ────────────────────────────────────────────────────

/// Wire client for the external shard controller. The controller is itself
/// replicated; `query` walks the replica list until one answers.
pub struct GrpcCtrler {
    addrs: Vec<String>,
    clients: Mutex<HashMap<String, ShardCtrlerClient<Channel>>>,
}

impl GrpcCtrler {
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, addr: &str) -> Result<ShardCtrlerClient<Channel>, KvError> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }
        let client = ShardCtrlerClient::new(lazy_endpoint(addr)?);
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl Ctrler for GrpcCtrler {
    async fn query(&self, num: i64) -> Result<Config, KvError> {
        let mut last_err = KvError::Unreachable("no controller addresses".to_string());
        for addr in &self.addrs {
            let mut client = match self.client_for(addr) {
                Ok(client) => client,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            match client.query(proto::QueryRequest { num }).await {
                Ok(reply) => {
                    let msg = reply
                        .into_inner()
                        .config
                        .ok_or_else(|| unreachable(addr, "empty query reply"))?;
                    return Ok(config_from_msg(msg));
                }
                Err(e) => last_err = unreachable(addr, e),
            }
        }
        Err(last_err)
    }
}

/// Decodes a wire config. A short or long shard list is tolerated by
/// truncating or zero-filling; a correct controller always sends exactly
/// `NSHARDS` entries.
pub fn config_from_msg(msg: proto::ConfigMsg) -> Config {
    let mut shards = [0 as Gid; NSHARDS];
    for (slot, gid) in shards.iter_mut().zip(msg.shards) {
        *slot = gid;
    }
    Config {
        num: msg.num,
        shards,
        groups: msg
            .groups
            .into_iter()
            .map(|(gid, list)| (gid, list.servers))
            .collect(),
    }
}

/// Encodes a config for the wire.
pub fn config_to_msg(cfg: &Config) -> proto::ConfigMsg {
    proto::ConfigMsg {
        num: cfg.num,
        shards: cfg.shards.to_vec(),
        groups: cfg
            .groups
            .iter()
            .map(|(gid, servers)| {
                (*gid, proto::ServerList {
                    servers: servers.clone(),
                })
            })
            .collect(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_uri_normalization() {
        assert_eq!(server_uri("10.0.0.1:7100"), "http://10.0.0.1:7100");
        assert_eq!(server_uri("http://10.0.0.1:7100"), "http://10.0.0.1:7100");
        assert_eq!(server_uri("https://kv.example:443"), "https://kv.example:443");
    }

    #[test]
    fn config_msg_roundtrip() {
        let mut groups = HashMap::new();
        groups.insert(101u64, vec!["g101-0".to_string(), "g101-1".to_string()]);
        groups.insert(102u64, vec!["g102-0".to_string()]);
        let mut shards = [101 as Gid; NSHARDS];
        shards[7] = 102;
        let cfg = Config {
            num: 4,
            shards,
            groups,
        };

        let back = config_from_msg(config_to_msg(&cfg));
        assert_eq!(back, cfg);
    }

    #[test]
    fn short_shard_list_zero_fills() {
        let msg = proto::ConfigMsg {
            num: 1,
            shards: vec![101, 101],
            groups: HashMap::new(),
        };
        let cfg = config_from_msg(msg);
        assert_eq!(cfg.shards[0], 101);
        assert_eq!(cfg.shards[2], 0);
    }

    #[tokio::test]
    async fn lazy_endpoint_does_not_dial() {
        // connect_lazy defers the handshake, so building a client for an
        // unreachable name succeeds.
        assert!(lazy_endpoint("127.0.0.1:1").is_ok());
        assert!(lazy_endpoint("not a uri").is_err());
    }
}
