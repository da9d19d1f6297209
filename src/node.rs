//! Node configuration parsed from environment variables.
//!
//! All fields have defaults so a bare `shardkv` invocation starts a usable
//! standalone node.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `SHARDKV_GID` | `1` | Replica-group id |
//! | `SHARDKV_BIND_ADDR` | `0.0.0.0:7100` | gRPC listener |
//! | `SHARDKV_ADVERTISE_ADDR` | bind addr | Name peers/clients dial |
//! | `SHARDKV_CTRLER_ADDRS` | empty | Controller replicas, comma-separated; empty = standalone |
//! | `SHARDKV_MAX_RAFT_STATE` | `-1` | Log-size snapshot bound in bytes; negative disables |
//! | `SHARDKV_METRICS_ADDR` | `0.0.0.0:8100` | Metrics/health HTTP listener |

use std::env;

use crate::config::Gid;

/// Configuration for one replica process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub gid: Gid,
    pub bind_addr: String,
    /// Address written into configs and dialed by peers. Defaults to the
    /// bind address; set it when binding a wildcard address.
    pub advertise_addr: String,
    pub ctrler_addrs: Vec<String>,
    pub max_raft_state: Option<usize>,
    pub metrics_addr: String,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let gid = env::var("SHARDKV_GID")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(1);

        let bind_addr =
            env::var("SHARDKV_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7100".to_string());

        let advertise_addr =
            env::var("SHARDKV_ADVERTISE_ADDR").unwrap_or_else(|_| bind_addr.clone());

        let ctrler_addrs =
            parse_addr_list(&env::var("SHARDKV_CTRLER_ADDRS").unwrap_or_default());

        let max_raft_state =
            parse_max_raft_state(env::var("SHARDKV_MAX_RAFT_STATE").ok().as_deref());

        let metrics_addr =
            env::var("SHARDKV_METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:8100".to_string());

        Self {
            gid,
            bind_addr,
            advertise_addr,
            ctrler_addrs,
            max_raft_state,
            metrics_addr,
        }
    }

    /// Standalone mode: no external controller configured.
    pub fn standalone(&self) -> bool {
        self.ctrler_addrs.is_empty()
    }
}

fn parse_addr_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Negative or unparsable values disable snapshotting.
fn parse_max_raft_state(s: Option<&str>) -> Option<usize> {
    let v: i64 = s?.trim().parse().ok()?;
    if v < 0 {
        None
    } else {
        Some(v as usize)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
