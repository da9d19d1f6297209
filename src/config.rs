//! Shard configurations and the controller seam.
//!
//! A deployment's shard controller publishes a monotonically numbered
//! sequence of [`Config`] records, each assigning every shard to exactly one
//! replica group. This module defines the record itself, the key→shard
//! mapping that is part of the public contract, and the [`Ctrler`] trait
//! through which the rest of the crate consumes the controller.
//!
//! The controller service is external; this crate only queries it. Two
//! implementations of the seam exist:
//!
//! - [`GrpcCtrler`](crate::network::GrpcCtrler) — the wire client.
//! - [`MemCtrler`] — an in-process config sequence for standalone nodes and
//!   tests.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::errors::KvError;

/// Number of shards. Fixed for the lifetime of a deployment.
pub const NSHARDS: usize = 10;

/// Replica-group identifier. Group 0 is reserved for "no owner".
pub type Gid = u64;

/// Client identifier carried in every client op.
pub type ClientId = i64;

/// Maps a key to its shard: first byte modulo [`NSHARDS`], empty key → 0.
///
/// Part of the public contract — clients and servers must agree on it.
pub fn key_to_shard(key: &str) -> usize {
    match key.as_bytes().first() {
        Some(&b) => b as usize % NSHARDS,
        None => 0,
    }
}

// ── Config record ─────────────────────────────────────────────────────────────

/// One published shard assignment.
///
/// `num` increases by exactly one per published config; `num == 0` is the
/// pre-history config with no owners. `shards[s]` names the group owning
/// shard `s`; `groups` maps each group to its server names in connection
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub num: u64,
    pub shards: [Gid; NSHARDS],
    pub groups: HashMap<Gid, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num: 0,
            shards: [0; NSHARDS],
            groups: HashMap::new(),
        }
    }
}

impl Config {
    /// The group owning `shard` in this config.
    pub fn owner(&self, shard: usize) -> Gid {
        self.shards[shard]
    }

    /// Whether `gid` owns `shard` in this config.
    pub fn owns(&self, shard: usize, gid: Gid) -> bool {
        self.shards[shard] == gid
    }

    /// Server names of the group owning `shard`, empty if unowned.
    pub fn servers_for(&self, shard: usize) -> &[String] {
        self.groups
            .get(&self.shards[shard])
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ── Controller seam ───────────────────────────────────────────────────────────

/// Query argument meaning "the latest published config".
pub const LATEST: i64 = -1;

/// The consumed shard-controller interface.
///
/// `query(n)` returns the config numbered `n` if it has been published (or
/// the latest published config when `n` is [`LATEST`] or beyond the head).
/// Configs are immutable once published and numbered without gaps.
#[async_trait::async_trait]
pub trait Ctrler: Send + Sync {
    async fn query(&self, num: i64) -> Result<Config, KvError>;
}

/// In-process controller oracle.
///
/// Holds the published sequence in memory. Standalone nodes seed it with a
/// single config owning every shard; tests push configs to drive
/// reconfiguration.
pub struct MemCtrler {
    configs: Mutex<Vec<Config>>,
}

impl MemCtrler {
    /// Starts with only the pre-history config 0.
    pub fn new() -> Self {
        Self {
            configs: Mutex::new(vec![Config::default()]),
        }
    }

    /// Publishes the next config. The shard assignment and group table are
    /// taken as-is; `num` is assigned automatically.
    pub fn publish(&self, shards: [Gid; NSHARDS], groups: HashMap<Gid, Vec<String>>) -> u64 {
        let mut configs = self.configs.lock().unwrap();
        let num = configs.len() as u64;
        configs.push(Config {
            num,
            shards,
            groups,
        });
        num
    }

    /// The number of the latest published config.
    pub fn latest_num(&self) -> u64 {
        self.configs.lock().unwrap().last().unwrap().num
    }
}

impl Default for MemCtrler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Ctrler for MemCtrler {
    async fn query(&self, num: i64) -> Result<Config, KvError> {
        let configs = self.configs.lock().unwrap();
        let cfg = if num < 0 || num as usize >= configs.len() {
            configs.last().unwrap()
        } else {
            &configs[num as usize]
        };
        Ok(cfg.clone())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
