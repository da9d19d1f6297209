//! Client library for the sharded key/value service.
//!
//! A [`Clerk`] caches the shard configuration, routes each key to the group
//! owning its shard, and tries that group's servers in order. On
//! `WrongGroup`, `InTransit`, a leader miss, or a transport failure it
//! backs off briefly, re-queries the controller for the latest config, and
//! retries — forever, mirroring the at-least-once client contract. The
//! sequence number increments once per logical operation, never per retry,
//! so server-side dedup absorbs redeliveries.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::command::OpKind;
use crate::config::{key_to_shard, ClientId, Config, Ctrler, LATEST};
use crate::errors::KvError;
use crate::network::Network;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// One logical client. Cheap enough to hold for a session; safe to share
/// across tasks (the sequence counter is atomic).
pub struct Clerk {
    ctrler: Arc<dyn Ctrler>,
    net: Arc<dyn Network>,
    config: Mutex<Config>,
    id: ClientId,
    seq: AtomicI64,
}

impl Clerk {
    pub fn new(ctrler: Arc<dyn Ctrler>, net: Arc<dyn Network>) -> Self {
        Self {
            ctrler,
            net,
            config: Mutex::new(Config::default()),
            id: rand::thread_rng().gen_range(0..i64::MAX),
            seq: AtomicI64::new(0),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.id
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current value for `key`; `""` if the key does not exist. Retries
    /// until some group answers.
    pub async fn get(&self, key: &str) -> String {
        let seq = self.next_seq();
        loop {
            for server in self.owners_of(key) {
                match self.net.get(&server, key, self.id, seq).await {
                    Ok(value) => return value,
                    Err(KvError::WrongGroup) | Err(KvError::InTransit) => break,
                    Err(e) => {
                        // Wrong leader or unreachable: try the next server.
                        debug!(server = %server, error = %e, "get retry");
                    }
                }
            }
            self.refresh_config().await;
        }
    }

    pub async fn put(&self, key: &str, value: &str) {
        self.put_append(OpKind::Put, key, value).await;
    }

    pub async fn append(&self, key: &str, value: &str) {
        self.put_append(OpKind::Append, key, value).await;
    }

    async fn put_append(&self, kind: OpKind, key: &str, value: &str) {
        let seq = self.next_seq();
        loop {
            for server in self.owners_of(key) {
                match self
                    .net
                    .put_append(&server, kind, key, value, self.id, seq)
                    .await
                {
                    Ok(()) => return,
                    Err(KvError::WrongGroup) | Err(KvError::InTransit) => break,
                    Err(e) => {
                        debug!(server = %server, error = %e, "put_append retry");
                    }
                }
            }
            self.refresh_config().await;
        }
    }

    /// Servers of the group owning `key`'s shard in the cached config.
    fn owners_of(&self, key: &str) -> Vec<String> {
        let config = self.config.lock().unwrap();
        config.servers_for(key_to_shard(key)).to_vec()
    }

    /// Backs off, then replaces the cached config with the latest published
    /// one. A failed query keeps the cache; the next round retries.
    async fn refresh_config(&self) {
        sleep(RETRY_INTERVAL).await;
        match self.ctrler.query(LATEST).await {
            Ok(cfg) => {
                *self.config.lock().unwrap() = cfg;
            }
            Err(e) => debug!(error = %e, "controller query failed"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
