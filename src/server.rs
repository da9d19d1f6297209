//! The per-replica-group state machine.
//!
//! One [`ShardKv`] instance is a single replica of a group. It turns the
//! committed command stream from the consensus module into per-shard state,
//! reconfigures shard ownership when the controller publishes a new config,
//! migrates shard contents between groups, and de-duplicates client
//! requests.
//!
//! ## Structure
//!
//! - **Apply loop** — single task, the only mutator of apply-side state.
//!   Consumes the apply stream in log order, so every replica of the group
//!   holds identical state at equal log indexes.
//! - **Config poller** — queries the controller for `config.num + 1` and
//!   proposes it once the current config has fully settled. Configs are
//!   installed strictly one at a time.
//! - **Shard puller** — drives outstanding pull and delete obligations
//!   against peer groups; every step lands back in the log before it takes
//!   effect.
//! - **Handlers** — client ops and inter-group RPCs; each proposes through
//!   the log and parks on a reply slot.
//! - **Snapshot watcher** — bounds the retained log by handing the encoded
//!   apply-side state to the consensus module.
//!
//! ## Locking
//!
//! A single mutex guards all apply-side state plus the reply registry. It
//! is never held across an `.await`, a proposal, or a peer RPC; background
//! loops copy what they need under the lock and work on the copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::command::{Command, Op, OpKind, PullSource, PulledShard, ShardVer};
use crate::config::{key_to_shard, ClientId, Config, Ctrler, Gid, NSHARDS};
use crate::errors::KvError;
use crate::metrics;
use crate::network::Network;
use crate::raft::{ApplyMsg, Raft};
use crate::reply::{await_reply, ReplyRegistry, ReplyRes, DEFAULT_SLOTS};
use crate::store::ShardStore;

/// Snapshot once the retained log exceeds this fraction of the bound.
const SNAPSHOT_THRESHOLD: f64 = 0.8;
/// How long a handler waits for its proposal to commit.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_CONFIG_INTERVAL: Duration = Duration::from_millis(100);
const POLL_SHARDS_INTERVAL: Duration = Duration::from_millis(100);

// ── Apply-side state ──────────────────────────────────────────────────────────

struct State {
    config: Config,
    store: ShardStore,
    /// Config number at which each shard is held in a usable state. A shard
    /// is serviceable iff it is owned and `ver[s] == config.num`.
    ver: [u64; NSHARDS],
    /// Outstanding migration obligations, keyed by `(shard, from, to)`.
    pull_map: HashMap<ShardVer, PullSource>,
    /// Highest applied log index.
    raft_index: u64,
    replies: ReplyRegistry,
}

/// Everything needed to recover a replica, in stable field order.
#[derive(Serialize, Deserialize)]
struct SnapshotBlob {
    dbs: Vec<HashMap<String, String>>,
    raft_index: u64,
    dedup: Vec<HashMap<ClientId, i64>>,
    config: Config,
    ver: [u64; NSHARDS],
    pull_map: Vec<(ShardVer, PullSource)>,
}

fn encode_snapshot(state: &State) -> Vec<u8> {
    let blob = SnapshotBlob {
        dbs: state.store.dbs.clone(),
        raft_index: state.raft_index,
        dedup: state.store.dedup.clone(),
        config: state.config.clone(),
        ver: state.ver,
        pull_map: state.pull_map.iter().map(|(k, v)| (*k, v.clone())).collect(),
    };
    serde_json::to_vec(&blob).expect("snapshot state encodes")
}

/// Point-in-time summary of a replica's apply-side state.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub gid: Gid,
    pub config_num: u64,
    pub raft_index: u64,
    pub ver: [u64; NSHARDS],
    pub pending_pulls: usize,
}

// ── Replica ───────────────────────────────────────────────────────────────────

/// One replica of a sharded key/value group.
pub struct ShardKv {
    gid: Gid,
    raft: Arc<dyn Raft>,
    ctrler: Arc<dyn Ctrler>,
    net: Arc<dyn Network>,
    max_raft_state: Option<usize>,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
}

impl ShardKv {
    /// Wires a replica and spawns its background loops. Returns quickly;
    /// all long-running work happens on spawned tasks.
    ///
    /// Recovery is driven entirely by the apply stream: a consensus module
    /// delivers the latest snapshot as the first message to a replica that
    /// restarts behind a truncated log.
    pub fn start(
        gid: Gid,
        raft: Arc<dyn Raft>,
        apply_rx: UnboundedReceiver<ApplyMsg>,
        ctrler: Arc<dyn Ctrler>,
        net: Arc<dyn Network>,
        max_raft_state: Option<usize>,
    ) -> Arc<Self> {
        let kv = Arc::new(Self {
            gid,
            raft,
            ctrler,
            net,
            max_raft_state,
            state: Mutex::new(State {
                config: Config::default(),
                store: ShardStore::new(),
                ver: [0; NSHARDS],
                pull_map: HashMap::new(),
                raft_index: 0,
                replies: ReplyRegistry::new(DEFAULT_SLOTS),
            }),
            shutdown: watch::channel(false).0,
        });

        tokio::spawn(kv.clone().run_apply(apply_rx));
        tokio::spawn(kv.clone().run_config_poller());
        tokio::spawn(kv.clone().run_shard_puller());

        info!(gid, max_raft_state = ?max_raft_state, "replica started");
        kv
    }

    /// Stops the consensus module and all background loops.
    pub fn kill(&self) {
        self.raft.kill();
        let _ = self.shutdown.send(true);
        info!(gid = self.gid, "replica stopped");
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Apply-side state summary, for tests and the health endpoint.
    pub fn status(&self) -> Status {
        let state = self.state.lock().unwrap();
        Status {
            gid: self.gid,
            config_num: state.config.num,
            raft_index: state.raft_index,
            ver: state.ver,
            pending_pulls: state.pull_map.len(),
        }
    }

    /// Deep copy of one shard's map and dedup table.
    pub fn export_shard(&self, shard: usize) -> (HashMap<String, String>, HashMap<ClientId, i64>) {
        self.state.lock().unwrap().store.export(shard)
    }

    /// The pull map, sorted by key for stable comparison.
    pub fn pull_map_snapshot(&self) -> Vec<(ShardVer, PullSource)> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<_> = state
            .pull_map
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        entries.sort_by_key(|(k, _)| (k.shard, k.from_ver, k.to_conf));
        entries
    }

    // ── Client RPC handlers ──────────────────────────────────────────────

    /// Fetches the current value for a key; missing keys read as `""`.
    pub async fn get(&self, key: String, client_id: ClientId, seq: i64) -> Result<String, KvError> {
        let op = Op {
            kind: OpKind::Get,
            key,
            value: String::new(),
            client_id,
            seq,
        };
        self.submit(op).await
    }

    /// Applies a `Put` or `Append`.
    pub async fn put_append(
        &self,
        kind: OpKind,
        key: String,
        value: String,
        client_id: ClientId,
        seq: i64,
    ) -> Result<(), KvError> {
        let op = Op {
            kind,
            key,
            value,
            client_id,
            seq,
        };
        self.submit(op).await.map(|_| ())
    }

    /// Proposes a client op, waits on its reply slot, and classifies the
    /// outcome. Anything other than a committed, matching op collapses to
    /// `WrongLeader` so the client rediscovers the leader and retries.
    async fn submit(&self, op: Op) -> Result<String, KvError> {
        let kind = op.kind.as_str();
        let outcome = self.submit_inner(op).await;
        let label = match &outcome {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::CLIENT_OPS_TOTAL.with_label_values(&[kind, label]).inc();
        outcome
    }

    async fn submit_inner(&self, op: Op) -> Result<String, KvError> {
        let Some(start) = self.raft.start(Command::Client(op.clone())) else {
            return Err(KvError::WrongLeader);
        };
        let rx = self.state.lock().unwrap().replies.subscribe(start.index);

        let Some(res) = await_reply(rx, REPLY_TIMEOUT).await else {
            return Err(KvError::WrongLeader);
        };
        if res.wrong_group {
            Err(KvError::WrongGroup)
        } else if res.in_transit {
            Err(KvError::InTransit)
        } else if res.in_op.as_ref() == Some(&op) {
            Ok(res.value)
        } else {
            // A different command committed at our index.
            Err(KvError::WrongLeader)
        }
    }

    // ── Inter-group RPC handlers ─────────────────────────────────────────

    /// Serves a peer group's pull of `shard`, from local state without
    /// going through the log. Safe because handing out a copy is
    /// idempotent; the receiver only installs it via its own log. `None`
    /// means this replica has not reached `conf_num` yet.
    pub fn pull_shard(&self, shard: usize, conf_num: u64) -> Option<PulledShard> {
        let state = self.state.lock().unwrap();
        if state.config.num < conf_num {
            return None;
        }
        let (kv, dedup) = state.store.export(shard);
        Some(PulledShard {
            kv,
            dedup,
            ver: state.ver[shard],
        })
    }

    /// Serves a peer group's delete confirmation. Mutates, so the delete
    /// goes through the log; returns `true` only once the committed result
    /// reports the shard is gone. Repeating a confirmed delete re-clears an
    /// already-empty shard and still succeeds.
    pub async fn delete_shard(&self, shard: usize, conf_num: u64) -> bool {
        let handed_off = {
            let state = self.state.lock().unwrap();
            state.ver[shard] <= conf_num
        };
        if !handed_off {
            return false;
        }
        let Some(start) = self.raft.start(Command::DeleteShard { shard, conf_num }) else {
            return false;
        };
        let rx = self.state.lock().unwrap().replies.subscribe(start.index);
        match await_reply(rx, REPLY_TIMEOUT).await {
            Some(res) => !res.in_transit,
            None => false,
        }
    }

    // ── Apply loop ───────────────────────────────────────────────────────

    async fn run_apply(self: Arc<Self>, mut apply_rx: UnboundedReceiver<ApplyMsg>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                msg = apply_rx.recv() => {
                    let Some(msg) = msg else {
                        debug!(gid = self.gid, "apply stream closed");
                        return;
                    };
                    match msg {
                        ApplyMsg::Snapshot { index, data } => self.install_snapshot(index, &data),
                        ApplyMsg::Command { index, command } => self.apply_command(index, command),
                    }
                    self.maybe_snapshot();
                }
            }
        }
    }

    fn apply_command(&self, index: u64, command: Command) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.raft_index = index;
        state.replies.ensure(index);
        metrics::APPLIED_COMMANDS_TOTAL
            .with_label_values(&[command.kind()])
            .inc();

        match command {
            Command::Client(op) => self.apply_client_op(state, index, op),
            Command::InstallConfig(cfg) => self.apply_install_config(state, cfg),
            Command::InstallShard { sv, data } => self.apply_install_shard(state, sv, data),
            Command::DeleteShard { shard, conf_num } => {
                self.apply_delete_shard(state, index, shard, conf_num)
            }
            Command::RemovePull { sv } => {
                state.pull_map.remove(&sv);
            }
        }
    }

    fn apply_client_op(&self, state: &mut State, index: u64, op: Op) {
        let shard = key_to_shard(&op.key);
        if !state.config.owns(shard, self.gid) {
            state.replies.deliver(index, ReplyRes::wrong_group());
            return;
        }
        if state.ver[shard] != state.config.num {
            // Owned, but the pull for this config has not landed yet.
            state.replies.deliver(index, ReplyRes::in_transit());
            return;
        }

        match op.kind {
            OpKind::Get => {
                state.store.apply_if_new(shard, op.client_id, op.seq, |_| {});
            }
            OpKind::Put => {
                let (key, value) = (op.key.clone(), op.value.clone());
                state.store.apply_if_new(shard, op.client_id, op.seq, move |db| {
                    db.insert(key, value);
                });
            }
            OpKind::Append => {
                let (key, value) = (op.key.clone(), op.value.clone());
                state.store.apply_if_new(shard, op.client_id, op.seq, move |db| {
                    db.entry(key).or_default().push_str(&value);
                });
            }
        }

        let value = state.store.get(shard, &op.key);
        state.replies.deliver(index, ReplyRes::applied(value, op));
    }

    fn apply_install_config(&self, state: &mut State, new: Config) {
        if new.num <= state.config.num {
            return;
        }
        for shard in 0..NSHARDS {
            if !new.owns(shard, self.gid) {
                continue;
            }
            if state.ver[shard] == state.config.num {
                // Held through the previous config (or pre-history): no
                // pull needed.
                state.ver[shard] = new.num;
            } else {
                let sv = ShardVer {
                    shard,
                    from_ver: state.config.num,
                    to_conf: new.num,
                };
                let servers = state.config.servers_for(shard).to_vec();
                state.pull_map.insert(sv, PullSource {
                    servers,
                    valid: true,
                });
            }
        }
        // Shards lost in `new` stay in the store at their old version; the
        // new owner pulls them from us and confirms with a delete.
        info!(
            gid = self.gid,
            num = new.num,
            pending_pulls = state.pull_map.len(),
            "installed configuration"
        );
        metrics::CONFIG_NUM.set(new.num as i64);
        state.config = new;
    }

    fn apply_install_shard(&self, state: &mut State, sv: ShardVer, data: PulledShard) {
        let valid = state.pull_map.get(&sv).map(|e| e.valid).unwrap_or(false);
        // Accept only data taken at the immediately prior config; anything
        // else is a stale proposal from before a config change.
        if !valid || state.config.num == 0 || data.ver != state.config.num - 1 {
            return;
        }
        state.store.install(sv.shard, &data);
        if let Some(entry) = state.pull_map.get_mut(&sv) {
            // Data is in; we still owe the source group a delete.
            entry.valid = false;
        }
        state.ver[sv.shard] = state.config.num;
        info!(
            gid = self.gid,
            shard = sv.shard,
            num = state.config.num,
            keys = data.kv.len(),
            "installed pulled shard"
        );
        metrics::SHARD_PULLS_TOTAL.inc();
    }

    fn apply_delete_shard(&self, state: &mut State, index: u64, shard: usize, conf_num: u64) {
        if state.ver[shard] <= conf_num {
            state.store.clear(shard);
            state.replies.deliver(index, ReplyRes::delete_done(false));
            metrics::SHARD_DELETES_TOTAL.inc();
            debug!(gid = self.gid, shard, conf_num, "cleared handed-off shard");
        } else {
            // Re-owned at a later config; the peer should retry.
            state.replies.deliver(index, ReplyRes::delete_done(true));
        }
    }

    fn install_snapshot(&self, index: u64, data: &[u8]) {
        let blob: SnapshotBlob = match serde_json::from_slice(data) {
            Ok(blob) => blob,
            Err(e) => {
                error!(gid = self.gid, index, error = %e, "snapshot decode failed");
                panic!("unrecoverable: corrupt snapshot at index {index}");
            }
        };
        let mut state = self.state.lock().unwrap();
        state.store.dbs = blob.dbs;
        state.store.dedup = blob.dedup;
        state.raft_index = blob.raft_index;
        state.config = blob.config;
        state.ver = blob.ver;
        state.pull_map = blob.pull_map.into_iter().collect();
        // The reply registry is untouched: slots belong to handlers, not to
        // replicated state.
        metrics::CONFIG_NUM.set(state.config.num as i64);
        info!(
            gid = self.gid,
            index = state.raft_index,
            num = state.config.num,
            "installed snapshot"
        );
    }

    // ── Snapshot watcher ─────────────────────────────────────────────────

    fn maybe_snapshot(self: &Arc<Self>) {
        let Some(limit) = self.max_raft_state else {
            return;
        };
        if (self.raft.state_size() as f64) <= SNAPSHOT_THRESHOLD * limit as f64 {
            return;
        }
        // Concurrent attempts are safe: the consensus module keeps the
        // newest snapshot.
        let kv = self.clone();
        tokio::spawn(async move { kv.save_snapshot() });
    }

    fn save_snapshot(&self) {
        let (index, blob) = {
            let state = self.state.lock().unwrap();
            (state.raft_index, encode_snapshot(&state))
        };
        // Lock released before handing over; the module may block.
        self.raft.snapshot(index, blob);
        metrics::SNAPSHOTS_TOTAL.inc();
        debug!(gid = self.gid, index, "snapshot handed to consensus module");
    }

    // ── Config poller ────────────────────────────────────────────────────

    async fn run_config_poller(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(POLL_CONFIG_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.poll_config_once().await,
            }
        }
    }

    /// Queries for the next config number and proposes it if this group has
    /// fully settled into the current one. Configs are never skipped.
    async fn poll_config_once(&self) {
        let next = self.state.lock().unwrap().config.num + 1;
        let cfg = match self.ctrler.query(next as i64).await {
            Ok(cfg) => cfg,
            Err(e) => {
                debug!(gid = self.gid, error = %e, "controller query failed");
                return;
            }
        };
        if cfg.num != next {
            return;
        }

        let ready = {
            let state = self.state.lock().unwrap();
            let settled = (0..NSHARDS)
                .all(|s| !state.config.owns(s, self.gid) || state.ver[s] == state.config.num);
            // Delete debts also block: the old owner must confirm before we
            // move on.
            settled && state.pull_map.is_empty()
        };
        if !ready {
            return;
        }
        if self.raft.start(Command::InstallConfig(cfg)).is_some() {
            debug!(gid = self.gid, num = next, "proposed next configuration");
        }
    }

    // ── Shard puller ─────────────────────────────────────────────────────

    async fn run_shard_puller(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(POLL_SHARDS_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.poll_shards_once().await,
            }
        }
    }

    /// Drives every outstanding migration obligation once. RPCs are
    /// idempotent; any failure simply defers the entry to the next tick.
    async fn poll_shards_once(&self) {
        let work: Vec<(ShardVer, PullSource)> = {
            let state = self.state.lock().unwrap();
            state
                .pull_map
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect()
        };
        for (sv, source) in work {
            if source.valid {
                self.drive_pull(sv, &source.servers).await;
            } else {
                self.drive_delete(sv, &source.servers).await;
            }
        }
    }

    async fn drive_pull(&self, sv: ShardVer, servers: &[String]) {
        for server in servers {
            match self
                .net
                .pull_shard(server, sv.shard, sv.from_ver, sv.to_conf)
                .await
            {
                Ok(Some(data)) => {
                    // Got a copy; installation still goes through the log.
                    self.raft.start(Command::InstallShard { sv, data });
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(gid = self.gid, server = %server, error = %e, "pull failed");
                }
            }
        }
    }

    async fn drive_delete(&self, sv: ShardVer, servers: &[String]) {
        for server in servers {
            match self
                .net
                .delete_shard(server, sv.shard, sv.from_ver, sv.to_conf)
                .await
            {
                Ok(true) => {
                    self.raft.start(Command::RemovePull { sv });
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(gid = self.gid, server = %server, error = %e, "delete failed");
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
