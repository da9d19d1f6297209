//! In-process cluster harness for integration tests.
//!
//! Builds replica groups over shared [`MemLog`]s, publishes configs through
//! a [`MemCtrler`], and routes all transport through [`LocalNet`], a
//! map-backed [`Network`] where server names resolve to live replicas.
//! Unregistering a name makes that replica unreachable without killing it;
//! crash/restart goes through the real kill/attach lifecycle, so a
//! restarted replica recovers from the shared log (snapshot first when the
//! log was truncated).

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shardkv::client::Clerk;
use shardkv::command::{OpKind, PulledShard};
use shardkv::config::{ClientId, Gid, MemCtrler, NSHARDS};
use shardkv::errors::KvError;
use shardkv::network::Network;
use shardkv::raft::MemLog;
use shardkv::server::ShardKv;

/// How long `wait_until` and clerk-driven sections may take before the test
/// is declared hung.
pub const TEST_DEADLINE: Duration = Duration::from_secs(30);

/// In-process transport: server names resolve to registered replicas.
#[derive(Default)]
pub struct LocalNet {
    servers: Mutex<HashMap<String, Arc<ShardKv>>>,
}

impl LocalNet {
    pub fn register(&self, name: &str, kv: Arc<ShardKv>) {
        self.servers.lock().unwrap().insert(name.to_string(), kv);
    }

    /// Makes `name` unreachable. The replica keeps running.
    pub fn unregister(&self, name: &str) {
        self.servers.lock().unwrap().remove(name);
    }

    fn lookup(&self, name: &str) -> Result<Arc<ShardKv>, KvError> {
        self.servers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| KvError::Unreachable(name.to_string()))
    }
}

#[async_trait::async_trait]
impl Network for LocalNet {
    async fn get(
        &self,
        server: &str,
        key: &str,
        client_id: ClientId,
        seq: i64,
    ) -> Result<String, KvError> {
        self.lookup(server)?.get(key.to_string(), client_id, seq).await
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
        self.lookup(server)?
            .put_append(kind, key.to_string(), value.to_string(), client_id, seq)
            .await
    }

    async fn pull_shard(
        &self,
        server: &str,
        shard: usize,
        _from_ver: u64,
        conf_num: u64,
    ) -> Result<Option<PulledShard>, KvError> {
        Ok(self.lookup(server)?.pull_shard(shard, conf_num))
    }

    async fn delete_shard(
        &self,
        server: &str,
        shard: usize,
        _from_ver: u64,
        conf_num: u64,
    ) -> Result<bool, KvError> {
        Ok(self.lookup(server)?.delete_shard(shard, conf_num).await)
    }
}

/// One replica group: a shared log plus its replicas.
pub struct TestGroup {
    pub gid: Gid,
    pub log: Arc<MemLog>,
    /// `None` while a replica is crashed.
    pub replicas: Vec<Option<Arc<ShardKv>>>,
    names: Vec<String>,
    /// Log slot backing each replica position (restart allocates a new one).
    slots: Vec<usize>,
    attach_count: usize,
}

impl TestGroup {
    pub fn server_names(&self) -> Vec<String> {
        self.names.clone()
    }

    pub fn name(&self, replica: usize) -> &str {
        &self.names[replica]
    }

    /// The replica at `idx`, which must be running.
    pub fn replica(&self, idx: usize) -> &Arc<ShardKv> {
        self.replicas[idx].as_ref().expect("replica is running")
    }

    /// Leader replica handle (position 0 unless moved).
    pub fn leader(&self) -> &Arc<ShardKv> {
        let slot = self.log.leader_slot().expect("group has a leader");
        let idx = self
            .slots
            .iter()
            .position(|&s| s == slot)
            .expect("leader slot is tracked");
        self.replica(idx)
    }
}

/// A whole in-process deployment.
pub struct TestCluster {
    pub ctrler: Arc<MemCtrler>,
    pub net: Arc<LocalNet>,
    pub groups: Vec<TestGroup>,
    max_raft_state: Option<usize>,
}

impl TestCluster {
    pub fn new(gids: &[Gid], replicas_per_group: usize, max_raft_state: Option<usize>) -> Self {
        let ctrler = Arc::new(MemCtrler::new());
        let net = Arc::new(LocalNet::default());

        let groups = gids
            .iter()
            .map(|&gid| {
                let log = MemLog::new();
                let mut group = TestGroup {
                    gid,
                    log: log.clone(),
                    replicas: Vec::new(),
                    names: Vec::new(),
                    slots: Vec::new(),
                    attach_count: 0,
                };
                for i in 0..replicas_per_group {
                    let name = format!("g{gid}-{i}");
                    let (raft, apply_rx) = log.attach();
                    let kv = ShardKv::start(
                        gid,
                        Arc::new(raft),
                        apply_rx,
                        ctrler.clone(),
                        net.clone(),
                        max_raft_state,
                    );
                    net.register(&name, kv.clone());
                    group.replicas.push(Some(kv));
                    group.names.push(name);
                    group.slots.push(group.attach_count);
                    group.attach_count += 1;
                }
                group
            })
            .collect();

        Self {
            ctrler,
            net,
            groups,
            max_raft_state,
        }
    }

    pub fn group(&self, gid: Gid) -> &TestGroup {
        self.groups
            .iter()
            .find(|g| g.gid == gid)
            .expect("known gid")
    }

    fn group_mut(&mut self, gid: Gid) -> &mut TestGroup {
        self.groups
            .iter_mut()
            .find(|g| g.gid == gid)
            .expect("known gid")
    }

    /// Publishes the next config with the given shard→group assignment; the
    /// group table lists every group in the cluster.
    pub fn publish(&self, shards: [Gid; NSHARDS]) -> u64 {
        let groups = self
            .groups
            .iter()
            .map(|g| (g.gid, g.names.clone()))
            .collect();
        self.ctrler.publish(shards, groups)
    }

    pub fn clerk(&self) -> Clerk {
        Clerk::new(self.ctrler.clone(), self.net.clone())
    }

    /// Kills a replica and removes it from the transport.
    pub fn crash(&mut self, gid: Gid, replica: usize) {
        let group = self.group_mut(gid);
        if let Some(kv) = group.replicas[replica].take() {
            kv.kill();
        }
        let name = group.names[replica].clone();
        self.net.unregister(&name);
    }

    /// Restarts a crashed replica against the group's shared log. Recovery
    /// happens through the apply stream (snapshot first if the log was
    /// truncated past the replica's history).
    pub fn restart(&mut self, gid: Gid, replica: usize) {
        let ctrler = self.ctrler.clone();
        let net = self.net.clone();
        let max_raft_state = self.max_raft_state;
        let group = self.group_mut(gid);
        assert!(group.replicas[replica].is_none(), "replica already running");

        let (raft, apply_rx) = group.log.attach();
        let kv = ShardKv::start(
            gid,
            Arc::new(raft),
            apply_rx,
            ctrler,
            net.clone(),
            max_raft_state,
        );
        group.slots[replica] = group.attach_count;
        group.attach_count += 1;
        net.register(&group.names[replica], kv.clone());
        group.replicas[replica] = Some(kv);
    }

    /// Hands group leadership to the replica at `replica`.
    pub fn set_leader(&self, gid: Gid, replica: usize) {
        let group = self.group(gid);
        group.log.set_leader(group.slots[replica]);
    }

    /// Waits until every running replica of every group has installed
    /// config `num`.
    pub async fn wait_all_config(&self, num: u64) {
        for group in &self.groups {
            for kv in group.replicas.iter().flatten() {
                let kv = kv.clone();
                wait_until(&format!("g{} reaches config {num}", group.gid), || {
                    kv.status().config_num >= num
                })
                .await;
            }
        }
    }
}

/// Polls `cond` until it holds, panicking after [`TEST_DEADLINE`].
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < TEST_DEADLINE {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Runs `fut` under the test deadline.
pub async fn with_deadline<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(TEST_DEADLINE, fut)
        .await
        .expect("test deadline exceeded")
}
