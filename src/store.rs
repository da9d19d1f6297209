//! Per-shard key/value maps and dedup tables.
//!
//! Each shard carries its own map and its own client→highest-seq table, so
//! a migration hands both over together: a client whose request was
//! absorbed by the old owner and whose retry lands on the new owner is not
//! applied twice. All mutation happens on the apply path.

use std::collections::HashMap;

use crate::command::PulledShard;
use crate::config::{ClientId, NSHARDS};

/// The sharded store. Indexed by shard id in `[0, NSHARDS)`.
#[derive(Debug, Clone)]
pub struct ShardStore {
    pub(crate) dbs: Vec<HashMap<String, String>>,
    pub(crate) dedup: Vec<HashMap<ClientId, i64>>,
}

impl ShardStore {
    pub fn new() -> Self {
        Self {
            dbs: vec![HashMap::new(); NSHARDS],
            dedup: vec![HashMap::new(); NSHARDS],
        }
    }

    /// Stored value for `key` in `shard`, or `""` if absent.
    pub fn get(&self, shard: usize, key: &str) -> String {
        self.dbs[shard].get(key).cloned().unwrap_or_default()
    }

    pub fn put(&mut self, shard: usize, key: &str, value: &str) {
        self.dbs[shard].insert(key.to_string(), value.to_string());
    }

    pub fn append(&mut self, shard: usize, key: &str, value: &str) {
        self.dbs[shard]
            .entry(key.to_string())
            .or_default()
            .push_str(value);
    }

    /// Runs `mutation` against the shard's map only if `(client_id, seq)`
    /// has not been applied yet, recording `seq` as applied. A `Get` passes
    /// a no-op mutation — it still advances the dedup table.
    pub fn apply_if_new<F>(&mut self, shard: usize, client_id: ClientId, seq: i64, mutation: F)
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let fresh = match self.dedup[shard].get(&client_id) {
            None => true,
            Some(&applied) => seq > applied,
        };
        if fresh {
            self.dedup[shard].insert(client_id, seq);
            mutation(&mut self.dbs[shard]);
        }
    }

    /// Highest applied seq for `client_id` in `shard`, if any.
    pub fn applied_seq(&self, shard: usize, client_id: ClientId) -> Option<i64> {
        self.dedup[shard].get(&client_id).copied()
    }

    /// Deep copies of a shard's map and dedup table, for serving a pull.
    pub fn export(&self, shard: usize) -> (HashMap<String, String>, HashMap<ClientId, i64>) {
        (self.dbs[shard].clone(), self.dedup[shard].clone())
    }

    /// Replaces a shard's contents with pulled data.
    pub fn install(&mut self, shard: usize, data: &PulledShard) {
        self.dbs[shard] = data.kv.clone();
        self.dedup[shard] = data.dedup.clone();
    }

    /// Drops a shard's contents after handoff is confirmed.
    pub fn clear(&mut self, shard: usize) {
        self.dbs[shard] = HashMap::new();
        self.dedup[shard] = HashMap::new();
    }

    pub fn is_empty(&self, shard: usize) -> bool {
        self.dbs[shard].is_empty() && self.dedup[shard].is_empty()
    }
}

impl Default for ShardStore {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_missing_key_is_empty() {
        let store = ShardStore::new();
        assert_eq!(store.get(0, "nope"), "");
    }

    #[test]
    fn put_then_get() {
        let mut store = ShardStore::new();
        store.put(7, "a", "x");
        assert_eq!(store.get(7, "a"), "x");
        // Other shards are untouched.
        assert_eq!(store.get(6, "a"), "");
    }

    #[test]
    fn append_concatenates_from_empty() {
        let mut store = ShardStore::new();
        store.append(7, "a", "x");
        store.append(7, "a", "y");
        assert_eq!(store.get(7, "a"), "xy");
    }

    #[test]
    fn apply_if_new_skips_replayed_seq() {
        let mut store = ShardStore::new();
        store.apply_if_new(7, 1, 1, |db| {
            db.entry("a".to_string()).or_default().push_str("x");
        });
        // Same (client, seq) again: the mutation must not run.
        store.apply_if_new(7, 1, 1, |db| {
            db.entry("a".to_string()).or_default().push_str("x");
        });
        assert_eq!(store.get(7, "a"), "x");
        assert_eq!(store.applied_seq(7, 1), Some(1));
    }

    #[test]
    fn apply_if_new_accepts_higher_seq_only() {
        let mut store = ShardStore::new();
        store.apply_if_new(7, 1, 5, |db| {
            db.insert("a".to_string(), "v5".to_string());
        });
        // A stale lower seq is dropped.
        store.apply_if_new(7, 1, 4, |db| {
            db.insert("a".to_string(), "v4".to_string());
        });
        store.apply_if_new(7, 1, 6, |db| {
            db.insert("a".to_string(), "v6".to_string());
        });
        assert_eq!(store.get(7, "a"), "v6");
        assert_eq!(store.applied_seq(7, 1), Some(6));
    }

    #[test]
    fn dedup_is_per_shard() {
        let mut store = ShardStore::new();
        store.apply_if_new(1, 9, 1, |db| {
            db.insert("k".to_string(), "v".to_string());
        });
        assert_eq!(store.applied_seq(1, 9), Some(1));
        assert_eq!(store.applied_seq(2, 9), None);
    }

    #[test]
    fn export_install_clear_cycle() {
        let mut src = ShardStore::new();
        src.put(3, "k", "v");
        src.apply_if_new(3, 4, 2, |_| {});

        let (kv, dedup) = src.export(3);
        let data = PulledShard { kv, dedup, ver: 1 };

        let mut dst = ShardStore::new();
        dst.install(3, &data);
        assert_eq!(dst.get(3, "k"), "v");
        assert_eq!(dst.applied_seq(3, 4), Some(2));

        src.clear(3);
        assert!(src.is_empty(3));
        // The installed copy is independent of the cleared source.
        assert_eq!(dst.get(3, "k"), "v");
    }
}
