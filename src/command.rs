//! Commands carried by the replicated log.
//!
//! Every mutation of apply-side state — client ops, config installs, shard
//! migration steps — is proposed as a [`Command`] and applied only after it
//! commits. The consensus module round-trips commands through serde, so all
//! variants derive `Serialize`/`Deserialize`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{ClientId, Config};

/// The kind of a client op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

impl OpKind {
    /// Lowercase name used on the wire and in metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Get => "get",
            OpKind::Put => "put",
            OpKind::Append => "append",
        }
    }
}

/// One client operation.
///
/// `PartialEq` is structural over all five fields: an RPC handler compares
/// the op that committed at its log index against the op it proposed, and
/// any mismatch means a different command won that slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub key: String,
    /// Empty for `Get`.
    pub value: String,
    pub client_id: ClientId,
    pub seq: i64,
}

/// Pull-map key: one outstanding migration of `shard` from the group that
/// held it at config `from_ver` into config `to_conf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardVer {
    pub shard: usize,
    pub from_ver: u64,
    pub to_conf: u64,
}

/// Pull-map value: where to fetch the shard from, and which direction the
/// obligation currently points.
///
/// `valid == true`: the shard must still be pulled from `servers`.
/// `valid == false`: the data is installed; the source group is still owed a
/// delete confirmation before the entry can be dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullSource {
    pub servers: Vec<String>,
    pub valid: bool,
}

/// A shard's contents as handed over by `PullShard`: the key/value map, the
/// dedup table that travels with it, and the responder's shard version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulledShard {
    pub kv: HashMap<String, String>,
    pub dedup: HashMap<ClientId, i64>,
    pub ver: u64,
}

/// The tagged union the log carries. The apply loop dispatches on variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// A client `Get`/`Put`/`Append`.
    Client(Op),
    /// Switch to the next config, creating pull obligations for newly owned
    /// shards.
    InstallConfig(Config),
    /// Install a pulled shard's data and flip its pull entry to delete-debt.
    InstallShard { sv: ShardVer, data: PulledShard },
    /// Drop a shard that has been handed off (proposed on the source group
    /// by a peer's delete request).
    DeleteShard { shard: usize, conf_num: u64 },
    /// Clear a settled pull-map entry after the peer confirmed deletion.
    RemovePull { sv: ShardVer },
}

impl Command {
    /// Variant name used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Client(_) => "client",
            Command::InstallConfig(_) => "install_config",
            Command::InstallShard { .. } => "install_shard",
            Command::DeleteShard { .. } => "delete_shard",
            Command::RemovePull { .. } => "remove_pull",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_op() -> Op {
        Op {
            kind: OpKind::Append,
            key: "a".to_string(),
            value: "x".to_string(),
            client_id: 17,
            seq: 3,
        }
    }

    #[test]
    fn op_equality_is_structural() {
        let op = sample_op();
        assert_eq!(op, op.clone());

        let mut other = op.clone();
        other.seq = 4;
        assert_ne!(op, other);

        let mut other = op.clone();
        other.value = "y".to_string();
        assert_ne!(op, other);
    }

    #[test]
    fn commands_roundtrip_through_json() {
        let commands = vec![
            Command::Client(sample_op()),
            Command::InstallConfig(Config::default()),
            Command::InstallShard {
                sv: ShardVer {
                    shard: 7,
                    from_ver: 1,
                    to_conf: 2,
                },
                data: PulledShard {
                    kv: [("a".to_string(), "x".to_string())].into_iter().collect(),
                    dedup: [(17i64, 3i64)].into_iter().collect(),
                    ver: 1,
                },
            },
            Command::DeleteShard {
                shard: 7,
                conf_num: 2,
            },
            Command::RemovePull {
                sv: ShardVer {
                    shard: 7,
                    from_ver: 1,
                    to_conf: 2,
                },
            },
        ];
        for cmd in commands {
            let bytes = serde_json::to_vec(&cmd).unwrap();
            let back: Command = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(back, cmd);
        }
    }
}
