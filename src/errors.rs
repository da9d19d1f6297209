//! Client-visible error taxonomy.
//!
//! Every fault a caller can observe collapses into one of four conditions.
//! `WrongLeader` is the meta-condition: RPC failures, leadership changes
//! mid-flight, and reply timeouts all surface as it, and the client reacts
//! the same way to each — find another replica and retry. A missing key is
//! not an error; `get` reports it as success with an empty value.

use thiserror::Error;

/// Errors surfaced across the client/server and inter-group seams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// This replica is not the group's current leader (or lost leadership
    /// before the op committed). Retry against another replica.
    #[error("not the current leader")]
    WrongLeader,

    /// The key's shard is owned by a different group in the current config.
    /// Re-query the controller and re-route.
    #[error("shard owned by another group")]
    WrongGroup,

    /// The shard is owned here but its migration has not completed. Retry
    /// shortly.
    #[error("shard migration in progress")]
    InTransit,

    /// Transport-level failure reaching a server. Produced only by the
    /// network layer, never by a handler.
    #[error("peer unreachable: {0}")]
    Unreachable(String),
}

impl KvError {
    /// Stable label used on the wire and as a metric dimension.
    pub fn label(&self) -> &'static str {
        match self {
            KvError::WrongLeader => "wrong_leader",
            KvError::WrongGroup => "wrong_group",
            KvError::InTransit => "in_transit",
            KvError::Unreachable(_) => "unreachable",
        }
    }

    /// Decodes a wire label. Empty means success (`None`); an unknown label
    /// is treated as a leadership problem, which clients already handle by
    /// retrying elsewhere.
    pub fn from_label(label: &str) -> Option<KvError> {
        match label {
            "" => None,
            "wrong_group" => Some(KvError::WrongGroup),
            "in_transit" => Some(KvError::InTransit),
            _ => Some(KvError::WrongLeader),
        }
    }
}
