//! Replicated, sharded key/value service.
//!
//! A deployment has many replica groups, each sharing a consensus log, plus
//! an external shard controller that publishes numbered shard→group
//! assignments. This crate is one replica: the deterministic state machine
//! that applies the committed command stream into a sharded store, installs
//! new configs one at a time, migrates shard contents between groups, and
//! de-duplicates client requests — staying linearizable across leader
//! changes, crashes, and log compaction.
//!
//! Entry points:
//! - [`server::ShardKv`] — one replica, wired to a consensus module via the
//!   [`raft::Raft`] trait and its apply stream.
//! - [`client::Clerk`] — the client library.
//! - [`grpc::start_grpc_server`] — the wire surface for one replica.

pub mod client;
pub mod command;
pub mod config;
pub mod errors;
pub mod grpc;
pub mod metrics;
pub mod network;
pub mod node;
pub mod raft;
pub mod reply;
pub mod server;
pub mod store;

pub use client::Clerk;
pub use config::{Config, Ctrler, Gid, MemCtrler, NSHARDS};
pub use errors::KvError;
pub use server::ShardKv;
