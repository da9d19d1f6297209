//! The consensus seam.
//!
//! The replica-group state machine sits atop a pre-existing consensus
//! module; this crate consumes it through the [`Raft`] trait and an apply
//! stream of [`ApplyMsg`] values, and never looks inside it. The contract:
//!
//! - `start(cmd)` appends a command to the replicated log if this replica
//!   currently believes it is the leader, returning the index and term the
//!   command will occupy; a non-leader returns `None`. Acceptance is not a
//!   commitment — a different command may end up committed at that index.
//! - Committed entries arrive on the apply stream in log order, exactly
//!   once per replica, as `ApplyMsg::Command`.
//! - `snapshot(index, blob)` hands over a state snapshot covering the log
//!   through `index` so the module can truncate. A replica whose log was
//!   truncated past its cursor receives `ApplyMsg::Snapshot` instead of
//!   replayed commands — including as the first message after a restart.
//! - `state_size()` reports the retained log size in bytes, driving the
//!   snapshot watcher.
//!
//! [`MemLog`] is an in-memory, immediately-committing implementation of the
//! contract: one shared log per replica group with per-replica delivery
//! cursors. It backs standalone single-replica deployments and the test
//! harness; a production consensus module plugs in at the same trait.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::command::Command;

/// One message on the apply stream.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    /// A committed command at `index`.
    Command { index: u64, command: Command },
    /// A state snapshot covering the log through `index`. Replaces all
    /// apply-side state.
    Snapshot { index: u64, data: Vec<u8> },
}

/// Position a proposed command was appended at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Start {
    pub index: u64,
    pub term: u64,
}

/// The consumed consensus interface.
pub trait Raft: Send + Sync {
    /// Proposes `command`. `None` means this replica is not the leader.
    fn start(&self, command: Command) -> Option<Start>;

    /// Hands a snapshot through `index` to the module for log truncation.
    /// Idempotent; the module keeps the newest.
    fn snapshot(&self, index: u64, data: Vec<u8>);

    /// Size in bytes of the retained log.
    fn state_size(&self) -> usize;

    /// Stops this replica's participation and closes its apply stream.
    fn kill(&self);
}

// ── In-memory shared log ──────────────────────────────────────────────────────

struct Replica {
    tx: UnboundedSender<ApplyMsg>,
    /// Next log index to deliver to this replica.
    next: u64,
}

struct LogInner {
    /// Retained entries, serialized. Entries covered by the snapshot are
    /// purged.
    entries: BTreeMap<u64, Vec<u8>>,
    next_index: u64,
    term: u64,
    leader: Option<usize>,
    snapshot: Option<(u64, Vec<u8>)>,
    /// Slot per attached replica; `None` after detach.
    replicas: Vec<Option<Replica>>,
}

/// Shared in-memory log for one replica group.
///
/// Every append commits immediately and is delivered to all attached
/// replicas in order. Commands are stored serialized and decoded on
/// delivery, so the log round-trips them exactly as a wire-backed module
/// would.
pub struct MemLog {
    inner: Mutex<LogInner>,
}

impl MemLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LogInner {
                entries: BTreeMap::new(),
                next_index: 1,
                term: 0,
                leader: None,
                snapshot: None,
                replicas: Vec::new(),
            }),
        })
    }

    /// Attaches a replica, returning its handle and apply stream.
    ///
    /// A replica attaching behind a truncated log first receives the
    /// snapshot, then every retained entry past it — the same catch-up a
    /// real module performs for a restarted follower. The first replica to
    /// attach becomes leader.
    pub fn attach(self: &Arc<Self>) -> (MemRaft, UnboundedReceiver<ApplyMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();

        let mut next = 1;
        if let Some((snap_index, data)) = &inner.snapshot {
            let _ = tx.send(ApplyMsg::Snapshot {
                index: *snap_index,
                data: data.clone(),
            });
            next = snap_index + 1;
        }
        for (&index, bytes) in inner.entries.range(next..) {
            let _ = tx.send(ApplyMsg::Command {
                index,
                command: decode(bytes),
            });
            next = index + 1;
        }

        let slot = inner.replicas.len();
        inner.replicas.push(Some(Replica { tx, next }));
        if inner.leader.is_none() {
            inner.leader = Some(slot);
            inner.term += 1;
        }

        (
            MemRaft {
                log: self.clone(),
                slot,
                killed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Makes `slot` the leader and bumps the term. Test hook and failover
    /// control for in-process groups.
    pub fn set_leader(&self, slot: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.leader = Some(slot);
        inner.term += 1;
    }

    /// The currently designated leader slot, if any.
    pub fn leader_slot(&self) -> Option<usize> {
        self.inner.lock().unwrap().leader
    }

    /// Index and size of the held snapshot, if any.
    pub fn snapshot_info(&self) -> Option<(u64, usize)> {
        self.inner
            .lock()
            .unwrap()
            .snapshot
            .as_ref()
            .map(|(i, d)| (*i, d.len()))
    }
}

fn decode(bytes: &[u8]) -> Command {
    serde_json::from_slice(bytes).expect("log entry decodes")
}

/// One replica's handle onto a [`MemLog`].
pub struct MemRaft {
    log: Arc<MemLog>,
    slot: usize,
    killed: AtomicBool,
}

impl Raft for MemRaft {
    fn start(&self, command: Command) -> Option<Start> {
        if self.killed.load(Ordering::SeqCst) {
            return None;
        }
        let mut inner = self.log.inner.lock().unwrap();
        if inner.leader != Some(self.slot) {
            return None;
        }

        let bytes = serde_json::to_vec(&command).expect("log entry encodes");
        let index = inner.next_index;
        inner.next_index += 1;
        let term = inner.term;
        inner.entries.insert(index, bytes.clone());

        // Immediate commit: deliver to every attached replica in order.
        let command = decode(&bytes);
        for replica in inner.replicas.iter_mut().flatten() {
            if replica.next == index {
                let _ = replica.tx.send(ApplyMsg::Command {
                    index,
                    command: command.clone(),
                });
                replica.next = index + 1;
            }
        }

        Some(Start { index, term })
    }

    fn snapshot(&self, index: u64, data: Vec<u8>) {
        let mut inner = self.log.inner.lock().unwrap();
        if let Some((held, _)) = &inner.snapshot {
            if index <= *held {
                return;
            }
        }
        inner.snapshot = Some((index, data));
        inner.entries = inner.entries.split_off(&(index + 1));
        debug!(index, retained = inner.entries.len(), "log truncated");
    }

    fn state_size(&self) -> usize {
        let inner = self.log.inner.lock().unwrap();
        inner.entries.values().map(Vec::len).sum()
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let mut inner = self.log.inner.lock().unwrap();
        // Dropping the sender closes this replica's apply stream.
        inner.replicas[self.slot] = None;
        if inner.leader == Some(self.slot) {
            inner.leader = None;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Op, OpKind};

    fn client_op(seq: i64) -> Command {
        Command::Client(Op {
            kind: OpKind::Put,
            key: "k".to_string(),
            value: format!("v{seq}"),
            client_id: 1,
            seq,
        })
    }

    #[tokio::test]
    async fn first_attached_replica_leads_and_commits() {
        let log = MemLog::new();
        let (rf, mut rx) = log.attach();

        let start = rf.start(client_op(1)).unwrap();
        assert_eq!(start.index, 1);

        match rx.recv().await.unwrap() {
            ApplyMsg::Command { index, command } => {
                assert_eq!(index, 1);
                assert_eq!(command, client_op(1));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_leader_start_is_rejected() {
        let log = MemLog::new();
        let (_leader, _rx0) = log.attach();
        let (follower, _rx1) = log.attach();

        assert!(follower.start(client_op(1)).is_none());
        assert_eq!(log.leader_slot(), Some(0));
    }

    #[tokio::test]
    async fn followers_receive_the_same_stream() {
        let log = MemLog::new();
        let (leader, mut rx0) = log.attach();
        let (_f, mut rx1) = log.attach();

        leader.start(client_op(1)).unwrap();
        leader.start(client_op(2)).unwrap();

        for rx in [&mut rx0, &mut rx1] {
            for expect in 1..=2 {
                match rx.recv().await.unwrap() {
                    ApplyMsg::Command { index, .. } => assert_eq!(index, expect),
                    other => panic!("unexpected message: {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn snapshot_truncates_and_shrinks_state() {
        let log = MemLog::new();
        let (rf, _rx) = log.attach();
        for seq in 1..=5 {
            rf.start(client_op(seq)).unwrap();
        }
        let before = rf.state_size();

        rf.snapshot(3, b"blob".to_vec());
        assert!(rf.state_size() < before);
        assert_eq!(log.snapshot_info(), Some((3, 4)));

        // An older snapshot never replaces a newer one.
        rf.snapshot(2, b"old".to_vec());
        assert_eq!(log.snapshot_info(), Some((3, 4)));
    }

    #[tokio::test]
    async fn reattach_replays_snapshot_then_tail() {
        let log = MemLog::new();
        let (rf, _rx) = log.attach();
        for seq in 1..=5 {
            rf.start(client_op(seq)).unwrap();
        }
        rf.snapshot(3, b"state-at-3".to_vec());

        let (_rf2, mut rx2) = log.attach();
        match rx2.recv().await.unwrap() {
            ApplyMsg::Snapshot { index, data } => {
                assert_eq!(index, 3);
                assert_eq!(data, b"state-at-3");
            }
            other => panic!("expected snapshot first, got {other:?}"),
        }
        for expect in 4..=5 {
            match rx2.recv().await.unwrap() {
                ApplyMsg::Command { index, .. } => assert_eq!(index, expect),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn kill_closes_the_apply_stream() {
        let log = MemLog::new();
        let (rf, mut rx) = log.attach();
        rf.kill();
        assert!(rf.start(client_op(1)).is_none());
        assert!(rx.recv().await.is_none());
        assert_eq!(log.leader_slot(), None);
    }
}
