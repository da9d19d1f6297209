//! Pending-reply registry: apply loop → waiting RPC handler, keyed by log
//! index.
//!
//! A handler that proposed a command at index `i` parks on the slot for `i`;
//! when the apply loop reaches that index it publishes a [`ReplyRes`] into
//! the slot. Slots are single-value watch channels: publishing replaces
//! whatever a vanished handler from an earlier term left behind, and a
//! handler reads at most one value — checking the current value first, so a
//! result that was published before the handler registered is not missed.
//!
//! The registry is bounded: slots live in an LRU keyed by index, and an
//! evicted slot closes its channel. A handler still parked on an evicted
//! slot observes the close and reports leadership lost, which the client
//! handles by retrying.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use crate::command::Op;

/// Default bound on live reply slots. Far above any realistic number of
/// in-flight proposals for one replica.
pub const DEFAULT_SLOTS: usize = 1024;

/// What the apply loop reports for a committed command.
///
/// `in_op` is the op that actually committed at the index; a handler must
/// match it structurally against the op it proposed before trusting
/// `value`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyRes {
    pub value: String,
    pub in_op: Option<Op>,
    pub wrong_group: bool,
    pub in_transit: bool,
}

impl ReplyRes {
    /// The key's shard belongs to another group in the current config.
    pub fn wrong_group() -> Self {
        Self {
            wrong_group: true,
            ..Default::default()
        }
    }

    /// The shard is owned here but still migrating.
    pub fn in_transit() -> Self {
        Self {
            in_transit: true,
            ..Default::default()
        }
    }

    /// A client op applied (or was deduplicated); `value` is the key's
    /// current stored value.
    pub fn applied(value: String, op: Op) -> Self {
        Self {
            value,
            in_op: Some(op),
            wrong_group: false,
            in_transit: false,
        }
    }

    /// Outcome of a `DeleteShard` command: `in_transit` tells the peer to
    /// retry later.
    pub fn delete_done(in_transit: bool) -> Self {
        Self {
            in_transit,
            ..Default::default()
        }
    }
}

type Slot = watch::Sender<Option<ReplyRes>>;

/// Index-keyed registry of reply slots.
pub struct ReplyRegistry {
    slots: LruCache<u64, Slot>,
}

impl ReplyRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: LruCache::new(NonZeroUsize::new(capacity).unwrap()),
        }
    }

    /// Returns a receiver for the slot at `index`, creating the slot if it
    /// does not exist yet. Called by handlers after proposing, and usable
    /// any number of times for the same index.
    pub fn subscribe(&mut self, index: u64) -> watch::Receiver<Option<ReplyRes>> {
        self.ensure(index).subscribe()
    }

    /// Publishes the result for `index`, replacing any stale unread value.
    /// Called only by the apply loop.
    pub fn deliver(&mut self, index: u64, res: ReplyRes) {
        self.ensure(index).send_replace(Some(res));
    }

    /// Creates the slot for `index` if absent. The apply loop calls this for
    /// every committed command so the slot exists whether or not a handler
    /// ever shows up.
    pub fn ensure(&mut self, index: u64) -> &Slot {
        self.slots
            .get_or_insert(index, || watch::channel(None).0)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Waits for the result at a subscribed slot, up to `wait`.
///
/// Returns `None` on timeout or when the slot was evicted — both collapse
/// to "leadership lost" at the caller.
pub async fn await_reply(
    mut rx: watch::Receiver<Option<ReplyRes>>,
    wait: Duration,
) -> Option<ReplyRes> {
    // The apply loop may have published before we subscribed.
    if let Some(res) = rx.borrow().clone() {
        return Some(res);
    }
    match timeout(wait, rx.changed()).await {
        Ok(Ok(())) => rx.borrow().clone(),
        // Channel closed (slot evicted) or timer fired.
        Ok(Err(_)) | Err(_) => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
