use super::message::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which unchoke slot, if any, a neighbor currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChokeSlot {
    #[default]
    Choked,
    Preferred,
    Optimistic,
}

/// Mutable per-neighbor protocol state, guarded by the neighbor's own lock.
#[derive(Debug, Default)]
pub struct NeighborState {
    /// The unchoke slot we have granted this neighbor.
    pub slot: ChokeSlot,
    /// Whether the neighbor has signaled INTERESTED in our pieces.
    pub interested: bool,
    /// Pieces received from this neighbor since the last scheduler tick.
    pub download_rate: u64,
    /// Whether this neighbor's bitfield has been observed complete.
    pub remote_complete: bool,
}

/// One entry in the neighbor set.
///
/// Messages go out through an unbounded channel drained by the session's
/// writer task, so the scheduler and other sessions never perform network
/// I/O while holding a lock. Sending to a dead session is silently
/// dropped; the session's own read loop notices the broken connection.
pub struct Neighbor {
    pub id: u32,
    outbox: mpsc::UnboundedSender<Message>,
    pub state: Mutex<NeighborState>,
}

impl Neighbor {
    pub fn new(id: u32, outbox: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            outbox,
            state: Mutex::new(NeighborState::default()),
        }
    }

    /// Queues a message for this neighbor's writer task.
    pub fn send(&self, message: Message) {
        let _ = self.outbox.send(message);
    }

    pub fn is_interested(&self) -> bool {
        self.state.lock().interested
    }

    pub fn set_interested(&self, interested: bool) {
        self.state.lock().interested = interested;
    }

    pub fn add_download(&self) {
        self.state.lock().download_rate += 1;
    }

    /// Marks the remote bitfield complete. Returns true on the first call
    /// so the finished-peer counter is bumped exactly once per neighbor.
    pub fn mark_remote_complete(&self) -> bool {
        let mut state = self.state.lock();
        if state.remote_complete {
            false
        } else {
            state.remote_complete = true;
            true
        }
    }
}

/// The shared neighbor set: every peer with an established session.
///
/// Mutated by the accept loop, outbound dials, and session teardown;
/// read by both scheduler loops and by HAVE broadcasts. Each operation
/// takes the map lock once and drops it before any message is queued.
#[derive(Default)]
pub struct Neighbors {
    inner: Mutex<HashMap<u32, Arc<Neighbor>>>,
}

impl Neighbors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, neighbor: Arc<Neighbor>) {
        self.inner.lock().insert(neighbor.id, neighbor);
    }

    /// Removes this exact neighbor entry. A stale session that outlived a
    /// reconnect must not evict the replacement registered under its ID.
    pub fn remove(&self, neighbor: &Arc<Neighbor>) -> bool {
        let mut inner = self.inner.lock();
        match inner.get(&neighbor.id) {
            Some(current) if Arc::ptr_eq(current, neighbor) => {
                inner.remove(&neighbor.id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<Neighbor>> {
        self.inner.lock().get(&id).cloned()
    }

    /// Snapshot of the current neighbor set.
    pub fn all(&self) -> Vec<Arc<Neighbor>> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Announces a newly acquired piece to every neighbor except `from`,
    /// the peer it was downloaded from.
    pub fn broadcast_have(&self, index: u32, from: u32) {
        for neighbor in self.all() {
            if neighbor.id != from {
                neighbor.send(Message::Have { index });
            }
        }
    }

    /// True when no currently connected neighbor is interested in our
    /// pieces. Vacuously true for an empty set.
    pub fn none_interested(&self) -> bool {
        self.all().iter().all(|n| !n.is_interested())
    }
}
