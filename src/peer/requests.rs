use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use std::collections::HashMap;

/// The global piece-index → requesting-peer map.
///
/// Guarantees at most one outstanding request per piece across every
/// session. All operations take the internal lock once, so a reservation
/// can never be granted twice; callers never see raw map state.
#[derive(Debug, Default)]
pub struct RequestTable {
    inner: Mutex<HashMap<u32, u32>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `index` for `peer_id` unless some session already holds it.
    ///
    /// Returns true if the reservation was granted.
    pub fn try_reserve(&self, index: u32, peer_id: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains_key(&index) {
            return false;
        }
        inner.insert(index, peer_id);
        true
    }

    /// Releases the reservation for `index`, if any.
    pub fn release(&self, index: u32) {
        self.inner.lock().remove(&index);
    }

    /// Releases every reservation held for `peer_id`.
    ///
    /// Called when a peer chokes us or its session dies, so other sessions
    /// may re-request those pieces.
    pub fn release_all_for(&self, peer_id: u32) {
        self.inner.lock().retain(|_, owner| *owner != peer_id);
    }

    /// Reserves one of `candidates` uniformly at random for `peer_id`,
    /// skipping any candidate already reserved.
    ///
    /// Filter, pick, and insert happen under one lock acquisition, so two
    /// sessions calling this concurrently can never reserve the same index.
    /// Returns `None` when every candidate is already spoken for.
    pub fn reserve_random(&self, candidates: &[u32], peer_id: u32) -> Option<u32> {
        let mut inner = self.inner.lock();
        let open: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|index| !inner.contains_key(index))
            .collect();

        let index = *open.choose(&mut rand::rng())?;
        inner.insert(index, peer_id);
        Some(index)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
