use super::message::Message;
use super::neighbors::{ChokeSlot, Neighbor, Neighbors};
use crate::storage::PieceStore;
use rand::seq::IndexedRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

/// The periodic choke-management scheduler.
///
/// Two independent loops run over the shared neighbor set for the life of
/// the process:
///
/// - every `unchoke_interval`, the preferred-selection pass ranks
///   interested neighbors by measured download rate and unchokes the top
///   `preferred_count`;
/// - every `optimistic_interval`, the optimistic pass rotates one extra
///   unchoke slot to a random choked, interested neighbor, giving new or
///   slow peers a chance to prove useful.
///
/// CHOKE/UNCHOKE messages are sent only on a state transition, and always
/// after the relevant locks are dropped.
pub struct ChokeScheduler {
    neighbors: Arc<Neighbors>,
    store: Arc<PieceStore>,
    preferred_count: usize,
    unchoke_interval: Duration,
    optimistic_interval: Duration,
}

impl ChokeScheduler {
    pub fn new(
        neighbors: Arc<Neighbors>,
        store: Arc<PieceStore>,
        preferred_count: usize,
        unchoke_interval: Duration,
        optimistic_interval: Duration,
    ) -> Self {
        Self {
            neighbors,
            store,
            preferred_count,
            unchoke_interval,
            optimistic_interval,
        }
    }

    /// Spawns both scheduler loops. They run until the shutdown signal.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<()>) {
        tokio::spawn(self.clone().preferred_loop(shutdown.clone()));
        tokio::spawn(self.optimistic_loop(shutdown));
    }

    async fn preferred_loop(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        let mut tick = interval(self.unchoke_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick_preferred(),
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn optimistic_loop(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        let mut tick = interval(self.optimistic_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick_optimistic(),
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One preferred-selection pass.
    ///
    /// Interested neighbors are ranked by download rate, descending, with
    /// ties broken by ascending peer ID so selection is deterministic.
    /// Once the local file is complete, rate carries no signal for a
    /// seeder and selection falls back to uniform random. Every
    /// neighbor's rate counter is reset at the end of the pass.
    pub fn tick_preferred(&self) {
        let snapshot = self.neighbors.all();
        if snapshot.is_empty() {
            return;
        }

        let mut candidates: Vec<(Arc<Neighbor>, u64)> = snapshot
            .iter()
            .filter_map(|n| {
                let state = n.state.lock();
                state.interested.then(|| (n.clone(), state.download_rate))
            })
            .collect();

        let selected: HashSet<u32> = if self.store.is_complete() {
            candidates
                .choose_multiple(&mut rand::rng(), self.preferred_count)
                .map(|(n, _)| n.id)
                .collect()
        } else {
            candidates.sort_by(|(a, ra), (b, rb)| rb.cmp(ra).then(a.id.cmp(&b.id)));
            candidates
                .iter()
                .take(self.preferred_count)
                .map(|(n, _)| n.id)
                .collect()
        };

        let mut decisions: Vec<(Arc<Neighbor>, Message)> = Vec::new();
        for neighbor in &snapshot {
            let mut state = neighbor.state.lock();
            match (selected.contains(&neighbor.id), state.slot) {
                (true, ChokeSlot::Choked) => {
                    state.slot = ChokeSlot::Preferred;
                    decisions.push((neighbor.clone(), Message::Unchoke));
                }
                (true, ChokeSlot::Optimistic) => {
                    // Already unchoked; just take over the slot.
                    state.slot = ChokeSlot::Preferred;
                }
                (true, ChokeSlot::Preferred) => {}
                (false, ChokeSlot::Preferred) => {
                    state.slot = ChokeSlot::Choked;
                    decisions.push((neighbor.clone(), Message::Choke));
                }
                (false, _) => {}
            }
            state.download_rate = 0;
        }

        if !selected.is_empty() {
            let mut preferred: Vec<u32> = selected.iter().copied().collect();
            preferred.sort_unstable();
            info!(?preferred, "selected preferred neighbors");
        }

        for (neighbor, message) in decisions {
            debug!(peer = neighbor.id, ?message, "choke state transition");
            neighbor.send(message);
        }
    }

    /// One optimistic-unchoke rotation.
    ///
    /// The current optimistic neighbor is demoted unless the preferred
    /// pass promoted it in the meantime, then a fresh slot holder is
    /// drawn uniformly from the choked, interested neighbors (the peer
    /// just demoted is eligible again).
    pub fn tick_optimistic(&self) {
        let snapshot = self.neighbors.all();
        if snapshot.is_empty() {
            return;
        }

        let mut decisions: Vec<(Arc<Neighbor>, Message)> = Vec::new();
        let mut candidates: Vec<Arc<Neighbor>> = Vec::new();
        for neighbor in &snapshot {
            let mut state = neighbor.state.lock();
            if state.slot == ChokeSlot::Optimistic {
                state.slot = ChokeSlot::Choked;
                decisions.push((neighbor.clone(), Message::Choke));
            }
            if state.slot == ChokeSlot::Choked && state.interested {
                candidates.push(neighbor.clone());
            }
        }

        if let Some(next) = candidates.choose(&mut rand::rng()) {
            next.state.lock().slot = ChokeSlot::Optimistic;
            info!(peer = next.id, "selected optimistic unchoke");
            decisions.push((next.clone(), Message::Unchoke));
        }

        for (neighbor, message) in decisions {
            debug!(peer = neighbor.id, ?message, "choke state transition");
            neighbor.send(message);
        }
    }
}
