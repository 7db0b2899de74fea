//! Swarm node wiring: startup, the accept loop, and convergence.
//!
//! A [`Node`] owns one process's participation in the swarm. It opens the
//! piece store (validating a roster-claimed complete file), binds the
//! listen port, spawns the choke scheduler and one session task per prior
//! roster peer, then accepts inbound connections until the swarm
//! converges. Shutdown is cooperative: a watch signal every loop observes
//! at its next suspension point.

use crate::config::{CommonConfig, ConfigError, Roster, RosterPeer};
use crate::peer::{session, ChokeScheduler, Neighbors, RequestTable};
use crate::storage::{PieceStore, StorageError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind listen port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Shared hub for everything the session tasks and scheduler touch:
/// the piece store (owning the local bitfield), the global request
/// table, the neighbor set, the finished-peer counter, and the
/// process-wide shutdown signal.
pub struct Swarm {
    pub local_id: u32,
    pub store: Arc<PieceStore>,
    pub requests: RequestTable,
    pub neighbors: Arc<Neighbors>,
    finished: AtomicUsize,
    swarm_size: usize,
    shutdown_tx: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
}

impl Swarm {
    pub fn new(local_id: u32, store: Arc<PieceStore>, swarm_size: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        Self {
            local_id,
            store,
            requests: RequestTable::new(),
            neighbors: Arc::new(Neighbors::new()),
            finished: AtomicUsize::new(0),
            swarm_size,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Returns a receiver that fires on shutdown, even if the signal was
    /// already sent before this call.
    pub fn shutdown_signal(&self) -> watch::Receiver<()> {
        // The root receiver never consumes versions, so clones always see
        // a pending change once shutdown has fired.
        self.shutdown_rx.clone()
    }

    pub fn request_shutdown(&self, reason: &str) {
        info!(reason, "shutting down");
        let _ = self.shutdown_tx.send(());
    }

    /// Records that a peer's bitfield was observed complete, then
    /// re-checks convergence.
    pub fn note_peer_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.check_all_finished();
    }

    /// Convergence rule (b): the local file is complete and every roster
    /// peer's bitfield has been observed complete.
    pub fn check_all_finished(&self) {
        if self.store.is_complete() && self.finished.load(Ordering::SeqCst) >= self.swarm_size {
            self.request_shutdown("every peer has the complete file");
        }
    }

    /// Convergence rule (a): the local file is complete and no currently
    /// connected neighbor is interested in our pieces.
    pub fn check_swarm_drained(&self) {
        if self.store.is_complete() && self.neighbors.none_interested() {
            self.request_shutdown("local file complete and no peer is interested");
        }
    }

    /// A session closing after local completion is the swarm-exit signal;
    /// before completion it only shrinks the neighbor set.
    pub fn on_session_closed(&self) {
        if self.store.is_complete() {
            self.request_shutdown("peer disconnected after local completion");
        }
    }
}

/// One process's membership in the swarm.
pub struct Node {
    swarm: Arc<Swarm>,
    common: CommonConfig,
    listen_port: u16,
    prior_peers: Vec<RosterPeer>,
}

impl Node {
    /// Builds a node from loaded configuration.
    ///
    /// Opens the piece store under `<base_dir>/peer_<ID>/`; when the
    /// roster claims this peer already has the file, a missing or
    /// mis-sized artifact is a fatal startup error.
    pub async fn new(
        common: CommonConfig,
        roster: Roster,
        local_id: u32,
        base_dir: impl Into<PathBuf>,
    ) -> Result<Self, NodeError> {
        let me = roster.me(local_id)?.clone();
        let prior_peers = roster.prior(local_id);

        let dir = base_dir.into().join(format!("peer_{local_id}"));
        let store = Arc::new(
            PieceStore::open(
                dir,
                &common.file_name,
                common.file_size,
                common.piece_size,
                me.has_file,
            )
            .await?,
        );
        if store.is_complete() {
            info!(file = %common.file_name, "starting with the complete file");
        }

        let swarm = Arc::new(Swarm::new(local_id, store, roster.swarm_size()));
        Ok(Self {
            swarm,
            common,
            listen_port: me.port,
            prior_peers,
        })
    }

    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    /// Runs the node until the swarm converges.
    ///
    /// Binds the listen port (fatal on failure), spawns the two scheduler
    /// loops and an outbound session per prior peer, then accepts inbound
    /// connections, spawning a session task each.
    pub async fn run(self) -> Result<(), NodeError> {
        let Node {
            swarm,
            common,
            listen_port,
            prior_peers,
        } = self;

        let listener = TcpListener::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|source| NodeError::Bind {
                port: listen_port,
                source,
            })?;
        info!(peer = swarm.local_id, port = listen_port, "listening for peers");

        let scheduler = Arc::new(ChokeScheduler::new(
            swarm.neighbors.clone(),
            swarm.store.clone(),
            common.preferred_neighbors,
            common.unchoking_interval,
            common.optimistic_unchoking_interval,
        ));
        scheduler.spawn(swarm.shutdown_signal());

        for peer in prior_peers {
            tokio::spawn(session::run_outbound(
                swarm.clone(),
                peer,
                swarm.shutdown_signal(),
            ));
        }

        let mut shutdown = swarm.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "incoming connection");
                        tokio::spawn(session::run_inbound(
                            swarm.clone(),
                            stream,
                            swarm.shutdown_signal(),
                        ));
                    }
                    Err(error) => warn!(%error, "accept failed"),
                },
            }
        }

        info!(peer = swarm.local_id, "swarm converged, exiting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_common(file_size: u64, piece_size: u64) -> CommonConfig {
        CommonConfig {
            preferred_neighbors: 2,
            unchoking_interval: Duration::from_millis(200),
            optimistic_unchoking_interval: Duration::from_millis(300),
            file_name: "shared.dat".to_string(),
            file_size,
            piece_size,
        }
    }

    fn test_roster(port_a: u16, port_b: u16) -> Roster {
        Roster {
            peers: vec![
                RosterPeer {
                    id: 1001,
                    host: "127.0.0.1".to_string(),
                    port: port_a,
                    has_file: true,
                },
                RosterPeer {
                    id: 1002,
                    host: "127.0.0.1".to_string(),
                    port: port_b,
                    has_file: false,
                },
            ],
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn missing_seed_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let roster = test_roster(free_port().await, free_port().await);

        let result = Node::new(test_common(121, 32), roster, 1001, dir.path()).await;
        assert!(matches!(
            result,
            Err(NodeError::Storage(StorageError::MissingCompleteFile(_)))
        ));
    }

    #[tokio::test]
    async fn unknown_self_id_is_fatal() {
        let dir = TempDir::new().unwrap();
        let roster = test_roster(free_port().await, free_port().await);

        let result = Node::new(test_common(121, 32), roster, 9999, dir.path()).await;
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn two_peer_swarm_transfers_whole_file() {
        let dir = TempDir::new().unwrap();
        let port_a = free_port().await;
        let port_b = free_port().await;

        // 4 pieces of 32 bytes, the last carrying a 25-byte remainder.
        let common = test_common(121, 32);
        let roster = test_roster(port_a, port_b);

        let seed_dir = dir.path().join("peer_1001");
        tokio::fs::create_dir_all(&seed_dir).await.unwrap();
        let source: Vec<u8> = (0..121u32).map(|i| (i * 7 % 251) as u8).collect();
        tokio::fs::write(seed_dir.join("shared.dat"), &source)
            .await
            .unwrap();

        let node_a = Node::new(common.clone(), roster.clone(), 1001, dir.path())
            .await
            .unwrap();
        let node_b = Node::new(common.clone(), roster.clone(), 1002, dir.path())
            .await
            .unwrap();

        let task_a = tokio::spawn(node_a.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let task_b = tokio::spawn(node_b.run());

        timeout(Duration::from_secs(30), task_b)
            .await
            .expect("peer 1002 did not converge")
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(30), task_a)
            .await
            .expect("peer 1001 did not converge")
            .unwrap()
            .unwrap();

        let downloaded = tokio::fs::read(dir.path().join("peer_1002").join("shared.dat"))
            .await
            .unwrap();
        assert_eq!(downloaded, source);

        // Staging records are gone once assembly has run.
        for index in 0..4 {
            assert!(!dir
                .path()
                .join("peer_1002")
                .join(format!("shared.dat.{index}.part"))
                .exists());
        }
    }
}
