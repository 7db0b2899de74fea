use super::bitfield::Bitfield;
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::neighbors::{ChokeSlot, Neighbor};
use super::transport::{MessageReader, MessageWriter, PeerTransport};
use crate::config::RosterPeer;
use crate::node::Swarm;
use crate::storage::StorageError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The protocol state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connection in progress.
    Connecting,
    /// Connected, exchanging handshakes.
    Handshaking,
    /// Handshake done, exchanging initial bitfields.
    ExchangingBitfield,
    /// Fully established, dispatching protocol messages.
    Active,
    /// Terminal; stream closed and neighbor deregistered.
    Closed,
}

/// A session with one remote peer.
///
/// Each session owns the read half of its connection and a private copy of
/// the peer's bitfield; everything else it touches (local bitfield, request
/// table, neighbor set) is shared, lock-protected state on the [`Swarm`].
/// Outgoing messages are queued to a writer task through the neighbor's
/// outbox, which is also how the choke scheduler and other sessions reach
/// this peer.
///
/// Any I/O error or protocol violation is fatal to this session only: the
/// session tears itself down (neighbor removed, reservations released) and
/// the rest of the swarm carries on.
pub struct PeerSession {
    swarm: Arc<Swarm>,
    neighbor: Arc<Neighbor>,
    remote_id: u32,
    remote_bitfield: Bitfield,
    am_interested: bool,
    choked_by_peer: bool,
    state: SessionState,
}

/// Runs an outbound session: dial with bounded retry, handshake verifying
/// the echoed peer ID against the roster, then the shared session path.
/// Failures are logged and handled here; the spawner never sees them.
pub async fn run_outbound(swarm: Arc<Swarm>, peer: RosterPeer, mut shutdown: watch::Receiver<()>) {
    let Some(stream) = dial(&peer, &mut shutdown).await else {
        return;
    };
    info!(peer = peer.id, host = %peer.host, port = peer.port, "made a connection to peer");

    let mut transport = PeerTransport::new(stream);
    let handshake = async {
        transport
            .send_handshake(&Handshake::new(swarm.local_id))
            .await?;
        let theirs = transport.receive_handshake().await?;
        if theirs.peer_id != peer.id {
            return Err(PeerError::PeerIdMismatch {
                expected: peer.id,
                actual: theirs.peer_id,
            });
        }
        Ok(theirs.peer_id)
    }
    .await;

    match handshake {
        Ok(remote_id) => {
            info!(peer = remote_id, "handshake complete");
            drive(swarm, transport, remote_id, shutdown).await;
        }
        Err(error) => warn!(peer = peer.id, %error, "outbound handshake failed"),
    }
}

/// Runs an inbound session from an accepted stream: the remote speaks
/// first and its handshake tells us who it is, then we reply with ours.
pub async fn run_inbound(swarm: Arc<Swarm>, stream: TcpStream, shutdown: watch::Receiver<()>) {
    let addr = stream.peer_addr().ok();
    let mut transport = PeerTransport::new(stream);
    let handshake = async {
        let theirs = transport.receive_handshake().await?;
        transport
            .send_handshake(&Handshake::new(swarm.local_id))
            .await?;
        Ok::<u32, PeerError>(theirs.peer_id)
    }
    .await;

    match handshake {
        Ok(remote_id) => {
            info!(peer = remote_id, "connected from peer");
            drive(swarm, transport, remote_id, shutdown).await;
        }
        Err(error) => warn!(?addr, %error, "inbound handshake failed"),
    }
}

async fn dial(peer: &RosterPeer, shutdown: &mut watch::Receiver<()>) -> Option<TcpStream> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        match TcpStream::connect((peer.host.as_str(), peer.port)).await {
            Ok(stream) => return Some(stream),
            Err(error) if attempt == CONNECT_ATTEMPTS => {
                warn!(peer = peer.id, %error, attempts = attempt, "giving up on peer");
                return None;
            }
            Err(error) => {
                debug!(peer = peer.id, attempt, %error, "connect failed, retrying");
                tokio::select! {
                    _ = sleep(CONNECT_RETRY_DELAY) => {}
                    _ = shutdown.changed() => return None,
                }
            }
        }
    }
    None
}

/// The shared post-handshake path for both session directions: spawn the
/// writer task, exchange bitfields, run the dispatch loop, and tear down
/// on every exit.
async fn drive(
    swarm: Arc<Swarm>,
    transport: PeerTransport,
    remote_id: u32,
    mut shutdown: watch::Receiver<()>,
) {
    let (mut reader, writer) = transport.into_split();
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, outbox_rx));

    let neighbor = Arc::new(Neighbor::new(remote_id, outbox));
    let mut session = PeerSession {
        swarm: swarm.clone(),
        neighbor,
        remote_id,
        remote_bitfield: Bitfield::new(swarm.store.piece_count() as usize),
        am_interested: false,
        choked_by_peer: true,
        state: SessionState::ExchangingBitfield,
    };

    let result = match session.exchange_bitfields(&mut reader).await {
        Ok(()) => session.message_loop(&mut reader, &mut shutdown).await,
        Err(error) => Err(error),
    };

    session.state = SessionState::Closed;
    swarm.neighbors.remove(&session.neighbor);
    swarm.requests.release_all_for(remote_id);
    match result {
        Ok(()) => info!(peer = remote_id, "session closed"),
        Err(error) => warn!(peer = remote_id, %error, "session closed"),
    }
    swarm.on_session_closed();
}

async fn write_loop(mut writer: MessageWriter, mut outbox: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbox.recv().await {
        if let Err(error) = writer.send_message(&message).await {
            debug!(%error, "writer task stopping");
            break;
        }
    }
}

impl PeerSession {
    /// Sends our bitfield and requires the peer's BITFIELD as the very
    /// first message; anything else is a protocol violation. Decides the
    /// initial INTERESTED/NOT_INTERESTED and registers the neighbor for
    /// the scheduler and HAVE broadcasts.
    async fn exchange_bitfields(&mut self, reader: &mut MessageReader) -> Result<(), PeerError> {
        self.neighbor
            .send(Message::Bitfield(self.swarm.store.snapshot_bitfield().to_bytes()));

        let first = reader.receive_message().await?;
        let Message::Bitfield(bytes) = first else {
            return Err(PeerError::Protocol(format!(
                "expected bitfield as first message, got {:?}",
                first.message_type()
            )));
        };
        self.remote_bitfield =
            Bitfield::from_bytes(bytes, self.swarm.store.piece_count() as usize);

        if self.remote_bitfield.is_complete() && self.neighbor.mark_remote_complete() {
            self.swarm.note_peer_finished();
        }

        let interesting = self
            .swarm
            .store
            .with_bitfield(|local| local.has_piece_missing_from(&self.remote_bitfield))?;
        if interesting {
            self.send_interested();
        } else {
            self.neighbor.send(Message::NotInterested);
        }

        self.swarm.neighbors.insert(self.neighbor.clone());
        self.state = SessionState::Active;
        Ok(())
    }

    async fn message_loop(
        &mut self,
        reader: &mut MessageReader,
        shutdown: &mut watch::Receiver<()>,
    ) -> Result<(), PeerError> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                message = reader.receive_message() => self.dispatch(message?).await?,
            }
        }
    }

    async fn dispatch(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::Choke => {
                info!(peer = self.remote_id, "choked by peer");
                self.choked_by_peer = true;
                // Hanging requests to this peer are fair game for others now.
                self.swarm.requests.release_all_for(self.remote_id);
            }
            Message::Unchoke => {
                info!(peer = self.remote_id, "unchoked by peer");
                self.choked_by_peer = false;
                self.request_next_piece();
            }
            Message::Interested => {
                info!(peer = self.remote_id, "received interested");
                self.neighbor.set_interested(true);
            }
            Message::NotInterested => {
                info!(peer = self.remote_id, "received not interested");
                self.neighbor.set_interested(false);
                self.swarm.check_swarm_drained();
            }
            Message::Have { index } => self.handle_have(index)?,
            Message::Bitfield(bytes) => {
                // Only legal as the first message; tolerated by overwrite.
                warn!(peer = self.remote_id, "unexpected bitfield after initial exchange");
                self.remote_bitfield =
                    Bitfield::from_bytes(bytes, self.swarm.store.piece_count() as usize);
                if self.remote_bitfield.is_complete() && self.neighbor.mark_remote_complete() {
                    self.swarm.note_peer_finished();
                }
            }
            Message::Request { index } => self.handle_request(index).await?,
            Message::Piece { index, data } => self.handle_piece(index, data).await?,
        }
        Ok(())
    }

    fn handle_have(&mut self, index: u32) -> Result<(), PeerError> {
        info!(peer = self.remote_id, piece = index, "received have");
        self.remote_bitfield.set(index as usize);

        let missing = self
            .swarm
            .store
            .with_bitfield(|local| !local.has(index as usize));
        if missing && !self.am_interested {
            self.send_interested();
        }

        if self.remote_bitfield.is_complete() && self.neighbor.mark_remote_complete() {
            self.swarm.note_peer_finished();
        }
        Ok(())
    }

    async fn handle_request(&mut self, index: u32) -> Result<(), PeerError> {
        if self.neighbor.state.lock().slot == ChokeSlot::Choked {
            debug!(peer = self.remote_id, piece = index, "ignoring request from choked peer");
            return Ok(());
        }
        match self.swarm.store.get_piece(index).await {
            Ok(data) => {
                debug!(peer = self.remote_id, piece = index, "serving piece");
                self.neighbor.send(Message::Piece { index, data });
                Ok(())
            }
            Err(StorageError::PieceNotAvailable(_)) => {
                warn!(peer = self.remote_id, piece = index, "cannot serve piece yet");
                Ok(())
            }
            Err(StorageError::InvalidPieceIndex(_)) => Err(PeerError::Protocol(format!(
                "request for out-of-range piece {index}"
            ))),
            Err(error) => Err(error.into()),
        }
    }

    async fn handle_piece(&mut self, index: u32, data: Bytes) -> Result<(), PeerError> {
        let completed = self.swarm.store.put_piece(index, &data).await?;
        self.neighbor.add_download();
        self.swarm.requests.release(index);

        let pieces = self.swarm.store.with_bitfield(|local| local.count());
        info!(peer = self.remote_id, piece = index, pieces, "downloaded piece");

        self.swarm.neighbors.broadcast_have(index, self.remote_id);

        let still_interesting = self
            .swarm
            .store
            .with_bitfield(|local| local.has_piece_missing_from(&self.remote_bitfield))?;
        if !still_interesting || self.swarm.store.is_complete() {
            self.am_interested = false;
            self.neighbor.send(Message::NotInterested);
        } else if !self.choked_by_peer {
            // Self-clocking pipeline of depth 1: the next request rides on
            // the arrival of the previous piece.
            self.request_next_piece();
        }

        if completed {
            info!("downloaded the complete file");
            self.swarm.check_all_finished();
            self.swarm.check_swarm_drained();
        }
        Ok(())
    }

    /// Picks a uniformly random piece the peer has and we lack, reserving
    /// it in the global request table in the same critical section as the
    /// wanted-set computation so no two sessions request the same piece.
    fn request_next_piece(&self) -> bool {
        let picked = self.swarm.store.with_bitfield(|local| {
            let wanted: Vec<u32> = (0..local.len())
                .filter(|&i| self.remote_bitfield.has(i) && !local.has(i))
                .map(|i| i as u32)
                .collect();
            self.swarm.requests.reserve_random(&wanted, self.remote_id)
        });

        match picked {
            Some(index) => {
                debug!(peer = self.remote_id, piece = index, "requesting piece");
                self.neighbor.send(Message::Request { index });
                true
            }
            None => false,
        }
    }

    fn send_interested(&mut self) {
        self.am_interested = true;
        self.neighbor.send(Message::Interested);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}
