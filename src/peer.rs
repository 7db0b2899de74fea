//! Peer wire protocol and per-connection machinery.
//!
//! This module implements the swarm's peer-to-peer protocol: the 32-byte
//! handshake, the eight typed length-prefixed messages, bitfield
//! bookkeeping, the per-connection session state machine, the global
//! request de-duplication table, and the periodic choke scheduler.

pub mod session;

mod bitfield;
mod choking;
mod error;
mod message;
mod neighbors;
mod requests;
mod transport;

pub use bitfield::Bitfield;
pub use choking::ChokeScheduler;
pub use error::PeerError;
pub use message::{Handshake, Message, MessageType, HANDSHAKE_LEN, MAGIC};
pub use neighbors::{ChokeSlot, Neighbor, NeighborState, Neighbors};
pub use requests::RequestTable;
pub use session::{PeerSession, SessionState};
pub use transport::{MessageReader, MessageWriter, PeerTransport};

#[cfg(test)]
mod tests;
