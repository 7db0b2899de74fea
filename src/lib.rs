//! fileswarm - a peer-to-peer file distribution engine
//!
//! A static roster of peers shares one file by exchanging fixed-size
//! pieces over TCP. Peers advertise what they hold with bitfields,
//! negotiate upload slots through a periodic choke/unchoke scheduler,
//! and reassemble the file from pieces that arrive out of order across
//! many concurrent connections.
//!
//! # Modules
//!
//! - [`peer`] - wire protocol, bitfields, sessions, request table, choking
//! - [`storage`] - piece staging records and final-file assembly
//! - [`node`] - swarm membership, accept/dial loops, convergence
//! - [`config`] - common settings and peer roster files

pub mod config;
pub mod node;
pub mod peer;
pub mod storage;

pub use config::{CommonConfig, ConfigError, Roster, RosterPeer};
pub use node::{Node, NodeError, Swarm};
pub use peer::{
    Bitfield, ChokeScheduler, ChokeSlot, Handshake, Message, MessageType, Neighbor, Neighbors,
    PeerError, PeerTransport, RequestTable,
};
pub use storage::{PieceStore, StorageError};
