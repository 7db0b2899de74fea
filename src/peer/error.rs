use thiserror::Error;

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer ID echoed in a handshake doesn't match the roster entry.
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: u32, actual: u32 },

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message type byte.
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer's bitfield does not cover the same piece count as ours.
    #[error("bitfield length mismatch: ours {ours}, theirs {theirs}")]
    BitfieldMismatch { ours: usize, theirs: usize },

    /// Error reading or writing piece data.
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}
