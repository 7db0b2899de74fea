use super::error::PeerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic header opening every handshake.
pub const MAGIC: &[u8] = b"P2PFILESHARINGPROJ";

/// A handshake is always exactly 32 bytes: 18 magic bytes, 10 zero bytes,
/// and a 4-byte big-endian peer ID. It is never length-prefixed.
pub const HANDSHAKE_LEN: usize = 32;

const PADDING_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Choke),
            1 => Ok(MessageType::Unchoke),
            2 => Ok(MessageType::Interested),
            3 => Ok(MessageType::NotInterested),
            4 => Ok(MessageType::Have),
            5 => Ok(MessageType::Bitfield),
            6 => Ok(MessageType::Request),
            7 => Ok(MessageType::Piece),
            _ => Err(PeerError::InvalidMessageType(value)),
        }
    }
}

/// The connection-opening handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub peer_id: u32,
}

impl Handshake {
    pub fn new(peer_id: u32) -> Self {
        Self { peer_id }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_slice(MAGIC);
        buf.put_bytes(0, PADDING_LEN);
        buf.put_u32(self.peer_id);
        buf.freeze()
    }

    /// Decodes a handshake, validating the exact magic header and the
    /// all-zero padding.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }

        if &data[..MAGIC.len()] != MAGIC {
            return Err(PeerError::InvalidHandshake);
        }

        if data[MAGIC.len()..MAGIC.len() + PADDING_LEN]
            .iter()
            .any(|&b| b != 0)
        {
            return Err(PeerError::InvalidHandshake);
        }

        let mut id = [0u8; 4];
        id.copy_from_slice(&data[MAGIC.len() + PADDING_LEN..]);
        Ok(Self {
            peer_id: u32::from_be_bytes(id),
        })
    }
}

/// A protocol message.
///
/// On the wire every message is a 4-byte big-endian length prefix covering
/// `1 (type byte) + payload`, the type byte, then the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32 },
    Piece { index: u32, data: Bytes },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Choke => MessageType::Choke,
            Message::Unchoke => MessageType::Unchoke,
            Message::Interested => MessageType::Interested,
            Message::NotInterested => MessageType::NotInterested,
            Message::Have { .. } => MessageType::Have,
            Message::Bitfield(_) => MessageType::Bitfield,
            Message::Request { .. } => MessageType::Request,
            Message::Piece { .. } => MessageType::Piece,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(self.message_type() as u8);
            }
            Message::Have { index } => {
                buf.put_u32(5);
                buf.put_u8(MessageType::Have as u8);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageType::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request { index } => {
                buf.put_u32(5);
                buf.put_u8(MessageType::Request as u8);
                buf.put_u32(*index);
            }
            Message::Piece { index, data } => {
                buf.put_u32(5 + data.len() as u32);
                buf.put_u8(MessageType::Piece as u8);
                buf.put_u32(*index);
                buf.put_slice(data);
            }
        }

        buf.freeze()
    }

    /// Decodes one whole frame, length prefix included.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("too short".into()));
        }

        let length = data.get_u32() as usize;

        if length == 0 {
            return Err(PeerError::InvalidMessage("zero length".into()));
        }

        if data.remaining() < length {
            return Err(PeerError::InvalidMessage("incomplete message".into()));
        }

        let message_type = MessageType::try_from(data.get_u8())?;

        match message_type {
            MessageType::Choke => Ok(Message::Choke),
            MessageType::Unchoke => Ok(Message::Unchoke),
            MessageType::Interested => Ok(Message::Interested),
            MessageType::NotInterested => Ok(Message::NotInterested),
            MessageType::Have => {
                if data.remaining() < 4 {
                    return Err(PeerError::InvalidMessage("have too short".into()));
                }
                Ok(Message::Have {
                    index: data.get_u32(),
                })
            }
            MessageType::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(length - 1))),
            MessageType::Request => {
                if data.remaining() < 4 {
                    return Err(PeerError::InvalidMessage("request too short".into()));
                }
                Ok(Message::Request {
                    index: data.get_u32(),
                })
            }
            MessageType::Piece => {
                if data.remaining() < 4 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let index = data.get_u32();
                let piece_data = data.copy_to_bytes(length - 5);
                Ok(Message::Piece {
                    index,
                    data: piece_data,
                })
            }
        }
    }
}
