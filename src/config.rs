//! Configuration files: common settings and the peer roster.
//!
//! Two whitespace-separated text files drive a swarm, shared verbatim by
//! every peer:
//!
//! ```text
//! # Common.cfg: one `Key value` pair per line
//! NumberOfPreferredNeighbors 2
//! UnchokingInterval 5
//! OptimisticUnchokingInterval 15
//! FileName thefile.dat
//! FileSize 2167705
//! PieceSize 16384
//!
//! # PeerInfo.cfg: one `ID host port has_file` line per peer, in start order
//! 1001 peer-a.example.net 6008 1
//! 1002 peer-b.example.net 6008 0
//! ```
//!
//! Configuration problems are fatal: a process with a missing file, a
//! malformed line, or a self ID absent from the roster must not start.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("malformed roster line: {0}")]
    MalformedEntry(String),

    #[error("peer {0} not present in roster")]
    UnknownSelf(u32),
}

/// Swarm-wide settings from `Common.cfg`.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub preferred_neighbors: usize,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
}

impl CommonConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parses the `Key value` format. Unknown keys are ignored so the
    /// format can grow; missing or unparsable required keys are errors.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut preferred_neighbors = None;
        let mut unchoking_interval = None;
        let mut optimistic_unchoking_interval = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for line in input.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            match key {
                "NumberOfPreferredNeighbors" => {
                    preferred_neighbors = Some(parse_field(key, value)?);
                }
                "UnchokingInterval" => {
                    unchoking_interval = Some(Duration::from_secs(parse_field(key, value)?));
                }
                "OptimisticUnchokingInterval" => {
                    optimistic_unchoking_interval =
                        Some(Duration::from_secs(parse_field(key, value)?));
                }
                "FileName" => file_name = Some(value.to_string()),
                "FileSize" => file_size = Some(parse_field(key, value)?),
                "PieceSize" => piece_size = Some(parse_field(key, value)?),
                _ => {}
            }
        }

        let config = Self {
            preferred_neighbors: preferred_neighbors
                .ok_or(ConfigError::MissingField("NumberOfPreferredNeighbors"))?,
            unchoking_interval: unchoking_interval
                .ok_or(ConfigError::MissingField("UnchokingInterval"))?,
            optimistic_unchoking_interval: optimistic_unchoking_interval
                .ok_or(ConfigError::MissingField("OptimisticUnchokingInterval"))?,
            file_name: file_name.ok_or(ConfigError::MissingField("FileName"))?,
            file_size: file_size.ok_or(ConfigError::MissingField("FileSize"))?,
            piece_size: piece_size.ok_or(ConfigError::MissingField("PieceSize"))?,
        };

        if config.piece_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "PieceSize".to_string(),
                value: "0".to_string(),
            });
        }
        if config.file_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "FileSize".to_string(),
                value: "0".to_string(),
            });
        }
        if config.preferred_neighbors == 0 {
            return Err(ConfigError::InvalidValue {
                field: "NumberOfPreferredNeighbors".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(config)
    }

    /// Number of pieces the file divides into.
    pub fn piece_count(&self) -> u32 {
        self.file_size.div_ceil(self.piece_size) as u32
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// One `PeerInfo.cfg` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterPeer {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

/// The ordered peer roster from `PeerInfo.cfg`.
///
/// Order matters: every entry listed before a peer's own is a "prior
/// peer" that peer dials on startup, so each joining process connects to
/// everyone already running.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub peers: Vec<RosterPeer>,
}

impl Roster {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut peers = Vec::new();
        for line in input.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let &[id, host, port, has_file] = fields.as_slice() else {
                return Err(ConfigError::MalformedEntry(line.to_string()));
            };
            peers.push(RosterPeer {
                id: parse_field("peer id", id)?,
                host: host.to_string(),
                port: parse_field("port", port)?,
                has_file: match has_file {
                    "1" => true,
                    "0" => false,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            field: "has_file".to_string(),
                            value: other.to_string(),
                        })
                    }
                },
            });
        }
        Ok(Self { peers })
    }

    /// This process's own roster entry.
    pub fn me(&self, id: u32) -> Result<&RosterPeer, ConfigError> {
        self.peers
            .iter()
            .find(|p| p.id == id)
            .ok_or(ConfigError::UnknownSelf(id))
    }

    /// Peers listed before `id`, to be dialed on startup.
    pub fn prior(&self, id: u32) -> Vec<RosterPeer> {
        self.peers
            .iter()
            .take_while(|p| p.id != id)
            .cloned()
            .collect()
    }

    /// Number of peers in the swarm besides ourselves.
    pub fn swarm_size(&self) -> usize {
        self.peers.len().saturating_sub(1)
    }
}
