use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("piece {index} has wrong length: expected {expected}, got {actual}")]
    BadPieceLength {
        index: u32,
        expected: u64,
        actual: usize,
    },

    #[error("piece {0} has not been received yet")]
    PieceNotAvailable(u32),

    #[error("expected complete file missing or wrong size: {0}")]
    MissingCompleteFile(PathBuf),
}
