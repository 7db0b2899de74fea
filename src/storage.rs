//! Piece-addressed disk storage.
//!
//! While a download is in progress each received piece lives in its own
//! staging record on disk; once every piece is present the records are
//! concatenated in index order into the final artifact and removed. A
//! store opened over an already-complete file serves pieces by seeking
//! into the artifact directly.
//!
//! # Components
//!
//! - [`PieceStore`] - staging-record persistence and final assembly
//! - [`StorageError`] - typed storage failures

mod error;
mod store;

pub use error::StorageError;
pub use store::PieceStore;
