use super::error::StorageError;
use crate::peer::Bitfield;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::info;

struct StoreState {
    bitfield: Bitfield,
    complete: bool,
    assembling: bool,
}

/// Piece-addressed storage for the shared file.
///
/// While the file is incomplete every received piece is persisted as its
/// own staging record (`<name>.<index>.part`); once the bitfield reports
/// completeness the records are concatenated in index order into the final
/// artifact and deleted. A complete store serves pieces by offset-seek
/// reads from the artifact and ignores further writes.
///
/// The store also owns the process-local bitfield, shared by every peer
/// session; [`PieceStore::with_bitfield`] runs a closure under its lock so
/// callers can make check-then-act decisions in one critical section.
pub struct PieceStore {
    dir: PathBuf,
    file_name: String,
    file_size: u64,
    piece_size: u64,
    piece_count: u32,
    last_piece_size: u64,
    state: Mutex<StoreState>,
}

impl PieceStore {
    /// Opens the store rooted at `dir`, creating the directory if needed.
    ///
    /// A file already present at the expected length marks the store
    /// complete and read-only. When the roster claims this peer starts
    /// with the file (`expect_complete`) but no such file exists, startup
    /// fails rather than serving garbage; a stale partial artifact is
    /// discarded instead.
    pub async fn open(
        dir: PathBuf,
        file_name: &str,
        file_size: u64,
        piece_size: u64,
        expect_complete: bool,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir).await?;

        let piece_count = file_size.div_ceil(piece_size) as u32;
        let remainder = file_size % piece_size;
        let last_piece_size = if remainder == 0 { piece_size } else { remainder };

        let path = dir.join(file_name);
        let on_disk = match fs::metadata(&path).await {
            Ok(meta) => meta.is_file() && meta.len() == file_size,
            Err(_) => false,
        };

        if expect_complete && !on_disk {
            return Err(StorageError::MissingCompleteFile(path));
        }
        if !on_disk {
            let _ = fs::remove_file(&path).await;
        }

        let bitfield = if on_disk {
            Bitfield::full(piece_count as usize)
        } else {
            Bitfield::new(piece_count as usize)
        };

        Ok(Self {
            dir,
            file_name: file_name.to_string(),
            file_size,
            piece_size,
            piece_count,
            last_piece_size,
            state: Mutex::new(StoreState {
                bitfield,
                complete: on_disk,
                assembling: on_disk,
            }),
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Returns the byte length of the piece at `index`: `piece_size` for
    /// all but the last piece, which carries the remainder when the file
    /// size doesn't divide evenly.
    pub fn piece_len(&self, index: u32) -> u64 {
        if index == self.piece_count - 1 {
            self.last_piece_size
        } else {
            self.piece_size
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Runs `f` with the local bitfield under its lock.
    pub fn with_bitfield<R>(&self, f: impl FnOnce(&Bitfield) -> R) -> R {
        f(&self.state.lock().bitfield)
    }

    /// Returns a copy of the local bitfield, e.g. for a BITFIELD message.
    pub fn snapshot_bitfield(&self) -> Bitfield {
        self.state.lock().bitfield.clone()
    }

    /// Path of the final artifact.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    fn staging_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}.{}.part", self.file_name, index))
    }

    /// Reads the piece at `index`.
    ///
    /// Complete store: an offset-seek read from the final artifact.
    /// Incomplete store: a staging-record read, failing with
    /// [`StorageError::PieceNotAvailable`] when the piece has not been
    /// received yet.
    pub async fn get_piece(&self, index: u32) -> Result<Bytes, StorageError> {
        if index >= self.piece_count {
            return Err(StorageError::InvalidPieceIndex(index));
        }
        let length = self.piece_len(index) as usize;

        if self.is_complete() {
            let mut file = File::open(self.file_path()).await?;
            file.seek(SeekFrom::Start(index as u64 * self.piece_size))
                .await?;
            let mut buf = vec![0u8; length];
            file.read_exact(&mut buf).await?;
            return Ok(Bytes::from(buf));
        }

        let received = self.state.lock().bitfield.has(index as usize);
        if !received {
            return Err(StorageError::PieceNotAvailable(index));
        }
        self.read_staging(index).await
    }

    /// Persists the piece at `index` and publishes its bitfield bit.
    ///
    /// Idempotent: re-writing an already staged piece overwrites the same
    /// record and leaves the bitfield unchanged. A no-op once the file is
    /// complete. When this write completes the bitfield, the staging
    /// records are assembled into the final artifact exactly once.
    ///
    /// Returns true if this call completed the file.
    pub async fn put_piece(&self, index: u32, data: &[u8]) -> Result<bool, StorageError> {
        if index >= self.piece_count {
            return Err(StorageError::InvalidPieceIndex(index));
        }
        let expected = self.piece_len(index);
        if data.len() as u64 != expected {
            return Err(StorageError::BadPieceLength {
                index,
                expected,
                actual: data.len(),
            });
        }
        if self.is_complete() {
            return Ok(false);
        }

        // The record must be durable before the bit is visible to readers.
        fs::write(self.staging_path(index), data).await?;

        let (should_assemble, lost_race) = {
            let mut state = self.state.lock();
            if state.complete {
                (false, true)
            } else {
                state.bitfield.set(index as usize);
                if state.bitfield.is_complete() && !state.assembling {
                    state.assembling = true;
                    (true, false)
                } else {
                    (false, false)
                }
            }
        };

        if lost_race {
            // A concurrent writer completed the file first; drop the stray
            // record so nothing outlives assembly cleanup.
            let _ = fs::remove_file(self.staging_path(index)).await;
            return Ok(false);
        }
        if should_assemble {
            self.assemble().await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn read_staging(&self, index: u32) -> Result<Bytes, StorageError> {
        let length = self.piece_len(index) as usize;
        let mut file = File::open(self.staging_path(index))
            .await
            .map_err(|_| StorageError::PieceNotAvailable(index))?;
        let mut buf = vec![0u8; length];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Concatenates the staging records in index order into the final
    /// artifact, then removes them. Runs at most once per store; the
    /// `assembling` flag is claimed under the state lock before entry.
    async fn assemble(&self) -> Result<(), StorageError> {
        let path = self.file_path();
        let mut out = File::create(&path).await?;
        for index in 0..self.piece_count {
            let data = self.read_staging(index).await?;
            out.write_all(&data).await?;
        }
        out.sync_all().await?;

        self.state.lock().complete = true;
        info!(path = %path.display(), "assembled complete file");

        for index in 0..self.piece_count {
            let _ = fs::remove_file(self.staging_path(index)).await;
        }
        Ok(())
    }
}
