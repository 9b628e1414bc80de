use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metainfo::Info;
use riptide_proto::BLOCK_SIZE;

/// Attempts at reading a finished piece back for verification before the
/// piece is invalidated.
const VERIFY_RETRIES: u32 = 3;

/// The flattened torrent payload on disk: a directory tree of preallocated
/// files addressed by absolute byte offset, plus per-piece block accounting
/// and hash verification.
///
/// Thread-safe at piece granularity: block I/O and the verification read
/// hold that piece's rw-lock, so writes to different pieces proceed in
/// parallel.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    files: Vec<StorageFile>,
    /// `file_offsets[i]` is the absolute offset of file `i`'s first byte;
    /// the final entry is the total length sentinel.
    file_offsets: Vec<u64>,
    pieces: Vec<RwLock<Piece>>,
    piece_length: u64,
    total_length: u64,
    has_piece: Vec<AtomicBool>,
    num_pieces_obtained: AtomicUsize,
}

#[derive(Debug)]
struct StorageFile {
    path: PathBuf,
    length: u64,
    start: u64,
}

#[derive(Debug)]
struct Piece {
    length: u64,
    num_blocks: usize,
    num_blocks_completed: usize,
    has_block: Vec<bool>,
    complete: bool,
    expected_hash: [u8; 20],
}

/// What a successful `write_block` did beyond storing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The piece still has missing blocks.
    Pending,
    /// The final block arrived and the piece hash checked out.
    PieceVerified {
        piece_length: u64,
        torrent_complete: bool,
    },
    /// The final block arrived but verification failed; every block of the
    /// piece has been discarded.
    HashMismatch,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("piece index {index} out of range ({num_pieces} pieces)")]
    PieceOutOfRange { index: u32, num_pieces: usize },
    #[error("offset {0} is not a multiple of the block size")]
    UnalignedOffset(u32),
    #[error("offset {offset} lies beyond the piece ({piece_length} bytes)")]
    OffsetBeyondPiece { offset: u32, piece_length: u64 },
    #[error("piece {0} is not complete")]
    PieceDoesNotExist(u32),
    #[error("block {block} of piece {piece} already written")]
    BlockAlreadyExists { piece: u32, block: usize },
    #[error("block length {got} does not match the canonical length {expected}")]
    BadBlockLength { expected: u64, got: u64 },
    #[error("end offset {end} lies beyond the torrent ({total} bytes)")]
    EndBeyondTorrent { end: u64, total: u64 },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] InvalidRequest),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

enum Access {
    Read,
    Write,
}

impl Storage {
    /// Creates the on-disk tree under `base_dir` and preallocates every file
    /// to its declared size. Single-file layout is `<dir>/<name>`,
    /// multi-file is `<dir>/<path components…>`, where `<dir>` is the
    /// torrent name without its extension.
    pub async fn create(base_dir: &Path, info: &Info) -> Result<Self, StorageError> {
        let dir_name = Path::new(&info.name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| info.name.clone());
        let root = base_dir.join(dir_name);

        let mut files = Vec::with_capacity(info.files.len());
        let mut file_offsets = Vec::with_capacity(info.files.len() + 1);
        let mut offset = 0u64;
        for entry in &info.files {
            let mut path = root.clone();
            for component in &entry.path {
                path.push(component);
            }
            file_offsets.push(offset);
            files.push(StorageFile {
                path,
                length: entry.length,
                start: offset,
            });
            offset += entry.length;
        }
        file_offsets.push(offset);
        debug_assert_eq!(offset, info.total_size());

        for file in &files {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            allocate_sparse(&file.path, file.length).await?;
        }
        info!(root = %root.display(), files = files.len(), "file tree created");

        let num_pieces = info.num_pieces();
        let mut pieces = Vec::with_capacity(num_pieces);
        for index in 0..num_pieces {
            let length = info.piece_size(index);
            let num_blocks = (length.div_ceil(BLOCK_SIZE as u64) as usize).max(1);
            pieces.push(RwLock::new(Piece {
                length,
                num_blocks,
                num_blocks_completed: 0,
                has_block: vec![false; num_blocks],
                complete: false,
                expected_hash: info.pieces[index],
            }));
        }

        Ok(Self {
            root,
            files,
            file_offsets,
            pieces,
            piece_length: info.piece_length,
            total_length: info.total_size(),
            has_piece: (0..num_pieces).map(|_| AtomicBool::new(false)).collect(),
            num_pieces_obtained: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.has_piece
            .get(index as usize)
            .map(|bit| bit.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn num_pieces_obtained(&self) -> usize {
        self.num_pieces_obtained.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.num_pieces_obtained() == self.pieces.len()
    }

    /// Stores one block. When it is the piece's last missing block the whole
    /// piece is read back and hash-verified inside the same lock; a mismatch
    /// invalidates the piece so every block can be fetched again.
    pub async fn write_block(
        &self,
        piece_index: u32,
        offset: u32,
        block: &[u8],
    ) -> Result<WriteOutcome, StorageError> {
        let piece_lock = self.piece_lock(piece_index)?;
        let mut piece = piece_lock.write().await;

        let (absolute_offset, block_index) =
            self.validate(Access::Write, piece_index, &piece, offset, block.len() as u64)?;

        self.write_range(absolute_offset, block).await?;

        piece.has_block[block_index] = true;
        piece.num_blocks_completed += 1;
        debug!(
            piece = piece_index,
            block = block_index,
            completed = piece.num_blocks_completed,
            total = piece.num_blocks,
            "block written"
        );

        if piece.num_blocks_completed < piece.num_blocks {
            return Ok(WriteOutcome::Pending);
        }
        self.verify_piece(piece_index, &mut piece).await
    }

    /// Reads one block of a completed piece.
    pub async fn read_block(
        &self,
        piece_index: u32,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let piece_lock = self.piece_lock(piece_index)?;
        let piece = piece_lock.read().await;
        let (absolute_offset, _) =
            self.validate(Access::Read, piece_index, &piece, offset, length as u64)?;
        Ok(self.read_range(absolute_offset, length as u64).await?)
    }

    /// Reads a whole completed piece; with a SHA-1 over the result this is
    /// the restart-resume primitive.
    pub async fn read_piece(&self, piece_index: u32) -> Result<Vec<u8>, StorageError> {
        let piece_lock = self.piece_lock(piece_index)?;
        let piece = piece_lock.read().await;
        if !piece.complete {
            return Err(InvalidRequest::PieceDoesNotExist(piece_index).into());
        }
        let start = piece_index as u64 * self.piece_length;
        Ok(self.read_range(start, piece.length).await?)
    }

    /// The `(begin, length)` of every block still missing from a piece;
    /// empty for completed or out-of-range pieces. Feeds the request
    /// scheduler.
    pub async fn missing_blocks(&self, piece_index: u32) -> Vec<(u32, u32)> {
        let Ok(lock) = self.piece_lock(piece_index) else {
            return Vec::new();
        };
        let piece = lock.read().await;
        if piece.complete {
            return Vec::new();
        }
        piece
            .has_block
            .iter()
            .enumerate()
            .filter(|&(_, &has)| !has)
            .map(|(i, _)| (i as u32 * BLOCK_SIZE, block_length(piece.length, i) as u32))
            .collect()
    }

    fn piece_lock(&self, piece_index: u32) -> Result<&RwLock<Piece>, InvalidRequest> {
        self.pieces
            .get(piece_index as usize)
            .ok_or(InvalidRequest::PieceOutOfRange {
                index: piece_index,
                num_pieces: self.pieces.len(),
            })
    }

    /// The shared validation gate for block reads and writes. Returns the
    /// absolute offset and block index on success.
    fn validate(
        &self,
        access: Access,
        piece_index: u32,
        piece: &Piece,
        offset: u32,
        length: u64,
    ) -> Result<(u64, usize), InvalidRequest> {
        if offset % BLOCK_SIZE != 0 {
            return Err(InvalidRequest::UnalignedOffset(offset));
        }
        let block_index = (offset / BLOCK_SIZE) as usize;
        if block_index >= piece.num_blocks {
            return Err(InvalidRequest::OffsetBeyondPiece {
                offset,
                piece_length: piece.length,
            });
        }

        match access {
            Access::Read if !piece.complete => {
                return Err(InvalidRequest::PieceDoesNotExist(piece_index));
            }
            Access::Write if piece.has_block[block_index] => {
                return Err(InvalidRequest::BlockAlreadyExists {
                    piece: piece_index,
                    block: block_index,
                });
            }
            _ => {}
        }

        let expected = block_length(piece.length, block_index);
        if length != expected {
            return Err(InvalidRequest::BadBlockLength {
                expected,
                got: length,
            });
        }

        let absolute_offset = piece_index as u64 * self.piece_length + offset as u64;
        let end = absolute_offset + length;
        if end > self.total_length {
            return Err(InvalidRequest::EndBeyondTorrent {
                end,
                total: self.total_length,
            });
        }

        Ok((absolute_offset, block_index))
    }

    async fn verify_piece(
        &self,
        piece_index: u32,
        piece: &mut Piece,
    ) -> Result<WriteOutcome, StorageError> {
        let start = piece_index as u64 * self.piece_length;
        let mut mismatch = false;
        for attempt in 1..=VERIFY_RETRIES {
            let data = match self.read_range(start, piece.length).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        piece = piece_index,
                        attempt,
                        error = %e,
                        "verification read failed"
                    );
                    continue;
                }
            };
            let mut hasher = Sha1::new();
            hasher.update(&data);
            if hasher.finalize().as_slice() == piece.expected_hash {
                piece.complete = true;
                self.has_piece[piece_index as usize].store(true, Ordering::Release);
                let obtained = self.num_pieces_obtained.fetch_add(1, Ordering::AcqRel) + 1;
                let torrent_complete = obtained == self.pieces.len();
                info!(
                    piece = piece_index,
                    obtained,
                    total = self.pieces.len(),
                    "piece verified"
                );
                return Ok(WriteOutcome::PieceVerified {
                    piece_length: piece.length,
                    torrent_complete,
                });
            }
            mismatch = true;
            break;
        }

        if mismatch {
            warn!(piece = piece_index, "piece hash mismatch, invalidating");
        } else {
            warn!(
                piece = piece_index,
                "piece unreadable after {} attempts, invalidating", VERIFY_RETRIES
            );
        }
        piece.complete = false;
        piece.has_block.iter_mut().for_each(|b| *b = false);
        piece.num_blocks_completed = 0;
        self.has_piece[piece_index as usize].store(false, Ordering::Release);
        Ok(WriteOutcome::HashMismatch)
    }

    /// Index of the file owning `absolute_offset`, by binary search over the
    /// offsets array.
    fn file_index_for(&self, absolute_offset: u64) -> usize {
        let upper = self.file_offsets.partition_point(|&o| o <= absolute_offset);
        upper - 1
    }

    async fn read_range(&self, absolute_offset: u64, length: u64) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length as usize);
        let mut cursor = absolute_offset;
        let end = absolute_offset + length;
        while cursor < end {
            let index = self.file_index_for(cursor);
            let file = &self.files[index];
            let offset_in_file = cursor - file.start;
            let take = (end - cursor).min(file.length - offset_in_file);

            let mut handle = OpenOptions::new().read(true).open(&file.path).await?;
            handle.seek(SeekFrom::Start(offset_in_file)).await?;
            let mut buf = vec![0u8; take as usize];
            handle.read_exact(&mut buf).await?;
            out.extend_from_slice(&buf);

            cursor += take;
        }
        Ok(out)
    }

    async fn write_range(&self, absolute_offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut cursor = absolute_offset;
        let end = absolute_offset + data.len() as u64;
        let mut written = 0usize;
        while cursor < end {
            let index = self.file_index_for(cursor);
            let file = &self.files[index];
            let offset_in_file = cursor - file.start;
            let take = ((end - cursor).min(file.length - offset_in_file)) as usize;

            let mut handle = OpenOptions::new().write(true).open(&file.path).await?;
            handle.seek(SeekFrom::Start(offset_in_file)).await?;
            handle.write_all(&data[written..written + take]).await?;

            written += take;
            cursor += take as u64;
        }
        Ok(())
    }
}

/// Canonical length of a block within a piece; only the trailing block may
/// fall short of `BLOCK_SIZE`.
pub fn block_length(piece_length: u64, block_index: usize) -> u64 {
    let start = block_index as u64 * BLOCK_SIZE as u64;
    (piece_length - start).min(BLOCK_SIZE as u64)
}

/// Preallocates a file by writing a single byte at `length - 1`, leaving the
/// rest sparse where the filesystem supports it.
async fn allocate_sparse(path: &Path, length: u64) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .truncate(false)
        .open(path)
        .await?;
    if length > 0 {
        file.seek(SeekFrom::Start(length - 1)).await?;
        file.write_all(&[0]).await?;
    }
    file.flush().await?;
    Ok(())
}
