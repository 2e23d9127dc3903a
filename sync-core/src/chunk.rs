//! Splitting messages that exceed one transport frame.
//!
//! A sender encodes a [`PeerMessage`] once. When the bytes are larger than a
//! frame allows, [`split_message`] cuts them into [`PeerMessage::Chunk`]
//! pieces that are sent back to back on the same link. The receiver feeds
//! every piece to a [`Reassembler`], which hands back the original bytes after
//! the last one.

use sync_types::PeerMessage;

/// Bytes of encoded message carried per chunk.
///
/// MessagePack spends up to two bytes per payload byte, so a chunk this size
/// still fits a 1 MiB frame.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Largest message a [`Reassembler`] accepts by default.
pub const MAX_REASSEMBLED_SIZE: usize = 64 * 1024 * 1024;

/// Error type for chunk reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// A piece arrived out of sequence.
    OutOfOrder {
        /// Index the reassembler was waiting for.
        expected: u32,
        /// Index that arrived.
        got: u32,
    },
    /// The piece count is zero or smaller than the piece index.
    InvalidTotal {
        /// Announced piece count.
        total: u32,
    },
    /// The message grew past the reassembly limit.
    TooLarge {
        /// Limit in bytes.
        limit: usize,
    },
}

impl std::fmt::Display for ChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkError::OutOfOrder { expected, got } => {
                write!(f, "chunk {} arrived, expected {}", got, expected)
            }
            ChunkError::InvalidTotal { total } => write!(f, "invalid chunk count {}", total),
            ChunkError::TooLarge { limit } => {
                write!(f, "chunked message exceeds {} bytes", limit)
            }
        }
    }
}

impl std::error::Error for ChunkError {}

/// Cut encoded message `bytes` into chunks of at most `chunk_size` bytes.
pub fn split_message(bytes: &[u8], chunk_size: usize) -> Vec<PeerMessage> {
    let chunk_size = chunk_size.max(1);
    let total = bytes.len().div_ceil(chunk_size) as u32;
    bytes
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, data)| PeerMessage::Chunk {
            index: index as u32,
            total,
            data: data.to_vec(),
        })
        .collect()
}

/// Collects the pieces of one chunked message at a time.
///
/// Any error drops the partial message. A piece with index 0 always starts a
/// new message, discarding an unfinished one.
#[derive(Debug)]
pub struct Reassembler {
    limit: usize,
    total: u32,
    next: u32,
    buf: Vec<u8>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(MAX_REASSEMBLED_SIZE)
    }
}

impl Reassembler {
    /// Create a reassembler accepting messages up to `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            total: 0,
            next: 0,
            buf: Vec::new(),
        }
    }

    /// Add one piece. Returns the complete message after its last piece.
    pub fn push(
        &mut self,
        index: u32,
        total: u32,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, ChunkError> {
        if total == 0 || index >= total {
            self.reset();
            return Err(ChunkError::InvalidTotal { total });
        }
        if index == 0 {
            self.reset();
            self.total = total;
        } else if index != self.next || total != self.total {
            let expected = self.next;
            self.reset();
            return Err(ChunkError::OutOfOrder {
                expected,
                got: index,
            });
        }
        if self.buf.len() + data.len() > self.limit {
            self.reset();
            return Err(ChunkError::TooLarge { limit: self.limit });
        }

        self.buf.extend_from_slice(data);
        self.next = index + 1;
        if self.next < self.total {
            return Ok(None);
        }
        let message = std::mem::take(&mut self.buf);
        self.reset();
        Ok(Some(message))
    }

    /// Whether no message is partially received.
    pub fn is_idle(&self) -> bool {
        self.next == 0
    }

    fn reset(&mut self) {
        self.total = 0;
        self.next = 0;
        self.buf.clear();
    }
}
