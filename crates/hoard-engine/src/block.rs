//! In-memory blocks and their shared buffers.

use std::sync::Arc;

/// Immutable shared byte buffer for one fetched block.
///
/// Cloning is cheap (`Arc`), which lets the writeback path snapshot the
/// payload and perform disk I/O with the engine's locks released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<[u8]>,
}

impl BlockBuf {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for BlockBuf {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

/// One aligned range of the cached file, resident in RAM.
///
/// All mutable fields are protected by the owning engine's download lock.
/// A block is created when its fetch is initiated and leaves the block map
/// only through `free_block` (ref-count zero and finished).
#[derive(Debug)]
pub(crate) struct Block {
    /// Absolute byte offset in the remote file. Multiple of the buffer size.
    pub offset: u64,
    /// Payload length; equals the buffer size except for the last block.
    pub len: usize,
    /// The fetch was issued speculatively by the prefetch scheduler.
    pub prefetch: bool,

    pub refcnt: u32,
    pub downloaded: bool,
    pub failed: bool,
    pub errno: i32,
    pub data: Option<BlockBuf>,
}

impl Block {
    pub fn new(offset: u64, len: usize, prefetch: bool) -> Self {
        Self {
            offset,
            len,
            prefetch,
            refcnt: 0,
            downloaded: false,
            failed: false,
            errno: 0,
            data: None,
        }
    }

    /// The origin has responded, one way or the other.
    pub fn is_finished(&self) -> bool {
        self.downloaded || self.failed
    }

    pub fn set_downloaded(&mut self, data: BlockBuf) {
        debug_assert!(!self.is_finished());
        debug_assert_eq!(data.len(), self.len);
        self.data = Some(data);
        self.downloaded = true;
    }

    pub fn set_error(&mut self, errno: i32) {
        debug_assert!(!self.is_finished());
        self.failed = true;
        self.errno = if errno > 0 { errno } else { libc::EIO };
    }
}
