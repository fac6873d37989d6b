#![forbid(unsafe_code)]
//! The `.cinfo` side-car file.
//!
//! Every cached data file carries a companion info file describing which
//! blocks have been persisted, which were fetched speculatively, which have
//! had their disk write issued since the last fsync, and an appended log of
//! detach-time I/O statistics.
//!
//! On-disk layout (all integers little-endian):
//!
//! ```text
//! offset 0  : version       u8   (= 1)
//! offset 1  : buffer_size   u64
//! offset 9  : file_size     u64
//! offset 17 : prefetch_flag u8   (0 or 1)
//! offset 18 : present bits        ceil(bits/8) bytes
//!           : prefetch bits       ceil(bits/8) bytes, only if prefetch_flag = 1
//!           : write-called bits   ceil(bits/8) bytes
//! then      : zero or more 32-byte I/O stat records appended at detach
//! ```
//!
//! The header (prefix + all bit vectors) is rewritten in place as a single
//! positioned write; stat records are append-only.

use std::path::{Path, PathBuf};

use hoard_error::{CacheError, Result};
use hoard_io::DiskFile;
use hoard_types::{
    bitmap_bytes, bitmap_count_set, bitmap_find_clear, bitmap_get, bitmap_set, read_le_i64,
    read_le_u64, read_u8, BlockIndex, BufferSize, ParseError,
};
use tracing::{debug, warn};

/// Current side-car format version.
pub const CINFO_VERSION: u8 = 1;

/// Side-car file name extension.
pub const CINFO_EXTENSION: &str = "cinfo";

const FIXED_HEADER_LEN: usize = 18;

/// Side-car path for a cached data file: `<data-path>.cinfo`.
#[must_use]
pub fn cinfo_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".");
    name.push(CINFO_EXTENSION);
    PathBuf::from(name)
}

/// One detach-time I/O statistics record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatRecord {
    /// Detach time, seconds since the Unix epoch.
    pub detach_time: i64,
    pub bytes_disk: i64,
    pub bytes_ram: i64,
    pub bytes_missed: i64,
}

impl IoStatRecord {
    pub const ENCODED_LEN: usize = 32;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0_u8; Self::ENCODED_LEN];
        out[0..8].copy_from_slice(&self.detach_time.to_le_bytes());
        out[8..16].copy_from_slice(&self.bytes_disk.to_le_bytes());
        out[16..24].copy_from_slice(&self.bytes_ram.to_le_bytes());
        out[24..32].copy_from_slice(&self.bytes_missed.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            detach_time: read_le_i64(data, offset)?,
            bytes_disk: read_le_i64(data, offset + 8)?,
            bytes_ram: read_le_i64(data, offset + 16)?,
            bytes_missed: read_le_i64(data, offset + 24)?,
        })
    }
}

/// In-memory mirror of one side-car file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    buffer_size: BufferSize,
    file_size: u64,
    prefetch_enabled: bool,
    present: Vec<u8>,
    prefetch: Vec<u8>,
    write_called: Vec<u8>,
    stats: Vec<IoStatRecord>,
}

impl CacheInfo {
    /// Create a fresh mirror with all bits clear.
    ///
    /// `file_size` must be nonzero: an info file recording a zero-length
    /// file is unusable and rejected at open.
    pub fn new(buffer_size: BufferSize, file_size: u64, prefetch_enabled: bool) -> Result<Self> {
        if file_size == 0 {
            return Err(CacheError::Format(
                "cache info file size must be nonzero".to_owned(),
            ));
        }
        let vec_len = bitmap_bytes(buffer_size.blocks_for(file_size));
        Ok(Self {
            buffer_size,
            file_size,
            prefetch_enabled,
            present: vec![0; vec_len],
            prefetch: if prefetch_enabled { vec![0; vec_len] } else { Vec::new() },
            write_called: vec![0; vec_len],
            stats: Vec::new(),
        })
    }

    #[must_use]
    pub fn buffer_size(&self) -> BufferSize {
        self.buffer_size
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn prefetch_enabled(&self) -> bool {
        self.prefetch_enabled
    }

    /// Number of blocks covering the file.
    #[must_use]
    pub fn bits_total(&self) -> u64 {
        self.buffer_size.blocks_for(self.file_size)
    }

    #[must_use]
    pub fn test_present(&self, index: BlockIndex) -> bool {
        bitmap_get(&self.present, index.0)
    }

    pub fn set_present(&mut self, index: BlockIndex) {
        bitmap_set(&mut self.present, index.0);
    }

    #[must_use]
    pub fn test_prefetch(&self, index: BlockIndex) -> bool {
        self.prefetch_enabled && bitmap_get(&self.prefetch, index.0)
    }

    pub fn set_prefetch(&mut self, index: BlockIndex) {
        if self.prefetch_enabled {
            bitmap_set(&mut self.prefetch, index.0);
        }
    }

    #[must_use]
    pub fn present_count(&self) -> u64 {
        bitmap_count_set(&self.present, self.bits_total())
    }

    /// First block whose present bit is clear.
    #[must_use]
    pub fn find_absent(&self) -> Option<BlockIndex> {
        bitmap_find_clear(&self.present, self.bits_total()).map(BlockIndex)
    }

    /// Every block has been persisted to the data file.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.find_absent().is_none()
    }

    /// The write-called bitmap as stored (owned by the sync path).
    #[must_use]
    pub fn write_called_bytes(&self) -> &[u8] {
        &self.write_called
    }

    /// Replace the write-called bitmap (same length as the other vectors).
    pub fn set_write_called_bytes(&mut self, bytes: Vec<u8>) {
        debug_assert_eq!(bytes.len(), self.present.len());
        self.write_called = bytes;
    }

    #[must_use]
    pub fn stats(&self) -> &[IoStatRecord] {
        &self.stats
    }

    /// Byte length of the rewritable header: fixed prefix + bit vectors.
    #[must_use]
    pub fn header_len(&self) -> usize {
        let vec_len = self.present.len();
        let vectors = if self.prefetch_enabled { 3 } else { 2 };
        FIXED_HEADER_LEN + vectors * vec_len
    }

    /// Serialize the rewritable header.
    #[must_use]
    pub fn encode_header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len());
        out.push(CINFO_VERSION);
        out.extend_from_slice(&self.buffer_size.get().to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.push(u8::from(self.prefetch_enabled));
        out.extend_from_slice(&self.present);
        if self.prefetch_enabled {
            out.extend_from_slice(&self.prefetch);
        }
        out.extend_from_slice(&self.write_called);
        out
    }

    /// Rewrite the header in place at offset 0.
    pub fn write_header(&self, file: &dyn DiskFile) -> Result<()> {
        write_full_at(file, &self.encode_header(), 0)
    }

    /// Append one statistics record at end of file and record it in the
    /// mirror.
    pub fn append_io_stat(&mut self, record: IoStatRecord, file: &dyn DiskFile) -> Result<()> {
        append_stat_record(file, record)?;
        self.stats.push(record);
        Ok(())
    }

    /// Load a mirror from an existing side-car file.
    ///
    /// Trailing stat records are parsed greedily; a truncated final record
    /// is tolerated (logged) since an append can race a crash.
    pub fn read_from(file: &dyn DiskFile) -> Result<Self> {
        let len = usize::try_from(file.len()?)
            .map_err(|_| CacheError::Format("cache info file too large".to_owned()))?;
        let mut data = vec![0_u8; len];
        read_full_at(file, &mut data, 0)?;
        Self::decode(&data)
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let map_err = |err: ParseError| CacheError::Format(err.to_string());

        let version = read_u8(data, 0).map_err(map_err)?;
        if version != CINFO_VERSION {
            return Err(map_err(ParseError::UnsupportedVersion {
                found: version,
                supported: CINFO_VERSION,
            }));
        }
        let buffer_size =
            BufferSize::new(read_le_u64(data, 1).map_err(map_err)?).map_err(map_err)?;
        let file_size = read_le_u64(data, 9).map_err(map_err)?;
        if file_size == 0 {
            return Err(CacheError::Format(
                "cache info records zero file size".to_owned(),
            ));
        }
        let prefetch_flag = read_u8(data, 17).map_err(map_err)?;
        if prefetch_flag > 1 {
            return Err(map_err(ParseError::InvalidField {
                field: "prefetch_flag",
                reason: "must be 0 or 1",
            }));
        }
        let prefetch_enabled = prefetch_flag == 1;

        let vec_len = bitmap_bytes(buffer_size.blocks_for(file_size));
        let mut at = FIXED_HEADER_LEN;
        let mut take_vec = |field: &'static str| -> Result<Vec<u8>> {
            let slice = hoard_types::ensure_slice(data, at, vec_len).map_err(|_| {
                CacheError::Format(format!("cache info truncated in {field} bit vector"))
            })?;
            at += vec_len;
            Ok(slice.to_vec())
        };

        let present = take_vec("present")?;
        let prefetch = if prefetch_enabled {
            take_vec("prefetch")?
        } else {
            Vec::new()
        };
        let write_called = take_vec("write-called")?;

        let mut stats = Vec::new();
        while at + IoStatRecord::ENCODED_LEN <= data.len() {
            stats.push(IoStatRecord::decode(data, at).map_err(map_err)?);
            at += IoStatRecord::ENCODED_LEN;
        }
        if at != data.len() {
            warn!(
                event = "cinfo_trailing_garbage",
                trailing = data.len() - at,
                "ignoring truncated stat record at end of cache info file"
            );
        }

        debug!(
            event = "cinfo_loaded",
            file_size,
            blocks = buffer_size.blocks_for(file_size),
            present = bitmap_count_set(&present, buffer_size.blocks_for(file_size)),
            stat_records = stats.len()
        );

        Ok(Self {
            buffer_size,
            file_size,
            prefetch_enabled,
            present,
            prefetch,
            write_called,
            stats,
        })
    }
}

/// Append one statistics record at the side-car's end of file.
pub fn append_stat_record(file: &dyn DiskFile, record: IoStatRecord) -> Result<()> {
    let at = file.len()?;
    write_full_at(file, &record.encode(), at)
}

fn write_full_at(file: &dyn DiskFile, buf: &[u8], offset: u64) -> Result<()> {
    let mut written = 0_usize;
    while written < buf.len() {
        let n = file.write_at(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "cache info write made no progress",
            )));
        }
        written += n;
    }
    Ok(())
}

fn read_full_at(file: &dyn DiskFile, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut read = 0_usize;
    while read < buf.len() {
        let n = file.read_at(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(CacheError::Format(
                "cache info file shorter than expected".to_owned(),
            ));
        }
        read += n;
    }
    Ok(())
}
