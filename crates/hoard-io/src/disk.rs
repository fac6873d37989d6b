//! Blocking positioned disk I/O.
//!
//! [`FsFile`] uses `std::os::unix::fs::FileExt`, which is thread-safe and
//! does not require a shared seek position. Short reads and writes are
//! surfaced to the caller; the engine's writeback path owns the retry loop.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use hoard_error::Result;
use parking_lot::Mutex;

/// Positioned I/O on one local file.
pub trait DiskFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the byte count;
    /// fewer than requested only at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write bytes at `offset`. May write fewer than `buf.len()` bytes.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Flush file content to stable storage.
    fn fsync(&self) -> Result<()>;

    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
}

/// File-backed [`DiskFile`] using `pread`/`pwrite` style syscalls.
#[derive(Debug)]
pub struct FsFile {
    file: File,
}

impl FsFile {
    /// Open an existing file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Create the file (and any missing parent directories) if needed,
    /// then open it read-write.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }
}

impl DiskFile for FsFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.file.write_at(buf, offset)?)
    }

    fn fsync(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[derive(Debug, Default)]
struct MemFileState {
    bytes: Vec<u8>,
    /// Byte caps applied to upcoming writes, front first. A cap shorter
    /// than the request produces a short write.
    write_caps: VecDeque<usize>,
    /// Errnos injected into upcoming writes, front first.
    write_errors: VecDeque<i32>,
    fsync_count: u64,
    write_count: u64,
}

/// In-memory [`DiskFile`] with injectable short writes and write errors.
#[derive(Debug, Default)]
pub struct MemFile {
    state: Mutex<MemFileState>,
}

impl MemFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the next write to `cap` bytes (0 yields a zero-length write).
    pub fn push_write_cap(&self, cap: usize) {
        self.state.lock().write_caps.push_back(cap);
    }

    /// Fail the next write with `errno`.
    pub fn push_write_error(&self, errno: i32) {
        self.state.lock().write_errors.push_back(errno);
    }

    #[must_use]
    pub fn fsync_count(&self) -> u64 {
        self.state.lock().fsync_count
    }

    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.state.lock().write_count
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }
}

impl DiskFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let state = self.state.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= state.bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(state.bytes.len() - start);
        buf[..n].copy_from_slice(&state.bytes[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut state = self.state.lock();
        state.write_count += 1;
        if let Some(errno) = state.write_errors.pop_front() {
            return Err(std::io::Error::from_raw_os_error(errno).into());
        }
        let n = match state.write_caps.pop_front() {
            Some(cap) => buf.len().min(cap),
            None => buf.len(),
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(n);
        if state.bytes.len() < end {
            state.bytes.resize(end, 0);
        }
        state.bytes[start..end].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn fsync(&self) -> Result<()> {
        self.state.lock().fsync_count += 1;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.state.lock().bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_file_positioned_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("data");

        let file = FsFile::create(&path).unwrap();
        assert_eq!(file.write_at(b"hello", 3).unwrap(), 5);
        assert_eq!(file.len().unwrap(), 8);

        let mut buf = [0_u8; 5];
        assert_eq!(file.read_at(&mut buf, 3).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        // Read past EOF is short, not an error.
        let mut tail = [0_u8; 16];
        assert_eq!(file.read_at(&mut tail, 6).unwrap(), 2);

        file.fsync().unwrap();
        drop(file);

        let reopened = FsFile::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 8);
    }

    #[test]
    fn fs_file_open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FsFile::open(dir.path().join("absent")).is_err());
    }

    #[test]
    fn mem_file_short_write_injection() {
        let file = MemFile::new();
        file.push_write_cap(3);
        assert_eq!(file.write_at(b"abcdef", 0).unwrap(), 3);
        assert_eq!(file.write_at(b"def", 3).unwrap(), 3);
        assert_eq!(file.snapshot(), b"abcdef");
        assert_eq!(file.write_count(), 2);
    }

    #[test]
    fn mem_file_error_injection() {
        let file = MemFile::new();
        file.push_write_error(libc::ENOSPC);
        let err = file.write_at(b"x", 0).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOSPC);
        assert_eq!(file.write_at(b"x", 0).unwrap(), 1);
    }
}
