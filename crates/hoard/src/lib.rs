#![forbid(unsafe_code)]
//! hoard — a read-through, on-disk block cache for remote file access.
//!
//! Client reads are served from local disk when the block is already
//! cached, from the in-memory block pool while a fetch is in flight, or
//! by a direct origin read when the cache has no room. A background
//! prefetch fills unread blocks, and a `.cinfo` side-car records which
//! blocks are present along with per-session I/O statistics.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hoard::{CacheConfig, CacheCoordinator, CachedFile, ThreadScheduler};
//! # use hoard::RemoteSource;
//! # fn origin() -> Arc<dyn RemoteSource> { unimplemented!() }
//!
//! # fn main() -> hoard::Result<()> {
//! let scheduler = Arc::new(ThreadScheduler::new(4)?);
//! let coordinator = CacheCoordinator::new(CacheConfig::default(), scheduler)?;
//! let daemon = coordinator.start_prefetch_daemon()?;
//!
//! let file = CachedFile::open(coordinator, origin(), "/var/cache/hoard/f.bin", 0, 1 << 30)?;
//! let mut buf = vec![0_u8; 4096];
//! let n = file.read(&mut buf, 0)?;
//! # let _ = (n, daemon);
//! # Ok(())
//! # }
//! ```

pub use hoard_cinfo::{cinfo_path, CacheInfo, IoStatRecord, CINFO_EXTENSION, CINFO_VERSION};
pub use hoard_engine::{
    CacheConfig, CacheCoordinator, CachedFile, IoStats, PrefetchDaemon, PrefetchState,
};
pub use hoard_error::{CacheError, Result};
pub use hoard_io::{
    DirectWaiter, DiskFile, FsFile, InlineScheduler, Job, MemFile, MemRemoteSource,
    ReadCompletion, ReadResult, RemoteSource, ResponseSink, Scheduler, ThreadScheduler,
};
pub use hoard_types::{BlockIndex, BufferSize};
