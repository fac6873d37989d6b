#![forbid(unsafe_code)]
//! I/O seams for the hoard block cache.
//!
//! Three collaborators the block engine talks to, each behind a small
//! trait so tests can substitute in-memory doubles:
//!
//! - [`DiskFile`] — blocking positioned I/O on the local data and info
//!   files ([`FsFile`] over `std::fs::File`, [`MemFile`] for tests).
//! - [`RemoteSource`] — asynchronous positioned reads from the origin,
//!   delivering exactly one [`ReadCompletion`] per call.
//! - [`Scheduler`] — one-shot job execution on a worker thread
//!   ([`ThreadScheduler`], or [`InlineScheduler`] for deterministic tests).

mod disk;
mod sched;
mod source;

pub use disk::{DiskFile, FsFile, MemFile};
pub use sched::{InlineScheduler, Job, Scheduler, ThreadScheduler};
pub use source::{
    BlockCompletion, DirectWaiter, MemRemoteSource, ReadCompletion, ReadResult, RemoteSource,
    ResponseSink,
};
