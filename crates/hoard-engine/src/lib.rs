#![forbid(unsafe_code)]
//! Core of the hoard block cache: per-file block engines plus the
//! process-wide coordinator.
//!
//! A [`CachedFile`] serves client reads for one remote file from local
//! disk, from in-memory blocks while fetches are in flight, or by direct
//! origin reads when the cache has no room. The [`CacheCoordinator`] gates
//! RAM and writeback admission across all files, drains the write queue on
//! scheduler workers, and hosts the prefetch tick.

mod block;
mod coordinator;
mod file;

pub use coordinator::{CacheConfig, CacheCoordinator, PrefetchDaemon};
pub use file::{CachedFile, IoStats, PrefetchState};
