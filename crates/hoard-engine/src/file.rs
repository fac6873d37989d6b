//! The per-file block engine.
//!
//! One `CachedFile` fronts one remote file: it partitions client reads
//! into aligned blocks, coalesces concurrent readers onto in-flight
//! fetches, writes finished blocks back to the local data file, batches
//! info-file syncs, and drives prefetch for unread blocks.
//!
//! # Concurrency design
//!
//! Three locks, never held across disk or origin I/O:
//!
//! - the **download lock** (`Mutex<DownloadState>` + condvar) protects the
//!   block map, every ref-count, the present/prefetch bits, and prefetch
//!   transitions driven by the map size. Readers block on the condvar for
//!   in-flight fetches; the response path broadcasts after each delivery.
//! - the **sync lock** protects the write-called bitmap, the non-flushed
//!   counter, and the deferred-write list used while a sync job runs.
//! - the **state lock** protects prefetch-state transitions made outside
//!   block-map scope (stop on close, wake-up, the complete latch).
//!
//! Lock order: download before sync, download before state; the
//! coordinator's internal lock is always innermost. In-memory copies out
//! of finished blocks happen under the download lock; that is a memcpy,
//! not I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use hoard_cinfo::{append_stat_record, cinfo_path, CacheInfo, IoStatRecord};
use hoard_error::{CacheError, Result};
use hoard_io::{
    DirectWaiter, DiskFile, FsFile, ReadCompletion, ReadResult, RemoteSource, ResponseSink,
};
use hoard_types::{bitmap_set, BlockIndex, BufferSize};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::block::{Block, BlockBuf};
use crate::coordinator::CacheCoordinator;

/// Prefetch state of one cached file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchState {
    /// Prefetch disabled by configuration.
    Off,
    /// Eligible: registered with the coordinator for prefetch ticks.
    On,
    /// Paused: the block map grew past the hold threshold.
    Hold,
    /// Every block is persisted; nothing left to prefetch.
    Complete,
    /// Shut down for close.
    Stopped,
}

/// Aggregate I/O counters for one file session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoStats {
    /// Bytes served from the local data file.
    pub bytes_disk: i64,
    /// Bytes served from in-memory blocks.
    pub bytes_ram: i64,
    /// Bytes served by direct origin reads that bypassed the cache.
    pub bytes_missed: i64,
}

#[derive(Debug, Default)]
struct IoCounters {
    bytes_disk: AtomicI64,
    bytes_ram: AtomicI64,
    bytes_missed: AtomicI64,
}

struct DownloadState {
    block_map: HashMap<u64, Block>,
    /// Present and prefetch bits live here; the write-called bitmap is
    /// owned by the sync lock.
    cinfo: CacheInfo,
}

struct SyncState {
    in_sync: bool,
    /// Local block indices whose writeback finished while a sync job ran.
    writes_during_sync: Vec<u64>,
    non_flushed_cnt: u32,
    write_called: Vec<u8>,
}

/// A fetch to issue once the download lock is released.
struct FetchRequest {
    index: u64,
    offset: u64,
    len: usize,
}

/// Byte overlap of one block with a client request.
struct Overlap {
    user_off: usize,
    block_off: usize,
    len: usize,
}

fn overlap(index: u64, buffer_size: u64, req_off: u64, req_len: usize) -> Option<Overlap> {
    let beg = index * buffer_size;
    let end = beg + buffer_size;
    let req_end = req_off + req_len as u64;

    if req_off < end && req_end > beg {
        let ovl_beg = beg.max(req_off);
        let ovl_end = end.min(req_end);
        Some(Overlap {
            user_off: (ovl_beg - req_off) as usize,
            block_off: (ovl_beg - beg) as usize,
            len: (ovl_end - ovl_beg) as usize,
        })
    } else {
        None
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn is_eintr(err: &CacheError) -> bool {
    matches!(err, CacheError::Io(io) if io.raw_os_error() == Some(libc::EINTR))
}

/// Per-file controller of the block cache.
pub struct CachedFile {
    coordinator: Arc<CacheCoordinator>,
    source: Arc<dyn RemoteSource>,
    data_file: Box<dyn DiskFile>,
    info_file: Box<dyn DiskFile>,
    path: PathBuf,

    /// Base byte offset of the cached range (multiple of the buffer size).
    offset: u64,
    /// Absolute end of the cached range; equals the remote file size when
    /// the whole file is cached.
    file_size: u64,
    buffer_size: BufferSize,
    prefetch_enabled: bool,
    sync_threshold: u32,
    write_retry_limit: u32,

    download: Mutex<DownloadState>,
    download_cond: Condvar,
    sync_state: Mutex<SyncState>,
    state: Mutex<PrefetchState>,

    counters: IoCounters,
    prefetch_read_cnt: AtomicU64,
    prefetch_hit_cnt: AtomicU64,
    closed: AtomicBool,

    self_weak: Weak<CachedFile>,
}

impl std::fmt::Debug for CachedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFile")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("file_size", &self.file_size)
            .finish()
    }
}

impl CachedFile {
    /// Open (or create) the local data file and its side-car, then attach
    /// the engine.
    ///
    /// A pre-existing side-car is authoritative: its stored geometry must
    /// agree with `file_size - offset` or the open fails. An existing but
    /// empty side-car is corrupt and also fails the open.
    pub fn open(
        coordinator: Arc<CacheCoordinator>,
        source: Arc<dyn RemoteSource>,
        path: impl Into<PathBuf>,
        offset: u64,
        file_size: u64,
    ) -> Result<Arc<Self>> {
        let path = path.into();
        let info_path = cinfo_path(&path);

        if let Ok(meta) = std::fs::metadata(&info_path) {
            if meta.len() == 0 {
                return Err(CacheError::OpenFailure(format!(
                    "info file {} exists but records nothing",
                    info_path.display()
                )));
            }
        }

        let data_file = FsFile::create(&path).map_err(|err| {
            CacheError::OpenFailure(format!("cannot open data file {}: {err}", path.display()))
        })?;
        let info_file = FsFile::create(&info_path).map_err(|err| {
            CacheError::OpenFailure(format!(
                "cannot open info file {}: {err}",
                info_path.display()
            ))
        })?;

        Self::open_with_backends(
            coordinator,
            source,
            Box::new(data_file),
            Box::new(info_file),
            path,
            offset,
            file_size,
        )
    }

    /// Attach the engine to caller-supplied disk backends.
    ///
    /// The info backend is treated as pre-existing when it is non-empty.
    pub fn open_with_backends(
        coordinator: Arc<CacheCoordinator>,
        source: Arc<dyn RemoteSource>,
        data_file: Box<dyn DiskFile>,
        info_file: Box<dyn DiskFile>,
        path: PathBuf,
        offset: u64,
        file_size: u64,
    ) -> Result<Arc<Self>> {
        let config = coordinator.config().clone();
        if file_size <= offset {
            return Err(CacheError::OpenFailure(format!(
                "cached range is empty: offset {offset}, file size {file_size}"
            )));
        }
        if offset % config.buffer_size != 0 {
            return Err(CacheError::OpenFailure(format!(
                "range offset {offset} is not aligned to buffer size {}",
                config.buffer_size
            )));
        }
        let range_len = file_size - offset;
        let prefetch_enabled = config.prefetch_max_blocks > 0;

        let existed = info_file.len()? > 0;
        let (cinfo, complete) = if existed {
            let cinfo = CacheInfo::read_from(&*info_file).map_err(|err| {
                CacheError::OpenFailure(format!(
                    "unreadable info file for {}: {err}",
                    path.display()
                ))
            })?;
            if cinfo.file_size() != range_len {
                return Err(CacheError::OpenFailure(format!(
                    "info file for {} records size {} but caller supplied {}",
                    path.display(),
                    cinfo.file_size(),
                    range_len
                )));
            }
            let complete = cinfo.is_complete();
            (cinfo, complete)
        } else {
            let buffer_size = BufferSize::new(config.buffer_size)
                .map_err(|err| CacheError::Config(err.to_string()))?;
            let cinfo = CacheInfo::new(buffer_size, range_len, prefetch_enabled)?;
            cinfo.write_header(&*info_file)?;
            info_file.fsync()?;
            (cinfo, false)
        };

        // A pre-existing side-car fixes the block geometry for good.
        let buffer_size = cinfo.buffer_size();
        let write_called = cinfo.write_called_bytes().to_vec();
        let state = if !prefetch_enabled {
            PrefetchState::Off
        } else if complete {
            PrefetchState::Complete
        } else {
            PrefetchState::On
        };

        let file = Arc::new_cyclic(|weak| Self {
            coordinator: Arc::clone(&coordinator),
            source,
            data_file,
            info_file,
            path,
            offset,
            file_size,
            buffer_size,
            prefetch_enabled,
            sync_threshold: config.sync_threshold,
            write_retry_limit: config.write_retry_limit,
            download: Mutex::new(DownloadState {
                block_map: HashMap::new(),
                cinfo,
            }),
            download_cond: Condvar::new(),
            sync_state: Mutex::new(SyncState {
                in_sync: false,
                writes_during_sync: Vec::new(),
                non_flushed_cnt: 0,
                write_called,
            }),
            state: Mutex::new(state),
            counters: IoCounters::default(),
            prefetch_read_cnt: AtomicU64::new(0),
            prefetch_hit_cnt: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            self_weak: weak.clone(),
        });

        info!(
            event = "file_opened",
            path = %file.path.display(),
            owner = %config.username,
            blocks = file.bits_total(),
            pre_existing = existed,
            complete
        );

        if *file.state.lock() == PrefetchState::On {
            coordinator.register_prefetch_file(&file);
        }
        Ok(file)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size.get()
    }

    fn bits_total(&self) -> u64 {
        self.buffer_size.blocks_for(self.file_size - self.offset)
    }

    fn local_index(&self, index: u64) -> u64 {
        let base = self.offset / self.buffer_size.get();
        debug_assert!(index >= base);
        index - base
    }

    /// Serve one client read.
    ///
    /// Blocks already in RAM are copied out once their fetch finishes;
    /// disk-resident blocks are read in place; missing blocks are fetched
    /// into the cache when the coordinator grants room, and served by
    /// direct origin reads otherwise. Returns the byte count delivered
    /// into `buf` (short only at end of file).
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset < self.offset {
            return Err(CacheError::Config(format!(
                "read at {offset} below cached range base {}",
                self.offset
            )));
        }
        if offset >= self.file_size || buf.is_empty() {
            return Ok(0);
        }
        let bs = self.buffer_size.get();
        let req_len = usize::min(buf.len(), (self.file_size - offset) as usize);
        let buf = &mut buf[..req_len];
        let idx_first = offset / bs;
        let idx_last = (offset + req_len as u64 - 1) / bs;

        let mut taken: Vec<u64> = Vec::new();
        let mut pending: Vec<u64> = Vec::new();
        let mut on_disk: Vec<u64> = Vec::new();
        let mut direct: Vec<u64> = Vec::new();
        let mut fetches: Vec<FetchRequest> = Vec::new();

        {
            let mut dl = self.download.lock();
            for index in idx_first..=idx_last {
                // Already in RAM or incoming: coalesce onto it.
                if let Some(block) = dl.block_map.get_mut(&index) {
                    block.refcnt += 1;
                    taken.push(index);
                    pending.push(index);
                    continue;
                }
                if dl
                    .cinfo
                    .test_present(BlockIndex(self.local_index(index)))
                {
                    on_disk.push(index);
                } else if self.coordinator.have_free_writing_slots()
                    && self.coordinator.request_ram_block()
                {
                    let request = self.request_block_locked(&mut dl, index, false);
                    if let Some(block) = dl.block_map.get_mut(&index) {
                        block.refcnt += 1;
                    }
                    taken.push(index);
                    pending.push(index);
                    fetches.push(request);
                } else {
                    direct.push(index);
                }
            }
        }
        trace!(
            event = "read_classified",
            offset,
            len = req_len,
            in_flight = pending.len(),
            on_disk = on_disk.len(),
            direct = direct.len()
        );

        // Issue the cache fetches with the lock released; an issue failure
        // is delivered as a block failure so every waiter observes it.
        for request in fetches {
            self.issue_fetch(request);
        }

        let mut outcome: Result<()> = Ok(());
        let mut bytes_read = 0_usize;

        // Direct origin reads bypassing the block map.
        let mut waiter: Option<Arc<DirectWaiter>> = None;
        let mut direct_meta: Vec<(usize, usize)> = Vec::new();
        if !direct.is_empty() {
            let overlaps: Vec<(u64, Overlap)> = direct
                .iter()
                .filter_map(|&index| overlap(index, bs, offset, req_len).map(|o| (index, o)))
                .collect();
            let aggregate = DirectWaiter::new(overlaps.len());
            for (slot, (index, o)) in overlaps.iter().enumerate() {
                let origin_off = index * bs + o.block_off as u64;
                let completion = ReadCompletion::Direct {
                    waiter: Arc::clone(&aggregate),
                    slot,
                };
                match self.source.read_at(origin_off, o.len, completion) {
                    Ok(()) => direct_meta.push((o.user_off, o.len)),
                    Err(err) => {
                        error!(event = "direct_issue_failed", index, error = %err);
                        outcome = Err(err);
                        break;
                    }
                }
            }
            waiter = Some(aggregate);
        }

        // Disk-resident blocks, read synchronously in place.
        if outcome.is_ok() && !on_disk.is_empty() {
            let mut disk_total = 0_usize;
            for &index in &on_disk {
                let Some(o) = overlap(index, bs, offset, req_len) else {
                    continue;
                };
                let disk_off = index * bs + o.block_off as u64 - self.offset;
                let dst = &mut buf[o.user_off..o.user_off + o.len];
                match self.data_file.read_at(dst, disk_off) {
                    Ok(n) if n == o.len => disk_total += n,
                    Ok(n) => {
                        error!(event = "disk_short_read", index, wanted = o.len, got = n);
                        outcome = Err(CacheError::ShortRead { index });
                        break;
                    }
                    Err(err) => {
                        error!(event = "disk_read_failed", index, error = %err);
                        outcome = Err(err);
                        break;
                    }
                }
            }
            if outcome.is_ok() {
                bytes_read += disk_total;
                self.counters
                    .bytes_disk
                    .fetch_add(disk_total as i64, Ordering::Relaxed);
                if self.prefetch_enabled {
                    let dl = self.download.lock();
                    let hits = on_disk
                        .iter()
                        .filter(|&&index| {
                            dl.cinfo
                                .test_prefetch(BlockIndex(self.local_index(index)))
                        })
                        .count() as u64;
                    drop(dl);
                    if hits > 0 {
                        self.prefetch_hit_cnt.fetch_add(hits, Ordering::Relaxed);
                    }
                }
            }
        }

        // Blocks in RAM or in flight: wait, then copy out under the lock.
        while outcome.is_ok() && !pending.is_empty() {
            let mut dl = self.download.lock();
            let mut finished: Vec<u64> = Vec::new();
            loop {
                for &index in &pending {
                    let done = dl.block_map.get(&index).is_some_and(Block::is_finished);
                    if done {
                        finished.push(index);
                    }
                }
                if !finished.is_empty() {
                    pending.retain(|index| !finished.contains(index));
                    break;
                }
                // Broadcasts coalesce; re-check the full set after waking.
                self.download_cond.wait(&mut dl);
            }

            for &index in &finished {
                let Some(block) = dl.block_map.get(&index) else {
                    continue;
                };
                if block.downloaded {
                    let Some(o) = overlap(index, bs, offset, req_len) else {
                        continue;
                    };
                    let Some(data) = block.data.as_ref() else {
                        continue;
                    };
                    debug_assert!(o.block_off + o.len <= data.len());
                    buf[o.user_off..o.user_off + o.len]
                        .copy_from_slice(&data.as_slice()[o.block_off..o.block_off + o.len]);
                    bytes_read += o.len;
                    self.counters
                        .bytes_ram
                        .fetch_add(o.len as i64, Ordering::Relaxed);
                    if self.prefetch_enabled && block.prefetch {
                        self.prefetch_hit_cnt.fetch_add(1, Ordering::Relaxed);
                    }
                } else {
                    warn!(event = "read_failed_block", index, errno = block.errno);
                    outcome = Err(CacheError::Origin { errno: block.errno });
                    break;
                }
            }
        }

        // Direct reads must all have arrived before their bytes count.
        if outcome.is_ok() {
            if let Some(aggregate) = waiter {
                match aggregate.wait() {
                    Ok(chunks) => {
                        let mut direct_size = 0_usize;
                        for (chunk, &(user_off, len)) in chunks.iter().zip(direct_meta.iter()) {
                            debug_assert_eq!(chunk.len(), len);
                            let n = len.min(chunk.len());
                            buf[user_off..user_off + n].copy_from_slice(&chunk[..n]);
                            direct_size += n;
                        }
                        bytes_read += direct_size;
                        self.counters
                            .bytes_missed
                            .fetch_add(direct_size as i64, Ordering::Relaxed);
                    }
                    Err(errno) => {
                        warn!(event = "direct_read_failed", errno);
                        outcome = Err(CacheError::Origin { errno });
                    }
                }
            }
        }

        debug_assert!(bytes_read <= req_len);

        // Release every block this read took, error or not.
        {
            let mut dl = self.download.lock();
            for index in taken {
                self.dec_ref_locked(&mut dl, index);
            }
        }

        outcome.map(|()| bytes_read)
    }

    /// Allocate a block, record it in the map, and prepare its fetch.
    ///
    /// Called with the download lock held; the fetch itself is issued by
    /// the caller after the lock is released. The new block starts at
    /// ref-count zero. Growing the map past the hold threshold pauses
    /// prefetch.
    fn request_block_locked(
        &self,
        dl: &mut DownloadState,
        index: u64,
        prefetch: bool,
    ) -> FetchRequest {
        let bs = self.buffer_size.get();
        let local = self.local_index(index);
        let bits = dl.cinfo.bits_total();
        debug_assert!(local < bits);

        let offset = index * bs;
        let range_len = self.file_size - self.offset;
        let len = if local == bits - 1 {
            (range_len - local * bs) as usize
        } else {
            bs as usize
        };

        trace!(event = "block_requested", index, len, prefetch);
        dl.block_map.insert(index, Block::new(offset, len, prefetch));

        if self.prefetch_enabled
            && dl.block_map.len() > self.coordinator.config().prefetch_max_blocks
        {
            let mut st = self.state.lock();
            if *st == PrefetchState::On {
                *st = PrefetchState::Hold;
                drop(st);
                debug!(event = "prefetch_hold", path = %self.path.display());
                self.coordinator.deregister_prefetch_file(self);
            }
        }

        FetchRequest { index, offset, len }
    }

    fn issue_fetch(&self, request: FetchRequest) {
        let sink: Weak<dyn ResponseSink> = self.self_weak.clone();
        let completion = ReadCompletion::for_block(sink, BlockIndex(request.index));
        if let Err(err) = self.source.read_at(request.offset, request.len, completion) {
            warn!(event = "fetch_issue_failed", index = request.index, error = %err);
            self.process_block_response(BlockIndex(request.index), Err(err.to_errno()));
        }
    }

    /// Handle one origin fetch completion.
    ///
    /// Success takes a queue reference and enqueues the block for
    /// writeback; failure is sticky and retains the block until its
    /// readers have drained and the close-time sweep drops it.
    fn process_block_response(&self, index: BlockIndex, result: ReadResult) {
        let mut enqueue: Option<Arc<CachedFile>> = None;
        {
            let mut dl = self.download.lock();
            let Some(block) = dl.block_map.get_mut(&index.0) else {
                warn!(event = "response_without_block", index = index.0);
                return;
            };
            if block.is_finished() {
                warn!(event = "duplicate_block_response", index = index.0);
                return;
            }
            match result {
                Ok(bytes) if bytes.len() == block.len => {
                    trace!(event = "block_downloaded", index = index.0, len = bytes.len());
                    block.set_downloaded(BlockBuf::from(bytes));
                    block.refcnt += 1; // held by the write queue
                    enqueue = self.self_weak.upgrade();
                }
                Ok(bytes) => {
                    warn!(
                        event = "block_response_truncated",
                        index = index.0,
                        wanted = block.len,
                        got = bytes.len()
                    );
                    block.set_error(libc::EIO);
                    block.refcnt += 1; // retained so readers observe the failure
                }
                Err(errno) => {
                    warn!(event = "block_fetch_failed", index = index.0, errno);
                    block.set_error(errno);
                    block.refcnt += 1; // retained so readers observe the failure
                }
            }
        }
        if let Some(file) = enqueue {
            self.coordinator.add_write_task(file, index, true);
        }
        self.download_cond.notify_all();
    }

    /// Copy one downloaded block to the data file.
    ///
    /// Runs on a write-queue worker. Short writes and `EINTR` are retried
    /// up to the configured limit; on exhaustion (or a hard error) the
    /// write is abandoned: the present bit stays clear, the queue
    /// reference is dropped, and a later read re-fetches from the origin.
    pub(crate) fn write_block_to_disk(&self, index: BlockIndex) {
        let (data, was_prefetch) = {
            let dl = self.download.lock();
            let Some(block) = dl.block_map.get(&index.0) else {
                warn!(event = "writeback_block_missing", index = index.0);
                return;
            };
            debug_assert!(block.downloaded);
            let Some(data) = block.data.clone() else {
                warn!(event = "writeback_block_empty", index = index.0);
                return;
            };
            (data, block.prefetch)
        };

        let bytes = data.as_slice();
        let disk_off = index.0 * self.buffer_size.get() - self.offset;
        let mut written = 0_usize;
        let mut attempts = 0_u32;
        let mut surrendered = false;
        while written < bytes.len() {
            attempts += 1;
            if attempts > self.write_retry_limit {
                error!(
                    event = "writeback_retries_exhausted",
                    index = index.0,
                    written,
                    len = bytes.len()
                );
                surrendered = true;
                break;
            }
            match self
                .data_file
                .write_at(&bytes[written..], disk_off + written as u64)
            {
                Ok(n) => {
                    written += n;
                    if written < bytes.len() {
                        warn!(
                            event = "writeback_short_write",
                            index = index.0,
                            attempt = attempts,
                            missing = bytes.len() - written
                        );
                    }
                }
                Err(err) if is_eintr(&err) => {}
                Err(err) => {
                    error!(event = "writeback_failed", index = index.0, error = %err);
                    surrendered = true;
                    break;
                }
            }
        }

        let local = self.local_index(index.0);
        {
            let mut dl = self.download.lock();
            if !surrendered {
                debug_assert!(
                    !dl.cinfo.test_present(BlockIndex(local)),
                    "present bit set twice for one block"
                );
                dl.cinfo.set_present(BlockIndex(local));
                if was_prefetch {
                    dl.cinfo.set_prefetch(BlockIndex(local));
                }
            }
            self.dec_ref_locked(&mut dl, index.0);
        }
        if surrendered {
            return;
        }
        trace!(event = "block_persisted", index = index.0);

        let mut schedule_sync = false;
        {
            let mut st = self.sync_state.lock();
            if st.in_sync {
                st.writes_during_sync.push(local);
            } else {
                bitmap_set(&mut st.write_called, local);
                st.non_flushed_cnt += 1;
                if st.non_flushed_cnt >= self.sync_threshold {
                    schedule_sync = true;
                    st.in_sync = true;
                    st.non_flushed_cnt = 0;
                }
            }
        }
        if schedule_sync {
            if let Some(file) = self.self_weak.upgrade() {
                self.coordinator.schedule_sync(file);
            }
        }
    }

    /// Flush data to stable storage and persist the info header.
    ///
    /// Runs as a one-shot scheduler job when enough writes accumulate, and
    /// once more at close if writes are still unflushed. Writes that
    /// complete while the sync runs are merged into the write-called
    /// bitmap only after the data fsync, preserving their ordering.
    pub fn sync(&self) -> Result<()> {
        debug!(event = "sync_begin", path = %self.path.display());
        let data_res = self.data_file.fsync();
        let header_res = self.write_info_header();

        let deferred = {
            let mut st = self.sync_state.lock();
            let deferred = std::mem::take(&mut st.writes_during_sync);
            for &local in &deferred {
                bitmap_set(&mut st.write_called, local);
            }
            st.non_flushed_cnt = deferred.len() as u32;
            st.in_sync = false;
            deferred.len()
        };
        let info_res = self.info_file.fsync();

        debug!(event = "sync_end", deferred_writes = deferred);
        data_res.and(header_res).and(info_res)
    }

    fn write_info_header(&self) -> Result<()> {
        let mut snapshot = self.download.lock().cinfo.clone();
        snapshot.set_write_called_bytes(self.sync_state.lock().write_called.clone());
        snapshot.write_header(&*self.info_file)
    }

    /// Shutdown query: stop prefetch, sweep retained failed blocks, and
    /// report whether I/O is still active.
    ///
    /// Returns `true` while the block map is non-empty or a sync job is
    /// running; the owner polls until `false` before dropping the file.
    pub fn io_active(&self) -> bool {
        {
            let mut st = self.state.lock();
            if *st != PrefetchState::Stopped {
                *st = PrefetchState::Stopped;
                drop(st);
                self.coordinator.deregister_prefetch_file(self);
            }
        }

        let map_empty = {
            let mut dl = self.download.lock();
            let stale: Vec<u64> = dl
                .block_map
                .iter()
                .filter(|(_, block)| block.failed && block.refcnt == 1)
                .map(|(&index, _)| index)
                .collect();
            for index in stale {
                debug!(event = "failed_block_dropped", index);
                self.free_block_locked(&mut dl, index);
            }
            dl.block_map.is_empty()
        };

        if map_empty {
            let st = self.sync_state.lock();
            if !st.in_sync {
                return false;
            }
        }
        true
    }

    /// Re-adopt an engine that was stopped for close: resume prefetch
    /// unless the file is already complete.
    pub fn wake_up(&self) {
        if !self.prefetch_enabled {
            return;
        }
        let mut st = self.state.lock();
        if *st != PrefetchState::Complete && *st != PrefetchState::On {
            *st = PrefetchState::On;
            drop(st);
            debug!(event = "prefetch_wakeup", path = %self.path.display());
            if let Some(file) = self.self_weak.upgrade() {
                self.coordinator.register_prefetch_file(&file);
            }
        }
    }

    /// Detach the engine: flush outstanding writes, append the session's
    /// I/O statistics to the side-car, and fsync it.
    ///
    /// Idempotent; the owner calls this after `io_active()` reports false.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let needs_sync = {
            let st = self.sync_state.lock();
            st.non_flushed_cnt > 0 || !st.writes_during_sync.is_empty()
        };
        let sync_res = if needs_sync { self.sync() } else { Ok(()) };
        if let Err(err) = &sync_res {
            warn!(event = "close_sync_failed", error = %err);
        }

        let stats = self.stats();
        let record = IoStatRecord {
            detach_time: unix_now(),
            bytes_disk: stats.bytes_disk,
            bytes_ram: stats.bytes_ram,
            bytes_missed: stats.bytes_missed,
        };
        if let Err(err) = append_stat_record(&*self.info_file, record) {
            warn!(event = "stat_append_failed", error = %err);
        }
        self.info_file.fsync()?;

        info!(
            event = "file_closed",
            path = %self.path.display(),
            bytes_disk = stats.bytes_disk,
            bytes_ram = stats.bytes_ram,
            bytes_missed = stats.bytes_missed,
            prefetch_score = self.prefetch_score()
        );
        sync_res
    }

    /// One prefetch cycle: fetch the first unread block not already in
    /// flight, if the coordinator grants RAM for it.
    pub fn prefetch(&self) {
        if *self.state.lock() != PrefetchState::On {
            return;
        }

        let request = {
            let mut dl = self.download.lock();
            let bits = dl.cinfo.bits_total();
            let base = self.offset / self.buffer_size.get();
            let mut found: Option<FetchRequest> = None;
            for local in 0..bits {
                if dl.cinfo.test_present(BlockIndex(local)) {
                    continue;
                }
                let index = base + local;
                if dl.block_map.contains_key(&index) {
                    continue;
                }
                if !self.coordinator.request_ram_block() {
                    trace!(event = "prefetch_no_ram_permit");
                    return;
                }
                found = Some(self.request_block_locked(&mut dl, index, true));
                self.prefetch_read_cnt.fetch_add(1, Ordering::Relaxed);
                break;
            }
            found
        };

        match request {
            Some(request) => {
                trace!(event = "prefetch_issue", index = request.index);
                self.issue_fetch(request);
            }
            None => {
                {
                    let mut st = self.state.lock();
                    if *st == PrefetchState::On {
                        *st = PrefetchState::Complete;
                    }
                }
                debug!(event = "prefetch_complete", path = %self.path.display());
                self.coordinator.deregister_prefetch_file(self);
            }
        }
    }

    /// The coordinator discarded this block's queued writeback without
    /// running it; drop the queue's reference.
    pub(crate) fn block_removed_from_write_queue(&self, index: BlockIndex) {
        trace!(event = "write_queue_discard", index = index.0);
        let mut dl = self.download.lock();
        self.dec_ref_locked(&mut dl, index.0);
    }

    fn dec_ref_locked(&self, dl: &mut DownloadState, index: u64) {
        let Some(block) = dl.block_map.get_mut(&index) else {
            debug_assert!(false, "dec_ref on unmapped block {index}");
            return;
        };
        debug_assert!(block.refcnt > 0, "ref-count underflow on block {index}");
        block.refcnt = block.refcnt.saturating_sub(1);
        if block.refcnt == 0 && block.is_finished() {
            self.free_block_locked(dl, index);
        }
    }

    /// Erase the map entry, return the RAM permit, and resume prefetch if
    /// the map fell back below the hold threshold.
    fn free_block_locked(&self, dl: &mut DownloadState, index: u64) {
        trace!(event = "block_freed", index);
        dl.block_map.remove(&index);
        self.coordinator.ram_block_released();

        if self.prefetch_enabled
            && dl.block_map.len() < self.coordinator.config().prefetch_max_blocks
        {
            let mut st = self.state.lock();
            if *st == PrefetchState::Hold {
                *st = PrefetchState::On;
                drop(st);
                debug!(event = "prefetch_resume", path = %self.path.display());
                if let Some(file) = self.self_weak.upgrade() {
                    self.coordinator.register_prefetch_file(&file);
                }
            }
        }
    }

    // ── Observability ───────────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self) -> IoStats {
        IoStats {
            bytes_disk: self.counters.bytes_disk.load(Ordering::Relaxed),
            bytes_ram: self.counters.bytes_ram.load(Ordering::Relaxed),
            bytes_missed: self.counters.bytes_missed.load(Ordering::Relaxed),
        }
    }

    /// Fraction of prefetched blocks that later served a read; 1.0 before
    /// any prefetch is issued.
    #[must_use]
    pub fn prefetch_score(&self) -> f64 {
        let reads = self.prefetch_read_cnt.load(Ordering::Relaxed);
        if reads == 0 {
            1.0
        } else {
            self.prefetch_hit_cnt.load(Ordering::Relaxed) as f64 / reads as f64
        }
    }

    /// (prefetch fetches issued, prefetch hits observed).
    #[must_use]
    pub fn prefetch_counters(&self) -> (u64, u64) {
        (
            self.prefetch_read_cnt.load(Ordering::Relaxed),
            self.prefetch_hit_cnt.load(Ordering::Relaxed),
        )
    }

    #[must_use]
    pub fn prefetch_state(&self) -> PrefetchState {
        *self.state.lock()
    }

    /// Blocks currently resident in the map.
    #[must_use]
    pub fn resident_blocks(&self) -> usize {
        self.download.lock().block_map.len()
    }

    /// Every block is persisted to the data file.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.download.lock().cinfo.is_complete()
    }

    /// A sync job is currently running.
    #[must_use]
    pub fn in_sync(&self) -> bool {
        self.sync_state.lock().in_sync
    }

    /// Completed writes not yet covered by a sync.
    #[must_use]
    pub fn non_flushed_writes(&self) -> u32 {
        self.sync_state.lock().non_flushed_cnt
    }

    /// Whether the write-called bit for `index` is set.
    #[must_use]
    pub fn write_called_contains(&self, index: BlockIndex) -> bool {
        let local = self.local_index(index.0);
        hoard_types::bitmap_get(&self.sync_state.lock().write_called, local)
    }
}

impl ResponseSink for CachedFile {
    fn block_response(&self, index: BlockIndex, result: ReadResult) {
        self.process_block_response(index, result);
    }
}

impl Drop for CachedFile {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(err) = self.close() {
                warn!(event = "close_on_drop_failed", path = %self.path.display(), error = %err);
            }
        }
    }
}
