//! Process-wide admission control and background scheduling.
//!
//! The coordinator is the resource gate every file engine shares: it hands
//! out RAM-block permits against a global budget, bounds pending writeback
//! through writing slots, drains the write queue on scheduler workers,
//! keeps the registry of files eligible for prefetch, and hosts the
//! periodic prefetch tick.
//!
//! Its internal lock is always the innermost lock in the system: engines
//! may call into the coordinator while holding their own locks, but the
//! coordinator never calls back into an engine while holding its lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hoard_error::{CacheError, Result};
use hoard_io::Scheduler;
use hoard_types::BlockIndex;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::file::CachedFile;

/// Runtime configuration consumed by the cache core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Block buffer size in bytes. A power-of-two multiple of the
    /// filesystem block size is recommended.
    pub buffer_size: u64,
    /// Map-size threshold above which a file's prefetch is put on hold.
    /// Zero disables prefetch entirely.
    pub prefetch_max_blocks: usize,
    /// Owner tag recorded when cache files are created.
    pub username: String,
    /// Global budget of in-memory blocks. Zero forces every miss onto the
    /// direct origin path.
    pub ram_budget_blocks: usize,
    /// Maximum writeback tasks pending or in flight.
    pub writing_slots_max: usize,
    /// Completed writes accumulated before a disk sync is scheduled.
    pub sync_threshold: u32,
    /// Attempts per block write before writeback surrenders.
    pub write_retry_limit: u32,
    /// Tick period of the prefetch daemon.
    pub prefetch_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1 << 20,
            prefetch_max_blocks: 8,
            username: String::from("hoard"),
            ram_budget_blocks: 256,
            writing_slots_max: 16,
            sync_threshold: 100,
            write_retry_limit: 10,
            prefetch_interval: Duration::from_secs(1),
        }
    }
}

impl CacheConfig {
    pub fn validate(self) -> Result<Self> {
        if self.buffer_size == 0 {
            return Err(CacheError::Config("buffer_size must be > 0".to_owned()));
        }
        if self.writing_slots_max == 0 {
            return Err(CacheError::Config(
                "writing_slots_max must be > 0".to_owned(),
            ));
        }
        if self.sync_threshold == 0 {
            return Err(CacheError::Config("sync_threshold must be > 0".to_owned()));
        }
        if self.write_retry_limit == 0 {
            return Err(CacheError::Config(
                "write_retry_limit must be > 0".to_owned(),
            ));
        }
        if self.prefetch_interval.is_zero() {
            return Err(CacheError::Config(
                "prefetch_interval must be > 0".to_owned(),
            ));
        }
        Ok(self)
    }
}

struct WriteTask {
    file: Arc<CachedFile>,
    index: BlockIndex,
}

#[derive(Default)]
struct CoordinatorInner {
    ram_blocks: usize,
    write_queue: VecDeque<WriteTask>,
    /// Queued plus in-flight writeback tasks.
    writing_slots_in_use: usize,
    drain_scheduled: bool,
    prefetch_files: Vec<Arc<CachedFile>>,
    shut_down: bool,
}

/// Process-wide resource gate shared by all file engines.
pub struct CacheCoordinator {
    config: CacheConfig,
    scheduler: Arc<dyn Scheduler>,
    inner: Mutex<CoordinatorInner>,
}

impl CacheCoordinator {
    pub fn new(config: CacheConfig, scheduler: Arc<dyn Scheduler>) -> Result<Arc<Self>> {
        let config = config.validate()?;
        info!(
            event = "coordinator_start",
            buffer_size = config.buffer_size,
            ram_budget_blocks = config.ram_budget_blocks,
            writing_slots_max = config.writing_slots_max,
            prefetch_max_blocks = config.prefetch_max_blocks
        );
        Ok(Arc::new(Self {
            config,
            scheduler,
            inner: Mutex::new(CoordinatorInner::default()),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Try to take one RAM-block permit from the global budget.
    pub fn request_ram_block(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.ram_blocks < self.config.ram_budget_blocks {
            inner.ram_blocks += 1;
            true
        } else {
            trace!(event = "ram_budget_exhausted", in_use = inner.ram_blocks);
            false
        }
    }

    /// Return one RAM-block permit.
    pub fn ram_block_released(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.ram_blocks > 0);
        inner.ram_blocks = inner.ram_blocks.saturating_sub(1);
    }

    /// Currently allocated RAM blocks.
    #[must_use]
    pub fn ram_blocks_in_use(&self) -> usize {
        self.inner.lock().ram_blocks
    }

    /// Whether another writeback task may be admitted.
    #[must_use]
    pub fn have_free_writing_slots(&self) -> bool {
        self.inner.lock().writing_slots_in_use < self.config.writing_slots_max
    }

    /// Enqueue a block for writeback. The caller has already taken a
    /// reference on the block for the queue's benefit.
    ///
    /// With `schedule_now` a queue-drain job is posted immediately;
    /// otherwise the task waits for the next drain.
    pub fn add_write_task(self: &Arc<Self>, file: Arc<CachedFile>, index: BlockIndex, schedule_now: bool) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            drop(inner);
            warn!(event = "write_task_after_shutdown", index = index.0);
            file.block_removed_from_write_queue(index);
            return;
        }
        inner.write_queue.push_back(WriteTask { file, index });
        inner.writing_slots_in_use += 1;
        let post_drain = schedule_now && !inner.drain_scheduled;
        if post_drain {
            inner.drain_scheduled = true;
        }
        drop(inner);

        if post_drain {
            let coordinator = Arc::clone(self);
            self.scheduler
                .schedule(Box::new(move || coordinator.drain_write_queue()));
        }
    }

    fn drain_write_queue(&self) {
        loop {
            let task = {
                let mut inner = self.inner.lock();
                match inner.write_queue.pop_front() {
                    Some(task) => task,
                    None => {
                        inner.drain_scheduled = false;
                        return;
                    }
                }
            };
            task.file.write_block_to_disk(task.index);
            self.inner.lock().writing_slots_in_use -= 1;
        }
    }

    /// Post a disk-sync job for `file`.
    pub fn schedule_sync(&self, file: Arc<CachedFile>) {
        debug!(event = "sync_scheduled", path = %file.path().display());
        self.scheduler.schedule(Box::new(move || {
            if let Err(err) = file.sync() {
                warn!(
                    event = "sync_failed",
                    path = %file.path().display(),
                    error = %err
                );
            }
        }));
    }

    /// Make `file` eligible for prefetch ticks.
    pub fn register_prefetch_file(&self, file: &Arc<CachedFile>) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        let already = inner
            .prefetch_files
            .iter()
            .any(|f| Arc::ptr_eq(f, file));
        if !already {
            inner.prefetch_files.push(Arc::clone(file));
            trace!(
                event = "prefetch_file_registered",
                path = %file.path().display(),
                registered = inner.prefetch_files.len()
            );
        }
    }

    /// Remove `file` from the prefetch registry.
    pub fn deregister_prefetch_file(&self, file: &CachedFile) {
        let mut inner = self.inner.lock();
        inner
            .prefetch_files
            .retain(|f| !std::ptr::eq(Arc::as_ptr(f), file));
    }

    /// Registered prefetch files (test observability).
    #[must_use]
    pub fn prefetch_file_count(&self) -> usize {
        self.inner.lock().prefetch_files.len()
    }

    /// Run one prefetch cycle: pick the registered file with the best
    /// prefetch score and let it issue a speculative fetch.
    pub fn prefetch_tick(&self) {
        let picked = {
            let inner = self.inner.lock();
            let mut best: Option<&Arc<CachedFile>> = None;
            let mut best_score = f64::NEG_INFINITY;
            for file in &inner.prefetch_files {
                let score = file.prefetch_score();
                if score > best_score {
                    best_score = score;
                    best = Some(file);
                }
            }
            best.cloned()
        };
        if let Some(file) = picked {
            file.prefetch();
        }
    }

    /// Stop admitting work and discard the undrained write queue.
    ///
    /// Queued tasks are released through each engine's
    /// `block_removed_from_write_queue` so their queue references drop.
    pub fn shutdown(&self) {
        let discarded = {
            let mut inner = self.inner.lock();
            inner.shut_down = true;
            inner.prefetch_files.clear();
            let discarded: Vec<WriteTask> = inner.write_queue.drain(..).collect();
            inner.writing_slots_in_use = inner.writing_slots_in_use.saturating_sub(discarded.len());
            discarded
        };
        if !discarded.is_empty() {
            info!(event = "write_queue_discarded", tasks = discarded.len());
        }
        for task in discarded {
            task.file.block_removed_from_write_queue(task.index);
        }
    }
}

/// Handle for the background prefetch tick thread.
///
/// Stops and joins on `shutdown` or drop.
pub struct PrefetchDaemon {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PrefetchDaemon {
    /// Request shutdown and block until the daemon exits.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for PrefetchDaemon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl CacheCoordinator {
    /// Start the periodic prefetch tick at the configured interval.
    pub fn start_prefetch_daemon(self: &Arc<Self>) -> Result<PrefetchDaemon> {
        let interval = self.config.prefetch_interval;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let coordinator = Arc::clone(self);

        let join = std::thread::Builder::new()
            .name("hoard-prefetch".to_owned())
            .spawn(move || {
                info!(event = "prefetch_daemon_start", interval_ms = interval.as_millis() as u64);
                while !stop_flag.load(Ordering::Acquire) {
                    coordinator.prefetch_tick();
                    std::thread::sleep(interval);
                }
                info!(event = "prefetch_daemon_stop");
            })
            .map_err(CacheError::Io)?;

        Ok(PrefetchDaemon {
            stop,
            join: Some(join),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoard_io::InlineScheduler;

    fn coordinator_with(config: CacheConfig) -> Arc<CacheCoordinator> {
        CacheCoordinator::new(config, Arc::new(InlineScheduler)).unwrap()
    }

    #[test]
    fn config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig {
            buffer_size: 0,
            ..CacheConfig::default()
        }
        .validate()
        .is_err());
        assert!(CacheConfig {
            writing_slots_max: 0,
            ..CacheConfig::default()
        }
        .validate()
        .is_err());
        assert!(CacheConfig {
            sync_threshold: 0,
            ..CacheConfig::default()
        }
        .validate()
        .is_err());
        // A zero RAM budget is legal: every miss goes direct.
        assert!(CacheConfig {
            ram_budget_blocks: 0,
            ..CacheConfig::default()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn ram_permits_respect_budget() {
        let coordinator = coordinator_with(CacheConfig {
            ram_budget_blocks: 2,
            ..CacheConfig::default()
        });
        assert!(coordinator.request_ram_block());
        assert!(coordinator.request_ram_block());
        assert!(!coordinator.request_ram_block());
        assert_eq!(coordinator.ram_blocks_in_use(), 2);

        coordinator.ram_block_released();
        assert!(coordinator.request_ram_block());
    }

    #[test]
    fn zero_budget_never_grants() {
        let coordinator = coordinator_with(CacheConfig {
            ram_budget_blocks: 0,
            ..CacheConfig::default()
        });
        assert!(!coordinator.request_ram_block());
    }
}
