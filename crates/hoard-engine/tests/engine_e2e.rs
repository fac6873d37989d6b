#![forbid(unsafe_code)]
//! End-to-end exercises of the block engine against an in-memory origin
//! and tempfile-backed cache files.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hoard_engine::{CacheConfig, CacheCoordinator, CachedFile, PrefetchState};
use hoard_error::CacheError;
use hoard_io::{InlineScheduler, Job, MemFile, MemRemoteSource, Scheduler};
use hoard_types::BlockIndex;
use parking_lot::Mutex;
use tempfile::TempDir;

const BS: u64 = 1024;
const FILE_SIZE: u64 = 3000;

fn origin_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn test_config() -> CacheConfig {
    CacheConfig {
        buffer_size: BS,
        prefetch_max_blocks: 8,
        ram_budget_blocks: 64,
        writing_slots_max: 64,
        ..CacheConfig::default()
    }
}

struct Harness {
    coordinator: Arc<CacheCoordinator>,
    source: Arc<MemRemoteSource>,
    dir: TempDir,
}

fn harness(config: CacheConfig, content_len: usize) -> Harness {
    let coordinator = CacheCoordinator::new(config, Arc::new(InlineScheduler)).unwrap();
    let source = Arc::new(MemRemoteSource::new(origin_content(content_len)));
    Harness {
        coordinator,
        source,
        dir: TempDir::new().unwrap(),
    }
}

fn open_file(h: &Harness, name: &str, file_size: u64) -> Arc<CachedFile> {
    CachedFile::open(
        Arc::clone(&h.coordinator),
        h.source.clone(),
        h.dir.path().join(name),
        0,
        file_size,
    )
    .unwrap()
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

/// Captures scheduled jobs for manual, deterministic execution.
#[derive(Default)]
struct DeferredScheduler {
    jobs: Mutex<Vec<Box<dyn Job>>>,
}

impl Scheduler for DeferredScheduler {
    fn schedule(&self, job: Box<dyn Job>) {
        self.jobs.lock().push(job);
    }
}

impl DeferredScheduler {
    fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    fn run_next(&self) -> bool {
        let job = {
            let mut jobs = self.jobs.lock();
            if jobs.is_empty() {
                return false;
            }
            jobs.remove(0)
        };
        job.run();
        true
    }
}

#[test]
fn cold_read_populates_cache() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let file = open_file(&h, "blob", FILE_SIZE);

    let mut buf = vec![0_u8; 2000];
    let n = file.read(&mut buf, 500).unwrap();
    assert_eq!(n, 2000);
    assert_eq!(buf, origin_content(FILE_SIZE as usize)[500..2500]);

    // All three blocks were fetched, written back, and released.
    assert!(file.is_complete());
    assert_eq!(file.resident_blocks(), 0);
    assert_eq!(h.coordinator.ram_blocks_in_use(), 0);

    let stats = file.stats();
    assert_eq!(stats.bytes_ram, 2000);
    assert_eq!(stats.bytes_disk, 0);
    assert_eq!(stats.bytes_missed, 0);
    assert_eq!(h.source.fetch_count(), 3);
}

#[test]
fn warm_read_after_reopen_serves_from_disk() {
    let h = harness(test_config(), FILE_SIZE as usize);
    {
        let file = open_file(&h, "blob", FILE_SIZE);
        let mut buf = vec![0_u8; FILE_SIZE as usize];
        assert_eq!(file.read(&mut buf, 0).unwrap(), FILE_SIZE as usize);
        file.close().unwrap();
    }
    let fetched_cold = h.source.fetch_count();

    let file = open_file(&h, "blob", FILE_SIZE);
    assert!(file.is_complete());
    assert_eq!(file.prefetch_state(), PrefetchState::Complete);

    let mut buf = vec![0_u8; 1024];
    assert_eq!(file.read(&mut buf, 0).unwrap(), 1024);
    assert_eq!(buf, origin_content(FILE_SIZE as usize)[..1024]);

    let stats = file.stats();
    assert_eq!(stats.bytes_disk, 1024);
    assert_eq!(stats.bytes_missed, 0);
    assert_eq!(h.source.fetch_count(), fetched_cold, "warm read must not touch the origin");
}

#[test]
fn reopen_complete_serves_everything_from_disk() {
    let h = harness(test_config(), FILE_SIZE as usize);
    {
        let file = open_file(&h, "blob", FILE_SIZE);
        let mut buf = vec![0_u8; FILE_SIZE as usize];
        assert_eq!(file.read(&mut buf, 0).unwrap(), FILE_SIZE as usize);
        file.close().unwrap();
    }
    let fetched_cold = h.source.fetch_count();

    let file = open_file(&h, "blob", FILE_SIZE);
    let mut buf = vec![0_u8; FILE_SIZE as usize];
    assert_eq!(file.read(&mut buf, 0).unwrap(), FILE_SIZE as usize);
    assert_eq!(buf, origin_content(FILE_SIZE as usize));
    assert_eq!(file.stats().bytes_missed, 0);
    assert_eq!(h.source.fetch_count(), fetched_cold);
}

#[test]
fn concurrent_readers_share_one_fetch() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let file = open_file(&h, "blob", FILE_SIZE);

    h.source.hold();

    let mut readers = Vec::new();
    for _ in 0..2 {
        let file = Arc::clone(&file);
        readers.push(std::thread::spawn(move || {
            let mut buf = vec![0_u8; 1024];
            let n = file.read(&mut buf, 0).unwrap();
            (n, buf)
        }));
    }

    // Both readers are parked on the same in-flight block.
    assert!(wait_until(Duration::from_secs(5), || file.resident_blocks() == 1));
    assert_eq!(h.source.fetch_count(), 1);

    h.source.release_held();

    for reader in readers {
        let (n, buf) = reader.join().unwrap();
        assert_eq!(n, 1024);
        assert_eq!(buf, origin_content(FILE_SIZE as usize)[..1024]);
    }

    assert_eq!(h.source.fetch_count(), 1, "exactly one origin fetch per block");
    assert_eq!(file.resident_blocks(), 0, "ref-count drained back to zero");
    assert_eq!(h.coordinator.ram_blocks_in_use(), 0);
}

#[test]
fn exhausted_ram_budget_redirects_to_direct_io() {
    let config = CacheConfig {
        ram_budget_blocks: 0,
        ..test_config()
    };
    let h = harness(config, FILE_SIZE as usize);
    let file = open_file(&h, "blob", FILE_SIZE);

    let mut buf = vec![0_u8; 1024];
    let n = file.read(&mut buf, 0).unwrap();
    assert_eq!(n, 1024);
    assert_eq!(buf, origin_content(FILE_SIZE as usize)[..1024]);

    assert_eq!(file.stats().bytes_missed, 1024);
    assert_eq!(file.resident_blocks(), 0, "direct reads bypass the block map");
    assert!(!file.is_complete(), "direct reads are not cached");
    assert_eq!(h.source.fetch_count(), 1);
}

#[test]
fn origin_failure_is_sticky_for_the_session() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let file = open_file(&h, "blob", FILE_SIZE);

    h.source.fail_at(1024, libc::EPIPE);

    let mut buf = vec![0_u8; FILE_SIZE as usize];
    let err = file.read(&mut buf, 0).unwrap_err();
    assert_eq!(err.to_errno(), libc::EPIPE);

    // Blocks 0 and 2 were written back and released; block 1 is retained
    // as failed.
    assert_eq!(file.resident_blocks(), 1);
    let failing_fetches = || {
        h.source
            .fetch_log()
            .iter()
            .filter(|&&(off, _)| off == 1024)
            .count()
    };
    assert_eq!(failing_fetches(), 1);

    // A second read observes the sticky failure without a new fetch.
    let err = file.read(&mut buf, 0).unwrap_err();
    assert_eq!(err.to_errno(), libc::EPIPE);
    assert_eq!(failing_fetches(), 1, "failed block must not be retried in-session");

    // The close-time sweep drops the retained failure.
    assert!(!file.io_active());
    assert_eq!(file.resident_blocks(), 0);
    assert_eq!(h.coordinator.ram_blocks_in_use(), 0);
    file.close().unwrap();
}

#[test]
fn sync_job_batches_after_threshold() {
    const BLOCKS: u64 = 120;
    const SMALL_BS: u64 = 64;
    let scheduler = Arc::new(DeferredScheduler::default());
    let config = CacheConfig {
        buffer_size: SMALL_BS,
        prefetch_max_blocks: 0,
        ram_budget_blocks: 256,
        writing_slots_max: 256,
        ..CacheConfig::default()
    };
    let coordinator = CacheCoordinator::new(config, Arc::clone(&scheduler) as Arc<dyn Scheduler>)
        .unwrap();
    let content = origin_content((BLOCKS * SMALL_BS) as usize);
    let source = Arc::new(MemRemoteSource::new(content.clone()));
    let dir = TempDir::new().unwrap();
    let file = CachedFile::open(
        Arc::clone(&coordinator),
        source,
        dir.path().join("blob"),
        0,
        BLOCKS * SMALL_BS,
    )
    .unwrap();

    // Fetch every block; writebacks queue up behind one drain job.
    for index in 0..BLOCKS {
        let mut buf = vec![0_u8; SMALL_BS as usize];
        assert_eq!(file.read(&mut buf, index * SMALL_BS).unwrap(), SMALL_BS as usize);
        assert_eq!(buf, content[(index * SMALL_BS) as usize..((index + 1) * SMALL_BS) as usize]);
    }
    assert_eq!(file.resident_blocks(), BLOCKS as usize);
    assert_eq!(scheduler.pending(), 1, "a single drain job covers all queued writes");

    // Drain: 100 writes trip the threshold, the rest land mid-sync.
    assert!(scheduler.run_next());
    assert!(file.in_sync());
    assert_eq!(scheduler.pending(), 1, "exactly one sync job enqueued");
    assert_eq!(file.resident_blocks(), 0);
    assert!(file.write_called_contains(BlockIndex(99)));
    assert!(
        !file.write_called_contains(BlockIndex(100)),
        "writes completed during sync are deferred"
    );
    assert_eq!(file.non_flushed_writes(), 0);

    // Run the sync job: deferred writes surface in the bitmap.
    assert!(scheduler.run_next());
    assert!(!file.in_sync());
    assert!(file.write_called_contains(BlockIndex(100)));
    assert!(file.write_called_contains(BlockIndex(119)));
    assert_eq!(file.non_flushed_writes(), 20);
    assert!(file.is_complete());
}

#[test]
fn sync_with_nothing_pending_is_a_noop_on_disk() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let data = MemFile::new();
    let info = MemFile::new();
    let file = CachedFile::open_with_backends(
        Arc::clone(&h.coordinator),
        h.source.clone(),
        Box::new(data),
        Box::new(info),
        h.dir.path().join("mem-blob"),
        0,
        FILE_SIZE,
    )
    .unwrap();

    assert_eq!(file.non_flushed_writes(), 0);
    file.sync().unwrap();
    assert!(!file.in_sync());
    assert_eq!(file.non_flushed_writes(), 0);
    assert!(!file.is_complete());
}

#[test]
fn prefetch_fills_the_file_and_completes() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let file = open_file(&h, "blob", FILE_SIZE);

    assert_eq!(file.prefetch_state(), PrefetchState::On);
    assert_eq!(h.coordinator.prefetch_file_count(), 1);

    for _ in 0..3 {
        h.coordinator.prefetch_tick();
    }
    assert!(file.is_complete());
    assert_eq!(file.prefetch_counters().0, 3);
    assert_eq!(file.resident_blocks(), 0);

    // The next cycle finds nothing to do and latches completion.
    h.coordinator.prefetch_tick();
    assert_eq!(file.prefetch_state(), PrefetchState::Complete);
    assert_eq!(h.coordinator.prefetch_file_count(), 0);

    // Reads served from prefetched blocks on disk count as hits.
    let mut buf = vec![0_u8; FILE_SIZE as usize];
    assert_eq!(file.read(&mut buf, 0).unwrap(), FILE_SIZE as usize);
    assert_eq!(buf, origin_content(FILE_SIZE as usize));
    let (reads, hits) = file.prefetch_counters();
    assert_eq!(reads, 3);
    assert_eq!(hits, 3);
    assert!((file.prefetch_score() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn prefetched_block_served_from_ram_counts_as_hit() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let file = open_file(&h, "blob", FILE_SIZE);

    h.source.hold();
    h.coordinator.prefetch_tick();
    assert_eq!(file.resident_blocks(), 1);

    let reader = {
        let file = Arc::clone(&file);
        std::thread::spawn(move || {
            let mut buf = vec![0_u8; 1024];
            let n = file.read(&mut buf, 0).unwrap();
            (n, buf)
        })
    };
    // The reader coalesces onto the in-flight prefetch.
    assert!(wait_until(Duration::from_secs(5), || h.source.fetch_count() == 1));
    std::thread::sleep(Duration::from_millis(20));
    h.source.release_held();

    let (n, buf) = reader.join().unwrap();
    assert_eq!(n, 1024);
    assert_eq!(buf, origin_content(FILE_SIZE as usize)[..1024]);

    let (reads, hits) = file.prefetch_counters();
    assert_eq!(reads, 1);
    assert_eq!(hits, 1);
    assert_eq!(h.source.fetch_count(), 1);
}

#[test]
fn map_growth_holds_prefetch_and_release_resumes_it() {
    let config = CacheConfig {
        prefetch_max_blocks: 2,
        ..test_config()
    };
    let h = harness(config, FILE_SIZE as usize);
    let file = open_file(&h, "blob", FILE_SIZE);
    assert_eq!(file.prefetch_state(), PrefetchState::On);

    h.source.hold();
    let reader = {
        let file = Arc::clone(&file);
        std::thread::spawn(move || {
            let mut buf = vec![0_u8; FILE_SIZE as usize];
            file.read(&mut buf, 0).map(|n| (n, buf))
        })
    };

    assert!(wait_until(Duration::from_secs(5), || file.resident_blocks() == 3));
    assert_eq!(file.prefetch_state(), PrefetchState::Hold);
    assert_eq!(h.coordinator.prefetch_file_count(), 0);

    h.source.release_held();
    let (n, buf) = reader.join().unwrap().unwrap();
    assert_eq!(n, FILE_SIZE as usize);
    assert_eq!(buf, origin_content(FILE_SIZE as usize));

    assert_eq!(file.resident_blocks(), 0);
    assert_eq!(file.prefetch_state(), PrefetchState::On);
    assert_eq!(h.coordinator.prefetch_file_count(), 1);
}

#[test]
fn writeback_retry_exhaustion_leaves_block_uncached() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let data = MemFile::new();
    // Ten zero-progress writes exhaust the default retry limit.
    for _ in 0..10 {
        data.push_write_cap(0);
    }
    let file = CachedFile::open_with_backends(
        Arc::clone(&h.coordinator),
        h.source.clone(),
        Box::new(data),
        Box::new(MemFile::new()),
        h.dir.path().join("mem-blob"),
        0,
        FILE_SIZE,
    )
    .unwrap();

    let mut buf = vec![0_u8; 1024];
    assert_eq!(file.read(&mut buf, 0).unwrap(), 1024);
    assert_eq!(buf, origin_content(FILE_SIZE as usize)[..1024]);

    // The write surrendered: nothing cached, block released, budget intact.
    assert!(!file.is_complete());
    assert_eq!(file.resident_blocks(), 0);
    assert_eq!(h.coordinator.ram_blocks_in_use(), 0);

    // A later read re-fetches from the origin and caches normally.
    assert_eq!(file.read(&mut buf, 0).unwrap(), 1024);
    assert_eq!(h.source.fetch_count(), 2);
}

#[test]
fn writeback_retries_through_eintr() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let data = MemFile::new();
    data.push_write_error(libc::EINTR);
    let file = CachedFile::open_with_backends(
        Arc::clone(&h.coordinator),
        h.source.clone(),
        Box::new(data),
        Box::new(MemFile::new()),
        h.dir.path().join("mem-blob"),
        0,
        FILE_SIZE,
    )
    .unwrap();

    let mut buf = vec![0_u8; 1024];
    assert_eq!(file.read(&mut buf, 0).unwrap(), 1024);

    // The interrupted write was retried and the block persisted.
    let mut warm = vec![0_u8; 1024];
    assert_eq!(file.read(&mut warm, 0).unwrap(), 1024);
    assert_eq!(warm, buf);
    assert_eq!(file.stats().bytes_disk, 1024);
    assert_eq!(h.source.fetch_count(), 1);
}

#[test]
fn open_rejects_bad_preexisting_sidecars() {
    let h = harness(test_config(), FILE_SIZE as usize);

    // Existing but empty side-car.
    let data_path = h.dir.path().join("empty-info");
    std::fs::write(data_path.with_file_name("empty-info.cinfo"), b"").unwrap();
    let err = CachedFile::open(
        Arc::clone(&h.coordinator),
        h.source.clone(),
        &data_path,
        0,
        FILE_SIZE,
    )
    .unwrap_err();
    assert!(matches!(err, CacheError::OpenFailure(_)));

    // Geometry disagreement on reopen.
    let blob = h.dir.path().join("blob");
    {
        let file = CachedFile::open(
            Arc::clone(&h.coordinator),
            h.source.clone(),
            &blob,
            0,
            FILE_SIZE,
        )
        .unwrap();
        file.close().unwrap();
    }
    let err = CachedFile::open(
        Arc::clone(&h.coordinator),
        h.source.clone(),
        &blob,
        0,
        FILE_SIZE + 1,
    )
    .unwrap_err();
    assert!(matches!(err, CacheError::OpenFailure(_)));

    // Empty cached range.
    let err = CachedFile::open(
        Arc::clone(&h.coordinator),
        h.source.clone(),
        h.dir.path().join("empty-range"),
        0,
        0,
    )
    .unwrap_err();
    assert!(matches!(err, CacheError::OpenFailure(_)));
}

#[test]
fn prefetch_daemon_completes_an_idle_file() {
    let config = CacheConfig {
        prefetch_interval: Duration::from_millis(5),
        ..test_config()
    };
    let h = harness(config, FILE_SIZE as usize);
    let file = open_file(&h, "blob", FILE_SIZE);

    let daemon = h.coordinator.start_prefetch_daemon().unwrap();
    assert!(wait_until(Duration::from_secs(10), || file.is_complete()));
    daemon.shutdown();

    assert_eq!(file.prefetch_counters().0, 3);
    let mut buf = vec![0_u8; FILE_SIZE as usize];
    assert_eq!(file.read(&mut buf, 0).unwrap(), FILE_SIZE as usize);
    assert_eq!(buf, origin_content(FILE_SIZE as usize));
    assert_eq!(file.stats().bytes_disk, FILE_SIZE as i64);
}

#[test]
fn io_active_then_wake_up_resumes_prefetch() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let file = open_file(&h, "blob", FILE_SIZE);

    assert!(!file.io_active());
    assert_eq!(file.prefetch_state(), PrefetchState::Stopped);
    assert_eq!(h.coordinator.prefetch_file_count(), 0);

    file.wake_up();
    assert_eq!(file.prefetch_state(), PrefetchState::On);
    assert_eq!(h.coordinator.prefetch_file_count(), 1);
}

#[test]
fn coordinator_shutdown_discards_queued_writebacks() {
    let scheduler = Arc::new(DeferredScheduler::default());
    let coordinator =
        CacheCoordinator::new(test_config(), Arc::clone(&scheduler) as Arc<dyn Scheduler>)
            .unwrap();
    let source = Arc::new(MemRemoteSource::new(origin_content(FILE_SIZE as usize)));
    let dir = TempDir::new().unwrap();
    let file = CachedFile::open(
        Arc::clone(&coordinator),
        source,
        dir.path().join("blob"),
        0,
        FILE_SIZE,
    )
    .unwrap();

    let mut buf = vec![0_u8; 1024];
    assert_eq!(file.read(&mut buf, 0).unwrap(), 1024);
    assert_eq!(file.resident_blocks(), 1, "queued writeback keeps the block resident");

    coordinator.shutdown();
    assert_eq!(file.resident_blocks(), 0, "discarded task dropped its reference");
    assert_eq!(coordinator.ram_blocks_in_use(), 0);
    assert!(!file.is_complete(), "discarded write never set the present bit");

    // The stale drain job finds an empty queue.
    while scheduler.run_next() {}
}

#[test]
fn close_appends_session_statistics() {
    let h = harness(test_config(), FILE_SIZE as usize);
    let blob = h.dir.path().join("blob");
    {
        let file = CachedFile::open(
            Arc::clone(&h.coordinator),
            h.source.clone(),
            &blob,
            0,
            FILE_SIZE,
        )
        .unwrap();
        let mut buf = vec![0_u8; 1000];
        assert_eq!(file.read(&mut buf, 0).unwrap(), 1000);
        file.close().unwrap();
    }
    let info_file = hoard_io::FsFile::open(blob.with_file_name("blob.cinfo")).unwrap();
    let cfi = hoard_cinfo::CacheInfo::read_from(&info_file).unwrap();
    assert_eq!(cfi.stats().len(), 1);
    assert_eq!(cfi.stats()[0].bytes_ram, 1000);
    assert_eq!(cfi.stats()[0].bytes_disk, 0);
    assert_eq!(cfi.stats()[0].bytes_missed, 0);
}
